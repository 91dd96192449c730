//! SCSI subsystem configuration

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::x68k::scsi::MAX_TARGETS;

/// A hard disk image attached at a SCSI ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub id: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub enabled: bool,
    /// Boot ROM image, up to 8 KiB
    pub rom: Option<PathBuf>,
    pub disks: Vec<DiskConfig>,
}

impl PortConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            rom: None,
            disks: vec![],
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        for (i, disk) in self.disks.iter().enumerate() {
            if disk.id >= MAX_TARGETS {
                bail!("{} bus: invalid SCSI ID {} for {}", name, disk.id, disk.path.display());
            }
            if self.disks[..i].iter().any(|d| d.id == disk.id) {
                bail!("{} bus: SCSI ID {} assigned twice", name, disk.id);
            }
        }
        Ok(())
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rom: None,
            disks: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScsiConfig {
    /// Built-in bus (X68000 SUPER and later)
    pub internal: PortConfig,
    /// Expansion board bus (CZ-6BS1)
    pub external: PortConfig,
}

impl Default for ScsiConfig {
    fn default() -> Self {
        Self {
            internal: PortConfig::disabled(),
            external: PortConfig::default(),
        }
    }
}

impl ScsiConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid SCSI configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(filename: &Path) -> Result<Self> {
        let json = fs::read_to_string(filename)
            .with_context(|| format!("Failed to read {}", filename.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to load {}", filename.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.internal.validate("internal")?;
        self.external.validate("external")
    }
}
