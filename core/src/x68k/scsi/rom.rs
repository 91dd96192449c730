//! SCSI boot ROM images

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Size of the boot ROM window of a port
pub const ROM_SIZE: usize = 0x2000;

/// Offset of the built-in boot stub, directly after the register file
pub const ROM_STUB_OFFSET: usize = 0x20;

/// Minimal boot stub served by the external port when no ROM is loaded.
/// Carries the "Human68k" and "SCSIEX" identifiers the IPL scans for.
const ROM_STUB: [u8; 50] = [
    0x00, 0xEA, 0x00, 0x34, 0x00, 0xEA, 0x00, 0x36, 0x00, 0xEA, 0x00, 0x4A, // vectors
    0x48, 0x75, 0x6D, 0x61, 0x6E, 0x36, 0x38, 0x6B, // "Human68k"
    0x4E, 0x75, // rts
    0x23, 0xFC, 0x00, 0xEA, 0x00, 0x4A, 0x00, 0x00, 0x07, 0xD4, // move.l #$ea004a,$7d4
    0x74, 0xFF, // moveq #-1,d2
    0x4E, 0x75, // rts
    0x53, 0x43, 0x53, 0x49, 0x45, 0x58, // "SCSIEX"
    0x13, 0xC1, 0x00, 0xE9, 0xF8, 0x00, // move.b d1,$e9f800
    0x4E, 0x75, // rts
];

/// Boot ROM contents of one port, in CPU byte order
#[derive(Debug)]
pub struct ScsiRom {
    data: Box<[u8; ROM_SIZE]>,
    loaded: bool,
}

impl ScsiRom {
    /// An erased ROM (all 0xFF)
    pub fn blank() -> Self {
        Self {
            data: Box::new([0xFF; ROM_SIZE]),
            loaded: false,
        }
    }

    /// Zero-filled ROM carrying the built-in boot stub
    pub fn stub() -> Self {
        let mut data = Box::new([0; ROM_SIZE]);
        data[ROM_STUB_OFFSET..(ROM_STUB_OFFSET + ROM_STUB.len())].copy_from_slice(&ROM_STUB);
        Self {
            data,
            loaded: false,
        }
    }

    /// Builds a ROM from an image. Images larger than the window are truncated,
    /// shorter ones are padded with 0xFF.
    pub fn from_bytes(image: &[u8]) -> Result<Self> {
        if image.is_empty() {
            bail!("Empty ROM image");
        }
        if image.len() > ROM_SIZE {
            log::warn!(
                "ROM image of {} bytes truncated to {}",
                image.len(),
                ROM_SIZE
            );
        }
        let mut rom = Self::blank();
        let len = image.len().min(ROM_SIZE);
        rom.data[..len].copy_from_slice(&image[..len]);
        rom.loaded = true;
        Ok(rom)
    }

    /// Loads a ROM image from disk.
    pub fn load(filename: &Path) -> Result<Self> {
        let image = fs::read(filename)
            .with_context(|| format!("Failed to read ROM {}", filename.display()))?;
        let rom = Self::from_bytes(&image)
            .with_context(|| format!("Failed to load ROM {}", filename.display()))?;
        log::info!("Loaded SCSI ROM {}", filename.display());
        Ok(rom)
    }

    /// True if the contents came from an image rather than a default
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn read(&self, offset: usize) -> u8 {
        self.data[offset % ROM_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_layout() {
        let rom = ScsiRom::stub();
        assert!(!rom.is_loaded());
        assert_eq!(rom.read(0), 0);
        assert_eq!(rom.read(0x1F), 0);
        assert_eq!(rom.read(0x20), 0x00);
        assert_eq!(rom.read(0x21), 0xEA);
        assert_eq!(&rom.as_bytes()[0x2C..0x34], b"Human68k");
        assert_eq!(&rom.as_bytes()[0x44..0x4A], b"SCSIEX");
        assert_eq!(rom.read(0x51), 0x75);
        assert_eq!(rom.read(0x52), 0);
        assert_eq!(rom.read(ROM_SIZE - 1), 0);
    }

    #[test]
    fn short_image_padded() {
        let rom = ScsiRom::from_bytes(&[1, 2, 3]).unwrap();
        assert!(rom.is_loaded());
        assert_eq!(rom.read(0), 1);
        assert_eq!(rom.read(2), 3);
        assert_eq!(rom.read(3), 0xFF);
        assert_eq!(rom.read(ROM_SIZE - 1), 0xFF);
    }

    #[test]
    fn long_image_truncated() {
        let image: Vec<u8> = (0..(ROM_SIZE + 16)).map(|i| i as u8).collect();
        let rom = ScsiRom::from_bytes(&image).unwrap();
        assert_eq!(rom.as_bytes().len(), ROM_SIZE);
        assert_eq!(rom.read(ROM_SIZE - 1), (ROM_SIZE - 1) as u8);
    }

    #[test]
    fn empty_image_rejected() {
        assert!(ScsiRom::from_bytes(&[]).is_err());
    }

    #[test]
    fn load_missing_file() {
        let err = ScsiRom::load(Path::new("/nonexistent/scsiexrom.dat")).unwrap_err();
        assert!(format!("{:#}", err).contains("scsiexrom.dat"));
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("scsirom_{}.dat", std::process::id()));
        fs::write(&path, [0x60, 0x00, 0x12, 0x34]).unwrap();
        let rom = ScsiRom::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(rom.read(0), 0x60);
        assert_eq!(rom.read(3), 0x34);
        assert_eq!(rom.read(4), 0xFF);
    }
}
