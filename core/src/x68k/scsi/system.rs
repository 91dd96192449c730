//! Both SCSI buses of the machine, as seen from the CPU

use std::path::Path;

use anyhow::{Context, Result};

use crate::bus::{Address, BusMember};
use crate::debuggable::{Debuggable, DebuggableProperties, DebuggableProperty, DebuggablePropertyValue};
use crate::tickable::{Tickable, Ticks};
use crate::x68k::scsi::config::{PortConfig, ScsiConfig};
use crate::x68k::scsi::port::{BusKind, ScsiPort};
use crate::{dbgprop_bool, dbgprop_nest};

pub struct ScsiSystem {
    internal: ScsiPort,
    external: ScsiPort,
}

impl ScsiSystem {
    /// External bus enabled with the built-in boot stub, internal bus disabled.
    pub fn new() -> Self {
        Self {
            internal: ScsiPort::new(BusKind::Internal),
            external: ScsiPort::new(BusKind::External),
        }
    }

    pub fn from_config(config: &ScsiConfig) -> Result<Self> {
        config.validate()?;
        let mut system = Self::new();
        for (kind, port_config) in [
            (BusKind::Internal, &config.internal),
            (BusKind::External, &config.external),
        ] {
            Self::configure(system.port_mut(kind), port_config)
                .with_context(|| format!("Failed to set up {} SCSI bus", kind))?;
        }
        Ok(system)
    }

    fn configure(port: &mut ScsiPort, config: &PortConfig) -> Result<()> {
        port.set_enabled(config.enabled);
        if let Some(rom) = config.rom.as_deref() {
            port.load_rom(rom)?;
        }
        for disk in &config.disks {
            port.mount_hdd(disk.id, &disk.path)?;
        }
        Ok(())
    }

    pub fn port(&self, kind: BusKind) -> &ScsiPort {
        match kind {
            BusKind::Internal => &self.internal,
            BusKind::External => &self.external,
        }
    }

    pub fn port_mut(&mut self, kind: BusKind) -> &mut ScsiPort {
        match kind {
            BusKind::Internal => &mut self.internal,
            BusKind::External => &mut self.external,
        }
    }

    pub fn mount_hdd(&mut self, kind: BusKind, id: usize, filename: &Path) -> Result<()> {
        self.port_mut(kind).mount_hdd(id, filename)
    }

    pub fn unmount(&mut self, kind: BusKind, id: usize) {
        self.port_mut(kind).unmount(id);
    }

    pub fn is_mounted(&self, kind: BusKind, id: usize) -> bool {
        self.port(kind).is_mounted(id)
    }

    pub fn set_enabled(&mut self, kind: BusKind, enabled: bool) {
        self.port_mut(kind).set_enabled(enabled);
    }

    pub fn is_enabled(&self, kind: BusKind) -> bool {
        self.port(kind).is_enabled()
    }

    pub fn load_rom(&mut self, kind: BusKind, filename: &Path) -> Result<()> {
        self.port_mut(kind).load_rom(filename)
    }

    pub fn read_rom(&self, kind: BusKind, offset: usize) -> u8 {
        self.port(kind).read_rom(offset)
    }

    pub fn reset(&mut self) {
        self.internal.reset();
        self.external.reset();
    }

    /// Interrupt request of either enabled bus
    pub fn get_irq(&self) -> bool {
        self.internal.get_irq() || self.external.get_irq()
    }
}

impl BusMember<Address> for ScsiSystem {
    fn read(&mut self, addr: Address) -> Option<u8> {
        self.internal
            .read(addr)
            .or_else(|| self.external.read(addr))
    }

    fn write(&mut self, addr: Address, val: u8) -> Option<()> {
        self.internal
            .write(addr, val)
            .or_else(|| self.external.write(addr, val))
    }
}

impl Tickable for ScsiSystem {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks> {
        self.internal.tick(ticks)?;
        self.external.tick(ticks)?;
        Ok(ticks)
    }
}

impl Debuggable for ScsiSystem {
    fn get_debug_properties(&self) -> DebuggableProperties {
        vec![
            dbgprop_bool!("IRQ", self.get_irq()),
            dbgprop_nest!("Internal", self.internal),
            dbgprop_nest!("External", self.external),
        ]
    }
}
