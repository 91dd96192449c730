//! One SCSI port: a bus with its MB89352 controller, targets and boot ROM,
//! as decoded on the CPU bus.

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::bus::{Address, AddressRange, BusMember};
use crate::debuggable::{Debuggable, DebuggableProperties, DebuggableProperty, DebuggablePropertyValue};
use crate::tickable::{Tickable, Ticks};
use crate::x68k::scsi::bus::{BusMonitor, ScsiBus, ScsiParticipant};
use crate::x68k::scsi::disk::ScsiTargetDisk;
use crate::x68k::scsi::rom::{ROM_SIZE, ScsiRom};
use crate::x68k::scsi::spc::{Mb89352, SpcReg};
use crate::x68k::scsi::target::ScsiTarget;
use crate::x68k::scsi::{INITIATOR_ID, MAX_TARGETS, SignalLine};
use crate::{dbgprop_bool, dbgprop_enum, dbgprop_group, dbgprop_nest, dbgprop_string};

/// Rounds of change propagation before the bus is considered oscillating
const SETTLE_ROUNDS: usize = 64;

/// External SCSI board: registers on even addresses, boot ROM after them
pub const EXTERNAL_RANGE: AddressRange = AddressRange::new(0xEA_0000, 0xEA_1FFF);

/// Built-in SCSI (X68000 SUPER and later): registers on odd addresses
pub const INTERNAL_RANGE: AddressRange = AddressRange::new(0xE9_6020, 0xE9_603F);

/// Size of the register file window, in CPU bytes
const REGISTER_WINDOW: Address = 0x20;

/// Which of the two SCSI buses a port implements
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::IntoStaticStr,
    strum::Display,
    strum::EnumString,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Internal,
    External,
}

impl BusKind {
    pub const fn range(self) -> AddressRange {
        match self {
            Self::Internal => INTERNAL_RANGE,
            Self::External => EXTERNAL_RANGE,
        }
    }

    /// Whether the registers sit on odd CPU addresses (lower data lane)
    const fn odd_lane(self) -> bool {
        matches!(self, Self::Internal)
    }
}

/// What a CPU address within the port's window refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoded {
    Register(usize),
    Rom(usize),
    /// The unused byte lane of the register file
    Unmapped,
}

pub struct ScsiPort {
    kind: BusKind,
    enabled: bool,
    bus: ScsiBus,
    spc: Mb89352,
    targets: [Option<Box<dyn ScsiTarget>>; MAX_TARGETS],
    rom: ScsiRom,
}

impl ScsiPort {
    pub fn new(kind: BusKind) -> Self {
        let mut bus = ScsiBus::new();
        bus.attach(INITIATOR_ID, ScsiParticipant::Initiator)
            .expect("Initiator ID out of bus range");
        let mut spc = Mb89352::new();
        spc.reset(&mut bus);
        // Nobody is attached yet to observe the power-on release
        bus.take_changed();

        Self {
            kind,
            enabled: kind == BusKind::External,
            bus,
            spc,
            targets: Default::default(),
            rom: match kind {
                BusKind::External => ScsiRom::stub(),
                BusKind::Internal => ScsiRom::blank(),
            },
        }
    }

    pub fn kind(&self) -> BusKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            log::info!("SCSI {} port {}", self.kind, if enabled { "enabled" } else { "disabled" });
        }
        self.enabled = enabled;
    }

    pub fn bus(&self) -> &ScsiBus {
        &self.bus
    }

    pub fn spc(&self) -> &Mb89352 {
        &self.spc
    }

    pub fn target(&self, id: usize) -> Option<&dyn ScsiTarget> {
        self.targets.get(id)?.as_deref()
    }

    /// Delivers control line changes to every participant until the bus
    /// stops changing.
    fn settle(&mut self) {
        for _ in 0..SETTLE_ROUNDS {
            if !self.bus.take_changed() {
                return;
            }
            self.spc.bus_changed(&mut self.bus);
            for target in self.targets.iter_mut().flatten() {
                target.bus_changed(&mut self.bus);
            }
        }
        if self.bus.take_changed() {
            log::warn!(
                "SCSI {} bus still changing after {} rounds ({:?})",
                self.kind,
                SETTLE_ROUNDS,
                self.bus.get_control()
            );
        }
    }

    /// Places a target on the bus, replacing whatever occupied the ID.
    pub fn attach_target(&mut self, id: usize, mut target: Box<dyn ScsiTarget>) -> Result<()> {
        if id >= MAX_TARGETS {
            bail!("Invalid SCSI target ID {}", id);
        }
        self.detach_target(id);
        self.bus.attach(id, ScsiParticipant::Target)?;
        target.attach(id);
        self.targets[id] = Some(target);
        self.settle();
        Ok(())
    }

    /// Takes a target off the bus, releasing everything it drove.
    pub fn detach_target(&mut self, id: usize) -> Option<Box<dyn ScsiTarget>> {
        let mut target = self.targets.get_mut(id)?.take()?;
        target.reset(&mut self.bus);
        target.detach();
        self.bus.detach(id);
        self.settle();
        Some(target)
    }

    /// Opens a disk image and attaches it as a hard disk.
    /// On failure the ID is left empty.
    pub fn mount_hdd(&mut self, id: usize, filename: &Path) -> Result<()> {
        if id >= MAX_TARGETS {
            bail!("Invalid SCSI target ID {}", id);
        }
        self.unmount(id);
        let disk = ScsiTargetDisk::open(filename).with_context(|| {
            format!("Cannot mount {} as SCSI ID {}", filename.display(), id)
        })?;
        self.attach_target(id, Box::new(disk))?;
        log::info!("SCSI {} ID {}: mounted {}", self.kind, id, filename.display());
        Ok(())
    }

    pub fn unmount(&mut self, id: usize) {
        if let Some(mut target) = self.detach_target(id) {
            target.eject();
            log::info!("SCSI {} ID {}: unmounted", self.kind, id);
        }
    }

    /// A target exists and has a medium
    pub fn is_mounted(&self, id: usize) -> bool {
        self.target(id).is_some_and(|t| t.capacity().is_some())
    }

    pub fn load_rom(&mut self, filename: &Path) -> Result<()> {
        self.rom = ScsiRom::load(filename)?;
        Ok(())
    }

    pub fn set_rom(&mut self, rom: ScsiRom) {
        self.rom = rom;
    }

    /// Reads the port's boot ROM, independent of the CPU address decode.
    pub fn read_rom(&self, offset: usize) -> u8 {
        self.rom.read(offset % ROM_SIZE)
    }

    /// Hardware reset of the controller, the bus and every target.
    pub fn reset(&mut self) {
        self.spc.reset(&mut self.bus);
        for target in self.targets.iter_mut().flatten() {
            target.reset(&mut self.bus);
        }
        self.bus.reset();
        self.settle();
    }

    pub fn connect_irq(&mut self, line: Option<Box<dyn SignalLine>>) {
        self.spc.set_irq_line(line);
    }

    pub fn connect_drq(&mut self, line: Option<Box<dyn SignalLine>>) {
        self.spc.set_drq_line(line);
    }

    pub fn set_bus_monitor(&mut self, monitor: Option<BusMonitor>) {
        self.bus.set_monitor(monitor);
    }

    pub fn get_irq(&self) -> bool {
        self.enabled && self.spc.get_irq()
    }

    pub fn get_drq(&self) -> bool {
        self.enabled && self.spc.get_drq()
    }

    pub fn read_reg(&mut self, reg: SpcReg) -> u8 {
        if !self.enabled {
            return 0xFF;
        }
        let val = self.spc.read_reg(&mut self.bus, reg as usize);
        self.settle();
        val
    }

    pub fn write_reg(&mut self, reg: SpcReg, val: u8) {
        if !self.enabled {
            return;
        }
        self.spc.write_reg(&mut self.bus, reg as usize, val);
        self.settle();
    }

    /// DMA controller read (DACK cycle)
    pub fn dma_read(&mut self) -> u8 {
        if !self.enabled {
            return 0xFF;
        }
        let val = self.spc.dma_read(&mut self.bus);
        self.settle();
        val
    }

    /// DMA controller write (DACK cycle)
    pub fn dma_write(&mut self, val: u8) {
        if !self.enabled {
            return;
        }
        self.spc.dma_write(&mut self.bus, val);
        self.settle();
    }

    fn decode(&self, addr: Address) -> Option<Decoded> {
        let offset = self.kind.range().offset(addr)?;
        if offset >= REGISTER_WINDOW {
            return Some(Decoded::Rom(offset as usize));
        }
        if (offset & 1 != 0) == self.kind.odd_lane() {
            Some(Decoded::Register((offset >> 1) as usize))
        } else {
            Some(Decoded::Unmapped)
        }
    }
}

impl BusMember<Address> for ScsiPort {
    fn read(&mut self, addr: Address) -> Option<u8> {
        let decoded = self.decode(addr)?;
        if !self.enabled {
            return Some(0xFF);
        }
        Some(match decoded {
            Decoded::Register(reg) => {
                let val = self.spc.read_reg(&mut self.bus, reg);
                self.settle();
                val
            }
            Decoded::Rom(offset) => self.rom.read(offset),
            Decoded::Unmapped => 0xFF,
        })
    }

    fn write(&mut self, addr: Address, val: u8) -> Option<()> {
        let decoded = self.decode(addr)?;
        if !self.enabled {
            return Some(());
        }
        match decoded {
            Decoded::Register(reg) => {
                self.spc.write_reg(&mut self.bus, reg, val);
                self.settle();
            }
            Decoded::Rom(_) => {
                log::warn!("Write to SCSI ROM at {:06X}: {:02X}", addr, val);
            }
            Decoded::Unmapped => (),
        }
        Some(())
    }
}

impl Tickable for ScsiPort {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks> {
        if !self.enabled {
            return Ok(ticks);
        }

        let mut left = ticks;
        while let Some(due) = self.spc.next_event().filter(|&d| d <= left) {
            self.spc.elapse(due);
            left -= due;
            self.spc.fire_due(&mut self.bus);
            self.settle();
        }
        self.spc.elapse(left);
        Ok(ticks)
    }
}

impl Debuggable for ScsiPort {
    fn get_debug_properties(&self) -> DebuggableProperties {
        let mut targets = vec![];
        for (id, t) in self.targets.iter().enumerate() {
            if let Some(t) = t {
                targets.push(dbgprop_nest!(
                    format!("ID #{} - {}", id, t.target_type()),
                    t
                ));
            } else {
                targets.push(dbgprop_group!(format!("ID #{} - (no device)", id), vec![]));
            }
        }

        vec![
            dbgprop_enum!("Bus", self.kind),
            dbgprop_bool!("Enabled", self.enabled),
            dbgprop_string!(
                "ROM",
                if self.rom.is_loaded() { "loaded" } else { "default" }.to_string()
            ),
            dbgprop_nest!("Controller", self.spc),
            dbgprop_nest!("Signals", self.bus),
            dbgprop_group!("Targets", targets),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::x68k::scsi::disk_image::MemoryDiskImage;
    use crate::x68k::scsi::spc::SpcState;

    fn memory_disk(blocks: usize) -> Box<dyn ScsiTarget> {
        let mut disk = ScsiTargetDisk::new();
        disk.insert_image(Box::new(MemoryDiskImage::zeroed(blocks * 512)))
            .unwrap();
        Box::new(disk)
    }

    #[test]
    fn new_port_owns_initiator_slot() {
        let mut port = ScsiPort::new(BusKind::External);
        assert_eq!(port.bus().occupant(INITIATOR_ID), Some(ScsiParticipant::Initiator));
        assert!(port.bus().get_control().is_empty());
        assert!(!port.bus.take_changed());
        assert_eq!(port.spc().state(), SpcState::Idle);
    }

    #[test]
    fn external_decode() {
        let mut port = ScsiPort::new(BusKind::External);
        assert!(port.is_enabled());

        // BDID (register 0) reads back as a bit mask
        assert_eq!(port.write(0xEA0001, 7), Some(()));
        assert_eq!(port.read(0xEA0001), Some(0xFF));
        port.write(0xEA0000, 7).unwrap();
        assert_eq!(port.read(0xEA0000), Some(0x80));

        // TCL is register 14
        port.write(0xEA001C, 0x5A).unwrap();
        assert_eq!(port.read(0xEA001C), Some(0x5A));
        assert_eq!(port.read_reg(SpcReg::TCL), 0x5A);

        // Boot ROM stub
        assert_eq!(port.read(0xEA0020), Some(0x00));
        assert_eq!(port.read(0xEA0021), Some(0xEA));
        assert_eq!(port.read(0xEA002C), Some(b'H'));
        assert_eq!(port.read(0xEA1FFF), Some(0x00));
        assert_eq!(port.read(0xEA2000), None);
        assert_eq!(port.read(0xE96021), None);
    }

    #[test]
    fn internal_decode() {
        let mut port = ScsiPort::new(BusKind::Internal);
        assert!(!port.is_enabled());
        assert_eq!(port.read(0xE96021), Some(0xFF));
        port.set_enabled(true);

        port.write(0xE96021, 3).unwrap();
        assert_eq!(port.read(0xE96021), Some(0x08));
        assert_eq!(port.read(0xE96020), Some(0xFF));
        port.write(0xE9603D, 0x42).unwrap();
        assert_eq!(port.read(0xE9603D), Some(0x42));
        assert_eq!(port.read(0xE96040), None);
        assert_eq!(port.read(0xEA0000), None);
    }

    #[test]
    fn rom_writes_ignored() {
        let mut port = ScsiPort::new(BusKind::External);
        port.write(0xEA0021, 0x12).unwrap();
        assert_eq!(port.read(0xEA0021), Some(0xEA));
        assert_eq!(port.read_rom(0x21), 0xEA);
    }

    #[test]
    fn disabled_port() {
        let mut port = ScsiPort::new(BusKind::External);
        port.write(0xEA001C, 0x33).unwrap();
        port.set_enabled(false);
        assert_eq!(port.read(0xEA001C), Some(0xFF));
        assert_eq!(port.read(0xEA0020), Some(0xFF));
        port.write(0xEA001C, 0x44).unwrap();
        assert_eq!(port.read_reg(SpcReg::TCL), 0xFF);
        port.set_enabled(true);
        assert_eq!(port.read_reg(SpcReg::TCL), 0x33);
    }

    #[test]
    fn disabled_port_not_ticked() {
        let mut port = ScsiPort::new(BusKind::External);
        port.write_reg(SpcReg::SCTL, 0);
        port.write_reg(SpcReg::TEMP, 0x01);
        port.write_reg(SpcReg::SCMD, 0x20);
        port.set_enabled(false);
        assert_eq!(port.tick(1000).unwrap(), 1000);
        assert!(!port.bus().get_control().sel());
        port.set_enabled(true);
        port.tick(30).unwrap();
        assert!(port.bus().get_control().sel());
        assert_eq!(port.spc().state(), SpcState::SelWaitBsy);
    }

    #[test]
    fn mount_missing_image() {
        let mut port = ScsiPort::new(BusKind::External);
        port.attach_target(2, memory_disk(16)).unwrap();
        assert!(port.is_mounted(2));

        assert!(port.mount_hdd(2, Path::new("/nonexistent/hd.hds")).is_err());
        assert!(!port.is_mounted(2));
        assert!(port.target(2).is_none());
        assert!(port.mount_hdd(7, Path::new("/nonexistent/hd.hds")).is_err());
    }

    #[test]
    fn mount_and_unmount_file() {
        let path = std::env::temp_dir().join(format!("scsiport_{}.hds", std::process::id()));
        std::fs::write(&path, vec![0u8; 64 * 512]).unwrap();

        let mut port = ScsiPort::new(BusKind::External);
        port.mount_hdd(0, &path).unwrap();
        assert!(port.is_mounted(0));
        assert_eq!(port.target(0).unwrap().capacity(), Some(64 * 512));
        assert_eq!(port.bus().occupant(0), Some(ScsiParticipant::Target));

        port.unmount(0);
        assert!(!port.is_mounted(0));
        assert_eq!(port.bus().occupant(0), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn attach_rejects_bad_id() {
        let mut port = ScsiPort::new(BusKind::External);
        assert!(port.attach_target(7, memory_disk(4)).is_err());
        assert!(port.detach_target(9).is_none());
    }

    #[test]
    fn selection_timeout_raises_irq() {
        let mut port = ScsiPort::new(BusKind::External);
        let irq = Rc::new(Cell::new(false));
        let i = irq.clone();
        port.connect_irq(Some(Box::new(move |level| i.set(level))));

        port.write_reg(SpcReg::BDID, 7);
        port.write_reg(SpcReg::SCTL, 0x01);
        port.write_reg(SpcReg::TEMP, 0x01 | 0x80);
        port.write_reg(SpcReg::TCH, 0);
        port.write_reg(SpcReg::TCM, 0x01);
        port.write_reg(SpcReg::TCL, 0);
        port.write_reg(SpcReg::SCMD, 0x20);

        port.tick(30 + 542 - 1).unwrap();
        assert!(!irq.get());
        port.tick(1).unwrap();
        assert!(irq.get());
        assert!(port.get_irq());
        assert_eq!(port.read_reg(SpcReg::INTS), 0x04);

        port.write_reg(SpcReg::INTS, 0x04);
        assert!(!irq.get());
    }

    #[test]
    fn reset_releases_bus() {
        let mut port = ScsiPort::new(BusKind::External);
        port.attach_target(0, memory_disk(16)).unwrap();
        port.write_reg(SpcReg::SCTL, 0);
        port.write_reg(SpcReg::TEMP, 0x01 | 0x80);
        port.write_reg(SpcReg::TCM, 0x01);
        port.write_reg(SpcReg::SCMD, 0x20);
        port.tick(1000).unwrap();
        assert!(port.bus().get_control().bsy());

        port.reset();
        assert!(port.bus().is_bus_free());
        assert_eq!(port.spc().state(), SpcState::Idle);
        assert!(port.is_mounted(0));
    }
}
