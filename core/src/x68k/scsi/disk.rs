//! SCSI hard disk drive (block device)

use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::debuggable::{Debuggable, DebuggableProperties, DebuggableProperty, DebuggablePropertyValue};
use crate::x68k::scsi::bus::ScsiBus;
use crate::x68k::scsi::command::{Cdb, ScsiCommand, cdb_len};
use crate::x68k::scsi::disk_image::{DiskImage, FileDiskImage};
use crate::x68k::scsi::target::{LinkEvent, ScsiTarget, ScsiTargetType, TargetLink};
use crate::x68k::scsi::{
    ASC_INVALID_COMMAND, ASC_INVALID_FIELD_IN_CDB, ASC_LBA_OUT_OF_RANGE, ASC_MEDIUM_CHANGED,
    ASC_MEDIUM_NOT_PRESENT, ASC_NO_ADDITIONAL_SENSE, CC_KEY_ILLEGAL_REQUEST, CC_KEY_MEDIUM_ERROR,
    CC_KEY_NOT_READY, CC_KEY_UNIT_ATTENTION, MSG_COMMAND_COMPLETE, STATUS_CHECK_CONDITION,
    STATUS_GOOD, ScsiCmdResult, ScsiPhase,
};
use crate::{
    dbgprop_bool, dbgprop_byte, dbgprop_enum, dbgprop_group, dbgprop_header, dbgprop_long,
    dbgprop_string, dbgprop_udec,
};

const DISK_TRACE: bool = false;

pub const DISK_BLOCKSIZE: usize = 512;

/// Size of the transfer buffer, bounding a single transfer
pub const DATA_BUFFER_SIZE: usize = 0x10000;

const MAX_TRANSFER_BLOCKS: u32 = (DATA_BUFFER_SIZE / DISK_BLOCKSIZE) as u32;

const MIB: u64 = 1024 * 1024;

/// Image size band (exclusive upper bound) to C/H/S
struct GeometryBand {
    max_size: u64,
    cylinders: u32,
    heads: u32,
    sectors: u32,
}

const GEOMETRY_TABLE: [GeometryBand; 8] = [
    GeometryBand { max_size: 21 * MIB, cylinders: 615, heads: 4, sectors: 17 },
    GeometryBand { max_size: 42 * MIB, cylinders: 615, heads: 6, sectors: 17 },
    GeometryBand { max_size: 85 * MIB, cylinders: 820, heads: 6, sectors: 17 },
    GeometryBand { max_size: 110 * MIB, cylinders: 1024, heads: 8, sectors: 17 },
    GeometryBand { max_size: 210 * MIB, cylinders: 1024, heads: 12, sectors: 17 },
    GeometryBand { max_size: 520 * MIB, cylinders: 1024, heads: 16, sectors: 32 },
    GeometryBand { max_size: 1100 * MIB, cylinders: 2048, heads: 16, sectors: 32 },
    GeometryBand { max_size: 0xFFFF_FFFF, cylinders: 4096, heads: 16, sectors: 32 },
];

/// Disk geometry as reported to the initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
    pub total_sectors: u32,
}

impl DiskGeometry {
    pub fn from_image_size(size: u64) -> Self {
        let total_sectors = u32::try_from(size / DISK_BLOCKSIZE as u64).unwrap_or(u32::MAX);

        if let Some(band) = GEOMETRY_TABLE.iter().find(|b| size < b.max_size) {
            return Self {
                cylinders: band.cylinders,
                heads: band.heads,
                sectors_per_track: band.sectors,
                bytes_per_sector: DISK_BLOCKSIZE as u32,
                total_sectors,
            };
        }

        let (heads, sectors_per_track) = (16, 32);
        Self {
            cylinders: (total_sectors / (heads * sectors_per_track)).max(1),
            heads,
            sectors_per_track,
            bytes_per_sector: DISK_BLOCKSIZE as u32,
            total_sectors,
        }
    }
}

/// Pending sense information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
    /// Faulting LBA
    pub info: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum DiskState {
    Idle,
    MessageOut,
    Command,
    DataIn,
    DataOut,
    Status,
    MessageIn,
}

pub struct ScsiTargetDisk {
    link: TargetLink,
    state: DiskState,

    /// Command buffer
    cmdbuf: Cdb,

    /// Command being executed
    command: Option<ScsiCommand>,

    /// Data In/Data Out buffer
    data: Vec<u8>,
    data_pos: usize,

    /// In-flight transfer
    lba: u32,
    blocks: u32,

    sense: SenseData,
    status: u8,
    message: u8,

    image: Option<Box<dyn DiskImage>>,
    geometry: DiskGeometry,
    ready: bool,
    media_changed: bool,
}

impl ScsiTargetDisk {
    /// Creates a drive without medium.
    pub fn new() -> Self {
        Self {
            link: TargetLink::new(),
            state: DiskState::Idle,
            cmdbuf: Cdb::new(),
            command: None,
            data: vec![],
            data_pos: 0,
            lba: 0,
            blocks: 0,
            sense: SenseData::default(),
            status: STATUS_GOOD,
            message: MSG_COMMAND_COMPLETE,
            image: None,
            geometry: DiskGeometry::default(),
            ready: false,
            media_changed: false,
        }
    }

    /// Try to load a disk image, given the filename of the image.
    pub fn open(filename: &Path) -> Result<Self> {
        let mut disk = Self::new();
        disk.insert_image(Box::new(FileDiskImage::open(filename)?))?;
        Ok(disk)
    }

    /// Inserts a backing image, replacing the previous one.
    pub fn insert_image(&mut self, image: Box<dyn DiskImage>) -> Result<()> {
        let size = image.byte_len();
        if size < DISK_BLOCKSIZE as u64 {
            bail!("Disk image too small ({} bytes)", size);
        }
        if size % DISK_BLOCKSIZE as u64 != 0 {
            log::warn!(
                "Disk image size {} not a multiple of {}, ignoring trailing bytes",
                size,
                DISK_BLOCKSIZE
            );
        }

        self.eject();
        self.geometry = DiskGeometry::from_image_size(size);
        log::info!(
            "Disk image {} bytes: C={} H={} S={}, {} sectors",
            size,
            self.geometry.cylinders,
            self.geometry.heads,
            self.geometry.sectors_per_track,
            self.geometry.total_sectors
        );
        self.image = Some(image);
        self.ready = true;
        self.media_changed = true;
        self.sense = SenseData::default();
        Ok(())
    }

    /// Flushes and closes the backing image.
    pub fn eject(&mut self) {
        if let Some(mut image) = self.image.take() {
            if let Err(e) = image.flush() {
                log::error!("Failed to flush disk image: {:#}", e);
            }
        }
        self.ready = false;
        self.geometry = DiskGeometry::default();
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn geometry(&self) -> DiskGeometry {
        self.geometry
    }

    pub fn sense(&self) -> SenseData {
        self.sense
    }

    pub fn state(&self) -> DiskState {
        self.state
    }

    fn medium_ready(&self) -> bool {
        self.ready && self.image.is_some()
    }

    fn in_range(&self, lba: u32, blocks: u32) -> bool {
        u64::from(lba) + u64::from(blocks) <= u64::from(self.geometry.total_sectors)
    }

    fn set_sense(&mut self, key: u8, asc: u8, info: u32) {
        self.sense = SenseData {
            key,
            asc,
            ascq: 0,
            info,
        };
    }

    fn check_condition(&mut self, key: u8, asc: u8, info: u32) -> ScsiCmdResult {
        self.set_sense(key, asc, info);
        ScsiCmdResult::Status(STATUS_CHECK_CONDITION)
    }

    fn not_ready(&mut self) -> ScsiCmdResult {
        self.check_condition(CC_KEY_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 0)
    }

    fn clamp_transfer(blocks: u32) -> u32 {
        if blocks > MAX_TRANSFER_BLOCKS {
            log::warn!(
                "Transfer of {} blocks exceeds buffer, truncating to {}",
                blocks,
                MAX_TRANSFER_BLOCKS
            );
        }
        blocks.min(MAX_TRANSFER_BLOCKS)
    }

    /// Executes a decoded command.
    pub(crate) fn run_command(&mut self, cmd: ScsiCommand) -> ScsiCmdResult {
        match cmd {
            ScsiCommand::TestUnitReady => {
                if !self.medium_ready() {
                    self.not_ready()
                } else if self.media_changed {
                    self.media_changed = false;
                    self.check_condition(CC_KEY_UNIT_ATTENTION, ASC_MEDIUM_CHANGED, 0)
                } else {
                    ScsiCmdResult::Status(STATUS_GOOD)
                }
            }
            ScsiCommand::RezeroUnit | ScsiCommand::FormatUnit => {
                if !self.medium_ready() {
                    return self.not_ready();
                }
                ScsiCmdResult::Status(STATUS_GOOD)
            }
            ScsiCommand::RequestSense { alloc_len } => {
                ScsiCmdResult::DataIn(self.take_sense(alloc_len))
            }
            ScsiCommand::Read { lba, blocks } => self.read_blocks(lba, blocks),
            ScsiCommand::Write { lba, blocks } => {
                if !self.medium_ready() {
                    return self.not_ready();
                }
                if blocks == 0 {
                    return ScsiCmdResult::Status(STATUS_GOOD);
                }
                if !self.in_range(lba, blocks) {
                    log::warn!("Write beyond disk: LBA {} + {}", lba, blocks);
                    return self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, lba);
                }
                self.lba = lba;
                self.blocks = Self::clamp_transfer(blocks);
                ScsiCmdResult::DataOut(self.blocks as usize * DISK_BLOCKSIZE)
            }
            ScsiCommand::Seek { lba } => {
                if !self.medium_ready() {
                    return self.not_ready();
                }
                if lba >= self.geometry.total_sectors {
                    return self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, lba);
                }
                ScsiCmdResult::Status(STATUS_GOOD)
            }
            ScsiCommand::Inquiry { alloc_len } => {
                if alloc_len == 0 {
                    return ScsiCmdResult::Status(STATUS_GOOD);
                }
                let mut result = Self::inquiry();
                result.truncate(alloc_len.into());
                ScsiCmdResult::DataIn(result)
            }
            ScsiCommand::ModeSelect { param_len } => {
                if param_len == 0 {
                    return ScsiCmdResult::Status(STATUS_GOOD);
                }
                ScsiCmdResult::DataOut(param_len.into())
            }
            ScsiCommand::ModeSense { page, alloc_len } => {
                if alloc_len == 0 {
                    return ScsiCmdResult::Status(STATUS_GOOD);
                }
                let mut result = self.mode_sense(page);
                result.truncate(alloc_len.into());
                ScsiCmdResult::DataIn(result)
            }
            ScsiCommand::StartStopUnit { start } => {
                log::debug!("START/STOP UNIT: start = {}", start);
                ScsiCmdResult::Status(STATUS_GOOD)
            }
            ScsiCommand::ReadCapacity => {
                if !self.medium_ready() {
                    return self.not_ready();
                }
                let mut result = vec![0; 8];
                let last_lba = self.geometry.total_sectors.saturating_sub(1);
                result[0..4].copy_from_slice(&last_lba.to_be_bytes());
                result[4..8].copy_from_slice(&self.geometry.bytes_per_sector.to_be_bytes());
                ScsiCmdResult::DataIn(result)
            }
            ScsiCommand::Verify {
                lba,
                blocks,
                byte_check,
            } => {
                if !self.medium_ready() {
                    return self.not_ready();
                }
                if byte_check {
                    log::warn!("VERIFY(10) with byte check not supported");
                    return self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB, 0);
                }
                if !self.in_range(lba, blocks) {
                    return self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, lba);
                }
                ScsiCmdResult::Status(STATUS_GOOD)
            }
            ScsiCommand::Unsupported(opcode) => {
                log::warn!("Unsupported SCSI command {:02X}", opcode);
                self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_COMMAND, 0)
            }
        }
    }

    fn read_blocks(&mut self, lba: u32, blocks: u32) -> ScsiCmdResult {
        if !self.medium_ready() {
            return self.not_ready();
        }
        if blocks == 0 {
            return ScsiCmdResult::Status(STATUS_GOOD);
        }
        if !self.in_range(lba, blocks) {
            log::warn!("Read beyond disk: LBA {} + {}", lba, blocks);
            return self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, lba);
        }
        let Some(image) = self.image.as_mut() else {
            return self.not_ready();
        };

        let blocks = Self::clamp_transfer(blocks);
        let mut result = vec![0; blocks as usize * DISK_BLOCKSIZE];
        let mut failed = None;
        for (block, sector) in (lba..).zip(result.chunks_exact_mut(DISK_BLOCKSIZE)) {
            if let Err(e) = image.read_at(u64::from(block) * DISK_BLOCKSIZE as u64, sector) {
                log::error!("Read error at LBA {}: {:#}", block, e);
                failed = Some(block);
                break;
            }
        }

        match failed {
            Some(block) => self.check_condition(CC_KEY_MEDIUM_ERROR, ASC_NO_ADDITIONAL_SENSE, block),
            None => ScsiCmdResult::DataIn(result),
        }
    }

    /// Writes sector `idx` of the data buffer to the image.
    fn flush_sector(&mut self, idx: usize) -> Result<()> {
        let Some(image) = self.image.as_mut() else {
            bail!("No medium");
        };
        let block = u64::from(self.lba) + idx as u64;
        let start = idx * DISK_BLOCKSIZE;
        image.write_at(
            block * DISK_BLOCKSIZE as u64,
            &self.data[start..(start + DISK_BLOCKSIZE)],
        )
    }

    /// Builds fixed format sense data and clears the pending sense.
    fn take_sense(&mut self, alloc_len: u8) -> Vec<u8> {
        let len = match alloc_len {
            0 => 4,
            n => usize::from(n).min(18),
        };
        let mut result = vec![0; 18];
        // Current error, fixed format
        result[0] = 0x70;
        result[2] = self.sense.key & 0x0F;
        result[3..7].copy_from_slice(&self.sense.info.to_be_bytes());
        // Additional sense length
        result[7] = 10;
        result[12] = self.sense.asc;
        result[13] = self.sense.ascq;
        result.truncate(len);

        self.sense = SenseData::default();
        result
    }

    fn inquiry() -> Vec<u8> {
        let mut result = vec![0; 36];

        // 0 Peripheral qualifier (5-7), peripheral device type (4-0)
        result[0] = 0; // Direct access
        // Not removable
        result[1] = 0;

        // SCSI version compliance
        result[2] = 0x02; // ANSI-2
        result[3] = 0x02; // Response data format

        // 4 Additional length (N-4)
        result[4] = result.len() as u8 - 5;

        // 8..16 Vendor identification
        result[8..16].copy_from_slice(b"SHARP   ");

        // 16..32 Product identification
        result[16..32].copy_from_slice(b"VIRTUAL HDD     ");

        // 32..36 Revision
        result[32..36].copy_from_slice(b"1.00");

        result
    }

    fn mode_sense(&self, page: u8) -> Vec<u8> {
        let geo = &self.geometry;
        let mut result = Vec::with_capacity(4 + 8 + 24 + 24);

        // Mode parameter header: length, medium type, device specific,
        // block descriptor length
        result.extend_from_slice(&[0, 0, 0, 8]);

        // Block descriptor: density, blocks (3), reserved, block length (3)
        result.push(0);
        result.extend_from_slice(&geo.total_sectors.to_be_bytes()[1..4]);
        result.push(0);
        result.extend_from_slice(&geo.bytes_per_sector.to_be_bytes()[1..4]);

        if page == 0x03 || page == 0x3F {
            // Format device page
            let mut p = vec![0; 24];
            p[0] = 0x03;
            p[1] = 0x16;
            // Tracks per zone
            p[2..4].copy_from_slice(&(geo.heads as u16).to_be_bytes());
            p[10..12].copy_from_slice(&(geo.sectors_per_track as u16).to_be_bytes());
            p[12..14].copy_from_slice(&(geo.bytes_per_sector as u16).to_be_bytes());
            // Interleave
            p[14..16].copy_from_slice(&1u16.to_be_bytes());
            result.extend_from_slice(&p);
        }

        if page == 0x04 || page == 0x3F {
            // Rigid disk geometry page
            let mut p = vec![0; 24];
            p[0] = 0x04;
            p[1] = 0x16;
            p[2..5].copy_from_slice(&geo.cylinders.to_be_bytes()[1..4]);
            p[5] = geo.heads as u8;
            // Medium rotation rate (7200 rpm)
            p[20..22].copy_from_slice(&7200u16.to_be_bytes());
            result.extend_from_slice(&p);
        }

        result[0] = (result.len() - 1) as u8;
        result
    }

    fn reset_state(&mut self) {
        self.state = DiskState::Idle;
        self.cmdbuf.clear();
        self.command = None;
        self.data.clear();
        self.data_pos = 0;
        self.sense = SenseData::default();
    }

    fn enter_status(&mut self, bus: &mut ScsiBus) {
        self.data.clear();
        self.data_pos = 0;
        self.state = DiskState::Status;
        self.link.request(bus, ScsiPhase::Status, self.status);
    }

    fn execute(&mut self, bus: &mut ScsiBus) {
        let cmd = ScsiCommand::parse(&self.cmdbuf);
        if DISK_TRACE {
            log::debug!("Command {} {:02X?}", cmd.name(), self.cmdbuf);
        }
        self.status = STATUS_GOOD;
        self.message = MSG_COMMAND_COMPLETE;
        self.command = Some(cmd);

        match self.run_command(cmd) {
            ScsiCmdResult::Status(status) => {
                self.status = status;
                self.enter_status(bus);
            }
            ScsiCmdResult::DataIn(data) => {
                if data.is_empty() {
                    return self.enter_status(bus);
                }
                self.data = data;
                self.data_pos = 0;
                self.state = DiskState::DataIn;
                self.link.request(bus, ScsiPhase::DataIn, self.data[0]);
            }
            ScsiCmdResult::DataOut(len) => {
                if len == 0 {
                    return self.enter_status(bus);
                }
                self.data = vec![0; len];
                self.data_pos = 0;
                self.state = DiskState::DataOut;
                self.link.request(bus, ScsiPhase::DataOut, 0);
            }
        }
    }

    /// Advances the protocol after a completed byte handshake.
    fn transferred(&mut self, bus: &mut ScsiBus, byte: u8) {
        match self.state {
            DiskState::Idle => (),
            DiskState::MessageOut => {
                log::debug!("Message out: {:02X}", byte);
                if bus.get_control().atn() {
                    self.link.request(bus, ScsiPhase::MessageOut, 0);
                } else {
                    self.state = DiskState::Command;
                    self.link.request(bus, ScsiPhase::Command, 0);
                }
            }
            DiskState::Command => {
                if self.cmdbuf.try_push(byte).is_err() {
                    log::error!("Command buffer overflow");
                }
                if self.cmdbuf.len() >= cdb_len(self.cmdbuf[0]) {
                    self.execute(bus);
                } else {
                    self.link.request(bus, ScsiPhase::Command, 0);
                }
            }
            DiskState::DataIn => {
                self.data_pos += 1;
                match self.data.get(self.data_pos) {
                    Some(&next) => self.link.request(bus, ScsiPhase::DataIn, next),
                    None => self.enter_status(bus),
                }
            }
            DiskState::DataOut => {
                if let Some(slot) = self.data.get_mut(self.data_pos) {
                    *slot = byte;
                }
                self.data_pos += 1;

                let writing = matches!(self.command, Some(ScsiCommand::Write { .. }));
                if writing && self.data_pos.is_multiple_of(DISK_BLOCKSIZE) {
                    let idx = self.data_pos / DISK_BLOCKSIZE - 1;
                    if let Err(e) = self.flush_sector(idx) {
                        let block = self.lba + idx as u32;
                        log::error!("Write error at LBA {}: {:#}", block, e);
                        self.status = STATUS_CHECK_CONDITION;
                        self.set_sense(CC_KEY_MEDIUM_ERROR, ASC_NO_ADDITIONAL_SENSE, block);
                        return self.enter_status(bus);
                    }
                }

                if self.data_pos >= self.data.len() {
                    if !writing {
                        log::debug!("Discarding {} parameter bytes", self.data.len());
                    }
                    self.enter_status(bus);
                } else {
                    self.link.request(bus, ScsiPhase::DataOut, 0);
                }
            }
            DiskState::Status => {
                self.state = DiskState::MessageIn;
                self.link.request(bus, ScsiPhase::MessageIn, self.message);
            }
            DiskState::MessageIn => {
                self.link.release(bus);
                self.state = DiskState::Idle;
                self.command = None;
            }
        }
    }
}

impl ScsiTarget for ScsiTargetDisk {
    fn target_type(&self) -> ScsiTargetType {
        ScsiTargetType::Disk
    }

    fn attach(&mut self, id: usize) {
        self.link.attach(id);
        self.reset_state();
    }

    fn detach(&mut self) {
        self.link.detach();
        self.reset_state();
    }

    fn bus_id(&self) -> Option<usize> {
        self.link.id()
    }

    fn bus_changed(&mut self, bus: &mut ScsiBus) {
        let selectable = self.is_ready();
        let Some(event) = self.link.bus_changed(bus, selectable) else {
            return;
        };

        match event {
            LinkEvent::Reset => self.reset_state(),
            LinkEvent::Selected { atn } => {
                self.cmdbuf.clear();
                self.command = None;
                if atn {
                    self.state = DiskState::MessageOut;
                    self.link.request(bus, ScsiPhase::MessageOut, 0);
                } else {
                    self.state = DiskState::Command;
                    self.link.request(bus, ScsiPhase::Command, 0);
                }
            }
            LinkEvent::Transferred(byte) => self.transferred(bus, byte),
        }
    }

    fn reset(&mut self, bus: &mut ScsiBus) {
        if self.link.is_connected() {
            self.link.release(bus);
        }
        self.reset_state();
    }

    fn is_ready(&self) -> bool {
        self.ready || self.image.is_some()
    }

    fn capacity(&self) -> Option<u64> {
        Some(self.image.as_ref()?.byte_len())
    }

    fn image_path(&self) -> Option<&Path> {
        self.image.as_ref()?.image_path()
    }

    fn eject(&mut self) {
        Self::eject(self);
    }
}

impl Debuggable for ScsiTargetDisk {
    fn get_debug_properties(&self) -> DebuggableProperties {
        vec![
            dbgprop_enum!("State", self.state),
            dbgprop_string!("Handshake", self.link.handshake_name().to_string()),
            dbgprop_string!("Command", format!("{:02X?}", self.cmdbuf)),
            dbgprop_udec!("Data position", self.data_pos as u64),
            dbgprop_udec!("Data length", self.data.len() as u64),
            dbgprop_byte!("Status", self.status),
            dbgprop_group!(
                "Sense",
                vec![
                    dbgprop_byte!("Key", self.sense.key),
                    dbgprop_byte!("ASC", self.sense.asc),
                    dbgprop_byte!("ASCQ", self.sense.ascq),
                    dbgprop_long!("Information", self.sense.info),
                ]
            ),
            dbgprop_header!("Medium"),
            dbgprop_bool!("Ready", self.ready),
            dbgprop_bool!("Media changed", self.media_changed),
            dbgprop_udec!("Cylinders", self.geometry.cylinders),
            dbgprop_udec!("Heads", self.geometry.heads),
            dbgprop_udec!("Sectors/track", self.geometry.sectors_per_track),
            dbgprop_udec!("Total sectors", self.geometry.total_sectors),
        ]
    }
}
