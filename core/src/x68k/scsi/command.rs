//! SCSI command descriptor blocks (CDBs)

use arrayvec::ArrayVec;

/// Opcode plus up to 15 argument bytes
pub const CDB_MAX_LEN: usize = 16;

pub type Cdb = ArrayVec<u8, CDB_MAX_LEN>;

/// Length of a CDB, derived from the group code in the opcode
pub const fn cdb_len(opcode: u8) -> usize {
    match opcode >> 5 {
        // Group 0: 6-byte commands
        0 => 6,
        // Group 1, 2: 10-byte commands
        1 | 2 => 10,
        // Group 5: 12-byte commands
        5 => 12,
        // Reserved/vendor specific
        _ => 6,
    }
}

/// Decoded direct-access command
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum ScsiCommand {
    TestUnitReady,
    RezeroUnit,
    RequestSense { alloc_len: u8 },
    FormatUnit,
    /// READ(6), READ(10)
    Read { lba: u32, blocks: u32 },
    /// WRITE(6), WRITE(10)
    Write { lba: u32, blocks: u32 },
    Seek { lba: u32 },
    Inquiry { alloc_len: u8 },
    ModeSelect { param_len: u8 },
    ModeSense { page: u8, alloc_len: u8 },
    StartStopUnit { start: bool },
    ReadCapacity,
    Verify { lba: u32, blocks: u32, byte_check: bool },
    Unsupported(u8),
}

fn arg(cdb: &[u8], idx: usize) -> u8 {
    cdb.get(idx).copied().unwrap_or(0)
}

/// 21-bit LBA of a 6-byte CDB
fn lba6(cdb: &[u8]) -> u32 {
    (u32::from(arg(cdb, 1) & 0x1F) << 16) | (u32::from(arg(cdb, 2)) << 8) | u32::from(arg(cdb, 3))
}

/// Transfer length of a 6-byte CDB, where 0 means 256 blocks
fn blocks6(cdb: &[u8]) -> u32 {
    match arg(cdb, 4) {
        0 => 256,
        n => u32::from(n),
    }
}

fn lba10(cdb: &[u8]) -> u32 {
    u32::from_be_bytes([arg(cdb, 2), arg(cdb, 3), arg(cdb, 4), arg(cdb, 5)])
}

fn blocks10(cdb: &[u8]) -> u32 {
    u32::from(u16::from_be_bytes([arg(cdb, 7), arg(cdb, 8)]))
}

impl ScsiCommand {
    pub fn parse(cdb: &[u8]) -> Self {
        let opcode = arg(cdb, 0);
        match opcode {
            0x00 => Self::TestUnitReady,
            0x01 => Self::RezeroUnit,
            0x03 => Self::RequestSense {
                alloc_len: arg(cdb, 4),
            },
            0x04 => Self::FormatUnit,
            0x08 => Self::Read {
                lba: lba6(cdb),
                blocks: blocks6(cdb),
            },
            0x0A => Self::Write {
                lba: lba6(cdb),
                blocks: blocks6(cdb),
            },
            0x0B => Self::Seek { lba: lba6(cdb) },
            0x12 => Self::Inquiry {
                alloc_len: arg(cdb, 4),
            },
            0x15 => Self::ModeSelect {
                param_len: arg(cdb, 4),
            },
            0x1A => Self::ModeSense {
                page: arg(cdb, 2) & 0x3F,
                alloc_len: arg(cdb, 4),
            },
            0x1B => Self::StartStopUnit {
                start: arg(cdb, 4) & 0x01 != 0,
            },
            0x25 => Self::ReadCapacity,
            0x28 => Self::Read {
                lba: lba10(cdb),
                blocks: blocks10(cdb),
            },
            0x2A => Self::Write {
                lba: lba10(cdb),
                blocks: blocks10(cdb),
            },
            0x2F => Self::Verify {
                lba: lba10(cdb),
                blocks: blocks10(cdb),
                byte_check: arg(cdb, 1) & 0x02 != 0,
            },
            _ => Self::Unsupported(opcode),
        }
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_lengths() {
        assert_eq!(cdb_len(0x00), 6);
        assert_eq!(cdb_len(0x1B), 6);
        assert_eq!(cdb_len(0x25), 10);
        assert_eq!(cdb_len(0x2F), 10);
        assert_eq!(cdb_len(0x55), 10);
        assert_eq!(cdb_len(0xA8), 12);
        assert_eq!(cdb_len(0x88), 6);
    }

    #[test]
    fn read6_fields() {
        assert_eq!(
            ScsiCommand::parse(&[0x08, 0xE1, 0x23, 0x45, 0x10, 0x00]),
            ScsiCommand::Read {
                lba: 0x01_2345,
                blocks: 16
            }
        );
        // Zero length transfers 256 blocks
        assert_eq!(
            ScsiCommand::parse(&[0x0A, 0, 0, 1, 0, 0]),
            ScsiCommand::Write { lba: 1, blocks: 256 }
        );
    }

    #[test]
    fn ten_byte_fields() {
        assert_eq!(
            ScsiCommand::parse(&[0x28, 0, 0, 0, 0, 10, 0, 0, 2, 0]),
            ScsiCommand::Read { lba: 10, blocks: 2 }
        );
        assert_eq!(
            ScsiCommand::parse(&[0x2A, 0, 0x12, 0x34, 0x56, 0x78, 0, 0x01, 0x00, 0]),
            ScsiCommand::Write {
                lba: 0x1234_5678,
                blocks: 256
            }
        );
        assert_eq!(
            ScsiCommand::parse(&[0x2F, 0x02, 0, 0, 0, 0, 0, 0, 1, 0]),
            ScsiCommand::Verify {
                lba: 0,
                blocks: 1,
                byte_check: true
            }
        );
    }

    #[test]
    fn mode_sense_page_masked() {
        assert_eq!(
            ScsiCommand::parse(&[0x1A, 0, 0xFF, 0, 0x40, 0]),
            ScsiCommand::ModeSense {
                page: 0x3F,
                alloc_len: 0x40
            }
        );
    }

    #[test]
    fn unknown_opcode() {
        assert_eq!(ScsiCommand::parse(&[0xC2, 0, 0, 0, 0, 0]), ScsiCommand::Unsupported(0xC2));
        assert_eq!(ScsiCommand::Unsupported(0xC2).name(), "Unsupported");
    }
}
