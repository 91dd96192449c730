//! SCSI bus, MB89352 protocol controller, devices and associated code

pub mod bus;
pub mod command;
pub mod config;
pub mod disk;
pub mod disk_image;
pub mod iocs;
pub mod port;
pub mod rom;
pub mod spc;
pub mod system;
pub mod target;

use std::ops::{BitAnd, BitOr, Not};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

pub const STATUS_GOOD: u8 = 0;
pub const STATUS_CHECK_CONDITION: u8 = 2;

/// COMMAND COMPLETE message
pub const MSG_COMMAND_COMPLETE: u8 = 0x00;

pub const CC_KEY_NO_SENSE: u8 = 0x00;
pub const CC_KEY_NOT_READY: u8 = 0x02;
pub const CC_KEY_MEDIUM_ERROR: u8 = 0x03;
pub const CC_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub const CC_KEY_UNIT_ATTENTION: u8 = 0x06;

pub const ASC_NO_ADDITIONAL_SENSE: u8 = 0x00;
pub const ASC_INVALID_COMMAND: u8 = 0x20;
pub const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
pub const ASC_INVALID_FIELD_IN_CDB: u8 = 0x24;
pub const ASC_MEDIUM_CHANGED: u8 = 0x28;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

/// Bus address of the controller (initiator)
pub const INITIATOR_ID: usize = 7;

/// Amount of target slots per bus (IDs 0 - 6)
pub const MAX_TARGETS: usize = 7;

bitfield! {
    /// SCSI bus control signals, as driven by one participant or combined
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ScsiSignals(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Information transfer phase (MSG, C/D, I/O)
        pub phase: u8 @ 0..=2,

        pub io: bool @ 0,
        pub cd: bool @ 1,
        pub msg: bool @ 2,
        pub bsy: bool @ 3,
        pub sel: bool @ 4,
        pub req: bool @ 5,
        pub ack: bool @ 6,
        pub atn: bool @ 7,
        pub rst: bool @ 8,
    }
}

impl ScsiSignals {
    pub const NONE: Self = Self(0);
    pub const IO: Self = Self(1 << 0);
    pub const CD: Self = Self(1 << 1);
    pub const MSG: Self = Self(1 << 2);
    pub const BSY: Self = Self(1 << 3);
    pub const SEL: Self = Self(1 << 4);
    pub const REQ: Self = Self(1 << 5);
    pub const ACK: Self = Self(1 << 6);
    pub const ATN: Self = Self(1 << 7);
    pub const RST: Self = Self(1 << 8);

    pub const PHASE_MASK: Self = Self(0x007);
    pub const ALL: Self = Self(0x1FF);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 & Self::ALL.0 == 0
    }
}

impl BitOr for ScsiSignals {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for ScsiSignals {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for ScsiSignals {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

/// Information transfer phases, as encoded on MSG, C/D and I/O
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, strum::IntoStaticStr, Serialize, Deserialize,
)]
pub enum ScsiPhase {
    /// Initiator -> Target
    DataOut = 0,
    /// Target -> Initiator
    DataIn = 1,
    Command = 2,
    Status = 3,
    MessageOut = 6,
    MessageIn = 7,
}

impl ScsiPhase {
    /// Decodes the phase lines, None for the two reserved encodings.
    pub fn from_bits(bits: u8) -> Option<Self> {
        Self::from_u8(bits & 0x07)
    }

    pub fn from_signals(signals: ScsiSignals) -> Option<Self> {
        Self::from_bits(signals.phase())
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    pub const fn signals(self) -> ScsiSignals {
        ScsiSignals(self as u16)
    }

    /// True for phases where the target drives the data bus.
    pub const fn is_input(self) -> bool {
        self as u8 & 1 != 0
    }
}

/// Result of a command
pub(crate) enum ScsiCmdResult {
    /// Immediately turn to the Status phase
    Status(u8),
    /// Returns data to the initiator
    DataIn(Vec<u8>),
    /// Expects data written to target
    DataOut(usize),
}

/// An output line towards an external collaborator (interrupt controller,
/// DMA engine).
pub trait SignalLine {
    fn set_level(&mut self, asserted: bool);
}

impl<F: FnMut(bool)> SignalLine for F {
    fn set_level(&mut self, asserted: bool) {
        self(asserted);
    }
}
