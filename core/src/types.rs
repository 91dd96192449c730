use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

pub type Byte = u8;
pub type Word = u16;
pub type Long = u32;

bitfield! {
    /// 24-bit counter split into three register-sized views
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Field24(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub high: u8 @ 16..24,
        pub mid: u8 @ 8..16,
        pub low: u8 @ 0..8,
    }
}

impl Field24 {
    pub const MASK: u32 = 0x00FF_FFFF;

    pub fn new(val: u32) -> Self {
        Self(val & Self::MASK)
    }

    pub fn get(&self) -> u32 {
        self.0 & Self::MASK
    }

    pub fn is_zero(&self) -> bool {
        self.get() == 0
    }

    /// Decrements by one, saturating at zero.
    pub fn decrement(&mut self) {
        self.0 = self.get().saturating_sub(1);
    }
}

/// A self-clearing latch for events etc.
#[derive(Debug, Default)]
pub struct LatchingEvent {
    val: bool,
}

impl LatchingEvent {
    /// Returns the current value and clears the event.
    pub fn get_clear(&mut self) -> bool {
        let v = self.val;
        self.val = false;
        v
    }

    /// Sets the event.
    pub fn set(&mut self) {
        self.val = true;
    }

    /// Peeks at the event without clearing it
    pub fn peek(&self) -> bool {
        self.val
    }
}
