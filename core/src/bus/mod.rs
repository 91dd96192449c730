//! CPU-side bus plumbing

use num_traits::PrimInt;

/// Main CPU address data type (actually 24-bit)
pub type Address = u32;

/// Mask of the 24-bit 68000 address space
pub const ADDRESS_MASK: Address = 0x00FF_FFFF;

/// A peripheral decoded on the CPU bus.
///
/// Returns None if the address is not handled by this member.
pub trait BusMember<T: PrimInt> {
    fn read(&mut self, addr: T) -> Option<u8>;
    fn write(&mut self, addr: T, val: u8) -> Option<()>;
}

/// A contiguous, inclusive range on the CPU bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: Address,
    pub end: Address,
}

impl AddressRange {
    pub const fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, addr: Address) -> bool {
        let addr = addr & ADDRESS_MASK;
        addr >= self.start && addr <= self.end
    }

    /// Offset of `addr` from the start of the range, if it falls inside.
    pub fn offset(&self, addr: Address) -> Option<Address> {
        if self.contains(addr) {
            Some((addr & ADDRESS_MASK) - self.start)
        } else {
            None
        }
    }

    pub const fn len(&self) -> Address {
        self.end - self.start + 1
    }
}
