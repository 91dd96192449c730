use anyhow::Result;

/// Representation of X amount of ticks (T-cycles)
/// of the main system clock (10 MHz on the X68000).
pub type Ticks = u64;

pub trait Tickable {
    /// Advances the component by `ticks` cycles, returns the amount consumed.
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks>;
}
