//! Sharp X68000 peripherals

pub mod scsi;
