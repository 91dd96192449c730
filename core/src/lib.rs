pub mod bus;
pub mod debuggable;
pub mod tickable;
pub mod types;
pub mod x68k;
