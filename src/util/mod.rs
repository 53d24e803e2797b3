pub mod address;
pub mod constants;
pub mod memory;

pub use address::{Address, ByteOffset, ByteSize};
