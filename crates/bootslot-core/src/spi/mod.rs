//! SPI types and command structures
//!
//! The flash program engine talks to the boot flash through these types.
//! Only single-I/O transactions are modelled; the update path never needs
//! fast reads.

mod address;
mod command;
pub mod opcodes;

pub use address::AddressWidth;
pub use command::SpiCommand;
