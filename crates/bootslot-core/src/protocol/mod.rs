//! Flash protocol implementations

pub mod spi25;
