pub mod config;
pub mod error;
pub mod memory;
pub mod netdev;
pub mod rx;
pub mod socket;
pub mod stats;
pub mod transport;
pub mod tx;
pub mod wire;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

pub const KI_B: usize = 1024;
pub const MI_B: usize = 1024 * KI_B;
pub const GI_B: usize = 1024 * MI_B;
