//! Data models shared across the relay

pub mod exchange;
pub mod signal;

pub use exchange::*;
pub use signal::*;
