//! Relay Engine - Sizing, flatten primitives, per-key queue, and the
//! signal-chain state machine

pub mod chain;
pub mod context;
pub mod dispatch;
pub mod flatten;
pub mod queue;
pub mod sizing;

pub use context::{Engine, EngineConfig};
pub use dispatch::Dispatcher;
pub use queue::KeyedQueue;
