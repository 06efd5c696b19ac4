//! Consumer loop engine: per-queue receive loops, handler dispatch, settlement.

pub mod consumer;
pub mod handler;

pub use consumer::{ConsumerEngine, DeadLetterPolicy, EngineConfig, Settlement};
pub use handler::Handler;
