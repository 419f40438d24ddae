//! Bundled backing stores.

pub mod memory;

pub use memory::{Faults, MemoryBackend};
