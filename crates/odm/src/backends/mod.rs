//! Storage backends

pub mod core;
pub mod memory;

pub use self::core::*;
pub use memory::MemoryStore;
