//! Durable key-value state store for the Drover engine.
//!
//! The engine checkpoints every piece of run state here so that a
//! destroyed and recreated host process can cold-resume mid-run.

pub mod fs;
pub mod memory;
pub mod store;

pub use fs::*;
pub use memory::*;
pub use store::*;
