//! Resilient work orchestrator for unattended multi-step workflows.
//!
//! The engine drives a scripted workflow against an external target
//! through a narrow action interface, checkpoints every piece of run
//! state to a durable store, and recovers from failures and stalls by
//! bounded retry, deliberate skip, and forced host restart.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod heartbeat;
pub mod persist;
pub mod recovery;
pub mod state;
pub mod stats;
pub mod types;

pub use checkpoint::*;
pub use config::*;
pub use engine::*;
pub use errors::*;
pub use events::*;
pub use executor::*;
pub use heartbeat::*;
pub use persist::*;
pub use recovery::*;
pub use state::*;
pub use stats::*;
pub use types::*;
