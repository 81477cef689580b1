//! Cadence: a workflow orchestration engine for multi-stage agent tasks.
//!
//! Workflows move through a fixed sequence of stages (scoping, research,
//! planning, execution, review), each producing an approval-gated artifact.
//! Execution is broken into pulses: bounded units of work, each isolated on
//! its own branch and worktree, checkpointed by commit. Sessions record
//! every agent conversation turn by turn; the cost ledger attributes token
//! spend to the context that incurred it.
//!
//! [`engine::Engine`] is the async entry point; [`store::EngineDb`] is the
//! synchronous SQLite store underneath it.

pub mod context;
pub mod engine;
pub mod errors;
pub mod events;
pub mod ids;
pub mod models;
pub mod store;

pub use context::Context;
pub use engine::Engine;
pub use errors::{EngineError, EngineResult};
pub use events::{EngineEvent, EventHub};
pub use store::{DbHandle, EngineDb};
