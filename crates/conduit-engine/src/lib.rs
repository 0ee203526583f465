//! Workflow scheduling and orchestration for Conduit.
//!
//! The [`Engine`] ties together the definition store, trigger matching,
//! dependency graphs, the runner registry, the dispatch queue and the
//! concurrency group manager. Run state transitions live in
//! [`coordinator::RunState`], which is synchronous and returns effects the
//! engine applies.

pub mod concurrency;
pub mod config;
pub mod coordinator;
pub mod dag;
pub mod matrix;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod triggers;

pub use config::EngineConfig;
pub use scheduler::Engine;
pub use store::WorkflowStore;
