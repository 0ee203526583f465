//! Conduit Core
//!
//! Domain types, the condition-expression language, error handling and the
//! port traits shared by the engine and the command-line tools. This crate
//! has no runtime dependencies and defines the vocabulary used everywhere
//! else.

pub mod error;
pub mod events;
pub mod expr;
pub mod ids;
pub mod ports;
pub mod run;
pub mod runner;
pub mod secrets;
pub mod trigger;
pub mod workflow;

pub use error::{DefinitionError, Error, Result};
pub use ids::*;
