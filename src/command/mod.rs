//! Command dispatch and execution engine
//!
//! This module handles:
//! - Resolving command names to registered extensions
//! - Validating arguments before anything touches hardware
//! - Serializing access to shared hardware resources
//! - Enforcing per-command deadlines
//! - Reporting exactly one outcome per command

mod dispatcher;
pub mod handlers;
mod locks;
mod registry;
mod reporter;
mod types;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use handlers::builtin_registry;
pub use reporter::{ReporterConfig, ResultReporter, ResultSink};
