//! Command dispatch and timeout tracking for the control plane
//!
//! This module handles:
//! - Sending scripted commands to specific agents
//! - Matching results to pending commands by correlation ID
//! - Expiring commands whose result never arrives

mod dispatcher;
mod timeout;

pub use dispatcher::{CommandDispatcher, PendingCommand, ScriptedCommand};
pub use timeout::TimeoutTracker;
