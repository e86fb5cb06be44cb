//! Session management for connected agents
//!
//! This module handles:
//! - Tracking agent sessions by device ID
//! - Sending commands to a specific agent
//! - Heartbeat bookkeeping and dead session detection

mod connection;
mod manager;

pub use connection::{is_heartbeat, AgentInfo, AgentSession, SessionHandle};
pub use manager::SessionManager;
