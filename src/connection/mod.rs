//! Management channel to the control plane
//!
//! - Persistent TCP connection with exponential reconnect backoff
//! - Length-prefixed protobuf framing
//! - Periodic heartbeats with agent status
//! - Outbound queue shared by heartbeats and command results

mod manager;
mod sink;

pub use manager::{AgentStatus, ConnectionConfig, ConnectionEvent, ConnectionManager};
