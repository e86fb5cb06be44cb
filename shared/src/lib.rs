//! NIC Agent Shared Protocol Types
//!
//! This crate provides the wire types, framing codec and command lifecycle
//! shared between the on-NIC agent and the control plane.

pub mod codec;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

/// Management channel messages.
///
/// Declared directly with the `prost` derive macros. Command arguments and
/// result payloads travel as JSON text so the channel stays schema-free for
/// new extensions.
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Header {
        #[prost(string, tag = "1")]
        pub device_id: String,
        #[prost(uint64, tag = "2")]
        pub sequence_id: u64,
        #[prost(uint64, tag = "3")]
        pub timestamp_ms: u64,
        #[prost(enumeration = "MessageType", tag = "4")]
        pub msg_type: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Envelope {
        #[prost(message, optional, tag = "1")]
        pub header: Option<Header>,
        #[prost(oneof = "envelope::Payload", tags = "2, 3, 4")]
        pub payload: Option<envelope::Payload>,
    }

    pub mod envelope {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Payload {
            #[prost(message, tag = "2")]
            Command(super::CommandRequest),
            #[prost(message, tag = "3")]
            Result(super::CommandResult),
            #[prost(message, tag = "4")]
            Heartbeat(super::Heartbeat),
        }
    }

    /// A command sent by the control plane.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CommandRequest {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub correlation_id: String,
        /// JSON object; empty string means no arguments.
        #[prost(string, tag = "3")]
        pub arguments_json: String,
        /// Per-command execution deadline; 0 uses the agent default.
        #[prost(uint64, tag = "4")]
        pub deadline_ms: u64,
    }

    /// The terminal result of one command.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CommandResult {
        #[prost(string, tag = "1")]
        pub correlation_id: String,
        #[prost(enumeration = "ResultStatus", tag = "2")]
        pub status: i32,
        #[prost(string, tag = "3")]
        pub payload_json: String,
        #[prost(enumeration = "ErrorKind", tag = "4")]
        pub error_kind: i32,
        #[prost(string, tag = "5")]
        pub error_message: String,
        #[prost(uint64, tag = "6")]
        pub processing_time_ms: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Heartbeat {
        #[prost(uint64, tag = "1")]
        pub uptime_ms: u64,
        #[prost(uint32, tag = "2")]
        pub in_flight: u32,
        #[prost(bool, tag = "3")]
        pub healthy: bool,
        #[prost(string, tag = "4")]
        pub backend: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum MessageType {
        MsgUnknown = 0,
        MsgHeartbeat = 1,
        MsgCommand = 2,
        MsgResult = 3,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ResultStatus {
        StatusUnknown = 0,
        StatusSuccess = 1,
        StatusFailure = 2,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ErrorKind {
        ErrorNone = 0,
        ErrorUnknownCommand = 1,
        ErrorInvalidArguments = 2,
        ErrorDeviceUnreachable = 3,
        ErrorBusy = 4,
        ErrorUnsupportedOperation = 5,
        ErrorHardwareFault = 6,
        ErrorTimeout = 7,
    }
}

// Re-export commonly used types at crate root
pub use proto::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters shared by both ends of the management channel
pub mod limits {
    /// Agent heartbeat interval in milliseconds
    pub const HEARTBEAT_INTERVAL_MS: u64 = 5_000;

    /// A session silent for this long is considered dead by the control plane
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

    /// How long the control plane waits for a result before giving up
    pub const RESULT_TIMEOUT_MS: u64 = 15 * 60 * 1000;
}

impl Header {
    /// Create a new header with the given device ID and message type
    pub fn new(device_id: impl Into<String>, msg_type: MessageType, sequence_id: u64) -> Self {
        Self {
            device_id: device_id.into(),
            sequence_id,
            timestamp_ms: now_ms(),
            msg_type: msg_type.into(),
        }
    }
}

impl Heartbeat {
    pub fn new(uptime_ms: u64, in_flight: u32, healthy: bool, backend: impl Into<String>) -> Self {
        Self {
            uptime_ms,
            in_flight,
            healthy,
            backend: backend.into(),
        }
    }
}

impl CommandRequest {
    /// Create a request with JSON-encoded arguments
    pub fn new(
        name: impl Into<String>,
        correlation_id: impl Into<String>,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            correlation_id: correlation_id.into(),
            arguments_json: serde_json::Value::Object(arguments.clone()).to_string(),
            deadline_ms: 0,
        }
    }

    /// Decode the argument object. An empty string decodes to no arguments;
    /// anything other than a JSON object is an error.
    pub fn arguments(&self) -> Result<serde_json::Map<String, serde_json::Value>, serde_json::Error> {
        if self.arguments_json.trim().is_empty() {
            return Ok(serde_json::Map::new());
        }
        serde_json::from_str(&self.arguments_json)
    }
}

impl CommandResult {
    /// Result for a command that completed successfully
    pub fn success(
        correlation_id: impl Into<String>,
        payload_json: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResultStatus::StatusSuccess.into(),
            payload_json: payload_json.into(),
            error_kind: ErrorKind::ErrorNone.into(),
            error_message: String::new(),
            processing_time_ms,
        }
    }

    /// Result for a command that failed
    pub fn failure(
        correlation_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResultStatus::StatusFailure.into(),
            payload_json: String::new(),
            error_kind: kind.into(),
            error_message: message.into(),
            processing_time_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == i32::from(ResultStatus::StatusSuccess)
    }
}
