//! Command and outcome types shared by the registry, dispatcher and reporter

use nic_agent_shared as proto;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::hardware::{BackendError, BackendErrorKind, Payload};

/// Argument object of a command
pub type Arguments = Payload;

/// A named operation submitted by the control plane
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub arguments: Arguments,
    /// Echoed back in the result; unique among in-flight commands
    pub correlation_id: String,
    /// Overrides the extension and dispatcher deadlines
    pub deadline: Option<Duration>,
}

impl Command {
    pub fn new(name: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Arguments::new(),
            correlation_id: correlation_id.into(),
            deadline: None,
        }
    }

    #[cfg(test)]
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    #[cfg(test)]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Failure categories reported to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownCommand,
    InvalidArguments,
    DeviceUnreachable,
    Busy,
    UnsupportedOperation,
    HardwareFault,
    Timeout,
}

impl From<BackendErrorKind> for ErrorKind {
    fn from(kind: BackendErrorKind) -> Self {
        match kind {
            BackendErrorKind::DeviceUnreachable => ErrorKind::DeviceUnreachable,
            BackendErrorKind::Busy => ErrorKind::Busy,
            BackendErrorKind::UnsupportedOperation => ErrorKind::UnsupportedOperation,
            BackendErrorKind::HardwareFault => ErrorKind::HardwareFault,
        }
    }
}

impl From<ErrorKind> for proto::ErrorKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::UnknownCommand => proto::ErrorKind::ErrorUnknownCommand,
            ErrorKind::InvalidArguments => proto::ErrorKind::ErrorInvalidArguments,
            ErrorKind::DeviceUnreachable => proto::ErrorKind::ErrorDeviceUnreachable,
            ErrorKind::Busy => proto::ErrorKind::ErrorBusy,
            ErrorKind::UnsupportedOperation => proto::ErrorKind::ErrorUnsupportedOperation,
            ErrorKind::HardwareFault => proto::ErrorKind::ErrorHardwareFault,
            ErrorKind::Timeout => proto::ErrorKind::ErrorTimeout,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::UnknownCommand => "unknown_command",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::DeviceUnreachable => "device_unreachable",
            ErrorKind::Busy => "busy",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::HardwareFault => "hardware_fault",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }
}

impl From<BackendError> for CommandError {
    fn from(err: BackendError) -> Self {
        Self {
            kind: err.kind.into(),
            message: err.message,
        }
    }
}

/// What an extension handler returns
pub type HandlerResult = Result<Payload, CommandError>;

/// Terminal result of exactly one command
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success { payload: Payload },
    Failure { error: CommandError },
}

impl ExecutionOutcome {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            error: CommandError::new(kind, message),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ExecutionOutcome::Success { .. } => None,
            ExecutionOutcome::Failure { error } => Some(error.kind),
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            ExecutionOutcome::Success { payload } => Some(payload),
            ExecutionOutcome::Failure { .. } => None,
        }
    }

    /// Wire form sent back to the control plane
    pub fn to_result(&self, correlation_id: &str, elapsed: Duration) -> proto::CommandResult {
        let processing_time_ms = elapsed.as_millis() as u64;
        match self {
            ExecutionOutcome::Success { payload } => proto::CommandResult::success(
                correlation_id,
                serde_json::Value::Object(payload.clone()).to_string(),
                processing_time_ms,
            ),
            ExecutionOutcome::Failure { error } => proto::CommandResult::failure(
                correlation_id,
                error.kind.into(),
                error.message.clone(),
                processing_time_ms,
            ),
        }
    }
}

impl From<HandlerResult> for ExecutionOutcome {
    fn from(result: HandlerResult) -> Self {
        match result {
            Ok(payload) => ExecutionOutcome::Success { payload },
            Err(error) => ExecutionOutcome::Failure { error },
        }
    }
}
