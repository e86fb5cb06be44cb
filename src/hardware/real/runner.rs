//! External tool invocation
//!
//! Every vendor tool call goes through [`CommandRunner`] so the real backend
//! can be exercised against scripted output in tests.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::hardware::{BackendError, CancelSignal};

/// One tool invocation: program, arguments and extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Environment values are left out so secrets never reach the logs
impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// The vendor RPC scripts report some failures only on stderr, so any
    /// stderr output counts as failure even with a zero exit code.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.stderr.trim().is_empty()
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("`{0}` not found")]
    NotFound(String),

    #[error("failed to run `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },

    #[error("`{0}` was cancelled")]
    Cancelled(String),
}

impl From<RunError> for BackendError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::NotFound(_) => BackendError::unsupported(err.to_string()),
            RunError::TimedOut { .. } => BackendError::unreachable(err.to_string()),
            RunError::Io { .. } | RunError::Cancelled(_) => BackendError::fault(err.to_string()),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancelSignal,
    ) -> Result<CommandOutput, RunError>;
}

/// Runs tools as child processes with a hard timeout. The child is killed on
/// timeout or cancellation.
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancelSignal,
    ) -> Result<CommandOutput, RunError> {
        let program = invocation.program.clone();
        debug!(command = %invocation, "running tool");

        let child = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => RunError::NotFound(program.clone()),
                _ => RunError::Io {
                    program: program.clone(),
                    source,
                },
            })?;

        // Dropping the wait future drops the child, which kills it
        tokio::select! {
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => Ok(output.into()),
                Ok(Err(source)) => Err(RunError::Io { program, source }),
                Err(_) => Err(RunError::TimedOut { program, after: self.timeout }),
            },
            _ = cancel.cancelled() => Err(RunError::Cancelled(program)),
        }
    }
}

/// Map a failed tool run onto the backend error vocabulary
pub fn classify_failure(invocation: &Invocation, output: &CommandOutput) -> BackendError {
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    let message = match output.exit_code {
        Some(code) => format!("`{invocation}` exited with {code}: {detail}"),
        None => format!("`{invocation}` was killed: {detail}"),
    };

    let lowered = detail.to_ascii_lowercase();
    if ["unable to establish", "timed out", "timeout", "no route"]
        .iter()
        .any(|p| lowered.contains(p))
    {
        BackendError::unreachable(message)
    } else if lowered.contains("busy") {
        BackendError::busy(message)
    } else if lowered.contains("invalid command") || lowered.contains("not supported") {
        BackendError::unsupported(message)
    } else {
        BackendError::fault(message)
    }
}

/// Run a tool and turn anything but a clean exit into a [`BackendError`]
pub async fn run_checked(
    runner: &dyn CommandRunner,
    invocation: &Invocation,
    cancel: &CancelSignal,
) -> Result<CommandOutput, BackendError> {
    let output = runner.run(invocation, cancel).await?;
    if output.succeeded() {
        Ok(output)
    } else {
        Err(classify_failure(invocation, &output))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Script = Box<dyn Fn(&Invocation) -> Result<CommandOutput, RunError> + Send + Sync>;

    /// Answers invocations from a closure and records every call
    pub struct ScriptedRunner {
        script: Script,
        calls: Mutex<Vec<Invocation>>,
    }

    impl ScriptedRunner {
        pub fn new(
            script: impl Fn(&Invocation) -> Result<CommandOutput, RunError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Every call succeeds with empty output
        pub fn succeeding() -> Self {
            Self::new(|_| Ok(CommandOutput::ok("")))
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        /// Calls rendered as command lines
        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(ToString::to_string).collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            invocation: &Invocation,
            cancel: &CancelSignal,
        ) -> Result<CommandOutput, RunError> {
            self.calls.lock().unwrap().push(invocation.clone());
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled(invocation.program.clone()));
            }
            (self.script)(invocation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::BackendErrorKind;

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn stderr_output_marks_failure() {
        let output = CommandOutput {
            exit_code: Some(0),
            stdout: "ok".into(),
            stderr: "warning: bdev exists\n".into(),
        };
        assert!(!output.succeeded());
        assert!(CommandOutput::ok("done").succeeded());
    }

    #[test]
    fn failures_are_classified_by_message() {
        let inv = Invocation::new("ipmitool").args(["chassis", "power", "on"]);
        let cases = [
            ("Error: Unable to establish IPMI v2 / RMCP+ session", BackendErrorKind::DeviceUnreachable),
            ("connect: No route to host", BackendErrorKind::DeviceUnreachable),
            ("device or resource busy", BackendErrorKind::Busy),
            ("Invalid command", BackendErrorKind::UnsupportedOperation),
            ("checksum error in SDR", BackendErrorKind::HardwareFault),
        ];
        for (stderr, kind) in cases {
            assert_eq!(classify_failure(&inv, &failed(stderr)).kind, kind, "{stderr}");
        }
    }

    #[test]
    fn run_errors_map_to_backend_kinds() {
        let missing: BackendError = RunError::NotFound("qemu-img".into()).into();
        assert_eq!(missing.kind, BackendErrorKind::UnsupportedOperation);

        let slow: BackendError = RunError::TimedOut {
            program: "ipmitool".into(),
            after: Duration::from_secs(30),
        }
        .into();
        assert_eq!(slow.kind, BackendErrorKind::DeviceUnreachable);
    }

    #[test]
    fn display_omits_environment() {
        let inv = Invocation::new("ipmitool")
            .args(["-E", "chassis", "status"])
            .env("IPMI_PASSWORD", "hunter2");
        assert_eq!(inv.to_string(), "ipmitool -E chassis status");
    }

    #[tokio::test]
    async fn missing_program_is_reported_as_not_found() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let result = runner
            .run(
                &Invocation::new("definitely-not-a-real-tool-7f3a"),
                &CancelSignal::never(),
            )
            .await;
        assert!(matches!(result, Err(RunError::NotFound(_))));
    }
}
