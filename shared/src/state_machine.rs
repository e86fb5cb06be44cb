//! Command Lifecycle State Machine
//!
//! Every command the agent accepts walks
//! `Received → Resolved → (ResourceWait) → Executing → {Completed | Failed | TimedOut} → Reported`.
//! Rejections before execution jump straight to `Failed`.

use thiserror::Error;

/// Lifecycle state of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    Received,
    Resolved,
    ResourceWait,
    Executing,
    Completed,
    Failed,
    TimedOut,
    Reported,
}

impl CommandState {
    /// Completed, Failed and TimedOut are terminal; only reporting follows them
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Failed | CommandState::TimedOut
        )
    }
}

/// Events that drive the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEvent {
    /// Name matched a registered extension
    Resolved,
    /// Unknown name, bad arguments, duplicate id or agent shutting down
    Rejected,
    /// Waiting for a worker slot or for declared resources
    Blocked,
    /// Handler invocation started
    Started,
    /// Handler returned a payload
    Succeeded,
    /// Handler or backend returned an error
    Faulted,
    /// The execution deadline fired (or shutdown forced it)
    DeadlineExpired,
    /// Outcome handed to the reporter
    Reported,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid lifecycle transition: {event:?} in state {from:?}")]
pub struct TransitionError {
    pub from: CommandState,
    pub event: CommandEvent,
}

/// Tracks and validates one command's lifecycle
#[derive(Debug)]
pub struct CommandLifecycle {
    current_state: CommandState,
    history: Vec<CommandState>,
}

impl Default for CommandLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandLifecycle {
    pub fn new() -> Self {
        Self {
            current_state: CommandState::Received,
            history: vec![CommandState::Received],
        }
    }

    pub fn state(&self) -> CommandState {
        self.current_state
    }

    /// Every state visited so far, in order
    pub fn history(&self) -> &[CommandState] {
        &self.history
    }

    /// Apply an event. Invalid events leave the state unchanged.
    pub fn process_event(&mut self, event: CommandEvent) -> Result<CommandState, TransitionError> {
        let next = next_state(self.current_state, event).ok_or(TransitionError {
            from: self.current_state,
            event,
        })?;
        self.current_state = next;
        self.history.push(next);
        Ok(next)
    }
}

fn next_state(from: CommandState, event: CommandEvent) -> Option<CommandState> {
    use CommandEvent as E;
    use CommandState::*;

    match (from, event) {
        (Received, E::Resolved) => Some(Resolved),
        (Received | Resolved | ResourceWait, E::Rejected) => Some(Failed),

        (Resolved, E::Blocked) => Some(ResourceWait),
        (Resolved | ResourceWait, E::Started) => Some(Executing),
        // Shutdown can force a timeout on a command still queued for locks
        (ResourceWait, E::DeadlineExpired) => Some(TimedOut),

        (Executing, E::Succeeded) => Some(Completed),
        (Executing, E::Faulted) => Some(Failed),
        (Executing, E::DeadlineExpired) => Some(TimedOut),

        (Completed | Failed | TimedOut, E::Reported) => Some(Reported),

        _ => None,
    }
}
