//! Command dispatcher
//!
//! Accepts commands, resolves them against the extension registry, takes the
//! declared resource locks, runs the handler under a deadline and reports
//! exactly one outcome per command. Every command runs on its own task;
//! a semaphore bounds how many of them execute at once.

use nic_agent_shared::state_machine::{CommandEvent, CommandLifecycle, CommandState};
use nic_agent_shared::CommandRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::handlers::HandlerContext;
use super::locks::{LockGuard, LockTicket, ResourceLockManager};
use super::registry::{Extension, ExtensionRegistry};
use super::reporter::ResultReporter;
use super::types::{Arguments, Command, CommandError, ErrorKind, ExecutionOutcome};
use crate::config::duration_ms;
use crate::hardware::{cancel_pair, HardwareBackend};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Commands executing at the same time
    pub workers: usize,
    /// Deadline for commands whose extension declares none
    #[serde(with = "duration_ms", rename = "default_deadline_ms")]
    pub default_deadline: Duration,
    /// How long shutdown waits for in-flight commands
    #[serde(with = "duration_ms", rename = "shutdown_grace_ms")]
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_deadline: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Snapshot of a command between admission and its report
#[derive(Debug, Clone)]
pub struct InFlightCommand {
    pub correlation_id: String,
    pub name: String,
    pub state: CommandState,
    pub admitted_at: Instant,
}

/// Resolves to the command's outcome once it has been reported
#[derive(Debug)]
pub struct CommandHandle {
    rx: oneshot::Receiver<ExecutionOutcome>,
}

impl CommandHandle {
    pub async fn outcome(self) -> ExecutionOutcome {
        self.rx.await.unwrap_or_else(|_| {
            ExecutionOutcome::failure(ErrorKind::HardwareFault, "command task ended without an outcome")
        })
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ExtensionRegistry>,
    backend: Arc<dyn HardwareBackend>,
    locks: ResourceLockManager,
    reporter: ResultReporter,
    workers: Arc<Semaphore>,
    config: DispatcherConfig,
    in_flight: Mutex<HashMap<String, InFlightCommand>>,
    accepting: AtomicBool,
    /// Set once shutdown stops waiting and forces timeouts
    force: watch::Sender<bool>,
    idle: Notify,
}

/// What `submit` decided before the command's task started
enum Plan {
    Unknown(String),
    Invalid(CommandError),
    Ready {
        extension: Arc<Extension>,
        ticket: Option<LockTicket>,
    },
}

/// Why a command stopped before its handler finished
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Deadline(Duration),
    Shutdown,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ExtensionRegistry>,
        backend: Arc<dyn HardwareBackend>,
        reporter: ResultReporter,
        config: DispatcherConfig,
    ) -> Self {
        let (force, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                registry,
                backend,
                locks: ResourceLockManager::new(),
                reporter,
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                config,
                in_flight: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                force,
                idle: Notify::new(),
            }),
        }
    }

    /// Start executing a command. Never blocks; the returned handle resolves
    /// to the outcome after it has been reported.
    pub fn submit(&self, command: Command) -> CommandHandle {
        let admission = self
            .admit(&command)
            .map(|entry| (entry, self.inner.plan(&command)));
        self.spawn(command, admission)
    }

    /// Submit a command as decoded from the management channel
    pub fn submit_request(&self, request: &CommandRequest) -> CommandHandle {
        let deadline = (request.deadline_ms > 0).then(|| Duration::from_millis(request.deadline_ms));
        match request.arguments() {
            Ok(arguments) => self.submit(Command {
                name: request.name.clone(),
                arguments,
                correlation_id: request.correlation_id.clone(),
                deadline,
            }),
            Err(e) => {
                let command = Command {
                    name: request.name.clone(),
                    arguments: Arguments::new(),
                    correlation_id: request.correlation_id.clone(),
                    deadline,
                };
                let outcome = ExecutionOutcome::failure(
                    ErrorKind::InvalidArguments,
                    format!("arguments are not a JSON object: {e}"),
                );
                self.spawn(command, Err(outcome))
            }
        }
    }

    pub fn in_flight(&self) -> Vec<InFlightCommand> {
        self.inner.in_flight().values().cloned().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight().len()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    pub fn locks(&self) -> &ResourceLockManager {
        &self.inner.locks
    }

    /// Stop accepting commands and wait up to `grace` for in-flight ones.
    /// Whatever is still running afterwards is timed out. Returns how many
    /// commands had to be forced.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        if self.inner.accepting.swap(false, Ordering::SeqCst) {
            info!(in_flight = self.in_flight_count(), "dispatcher draining");
        }

        if tokio::time::timeout(grace, self.inner.wait_idle()).await.is_ok() {
            info!("dispatcher drained");
            return 0;
        }

        let forced = self.in_flight_count();
        warn!(forced, ?grace, "grace period elapsed, timing out remaining commands");
        self.inner.force.send_replace(true);
        self.inner.wait_idle().await;
        forced
    }

    fn admit(&self, command: &Command) -> Result<InFlightEntry, ExecutionOutcome> {
        if !self.is_accepting() {
            return Err(ExecutionOutcome::failure(ErrorKind::Busy, "agent is shutting down"));
        }

        let mut in_flight = self.inner.in_flight();
        if in_flight.contains_key(&command.correlation_id) {
            return Err(ExecutionOutcome::failure(
                ErrorKind::InvalidArguments,
                format!("correlation id `{}` is already in flight", command.correlation_id),
            ));
        }
        in_flight.insert(
            command.correlation_id.clone(),
            InFlightCommand {
                correlation_id: command.correlation_id.clone(),
                name: command.name.clone(),
                state: CommandState::Received,
                admitted_at: Instant::now(),
            },
        );

        Ok(InFlightEntry {
            inner: self.inner.clone(),
            correlation_id: command.correlation_id.clone(),
        })
    }

    fn spawn(&self, command: Command, admission: Result<(InFlightEntry, Plan), ExecutionOutcome>) -> CommandHandle {
        let (tx, rx) = oneshot::channel();
        let handle = CommandHandle { rx };

        let inner = self.inner.clone();
        let span = info_span!(
            "command",
            command = %command.name,
            correlation_id = %command.correlation_id
        );
        tokio::spawn(
            async move {
                let started = Instant::now();
                let (outcome, mut tracker) = match admission {
                    Ok((entry, plan)) => {
                        let mut tracker = Tracker::new(Some(entry));
                        let outcome = inner.execute(&command, plan, &mut tracker).await;
                        (outcome, tracker)
                    }
                    Err(outcome) => {
                        let mut tracker = Tracker::new(None);
                        warn!(reason = ?outcome.error_kind(), "command refused");
                        tracker.advance(CommandEvent::Rejected);
                        (outcome, tracker)
                    }
                };

                inner
                    .reporter
                    .report(&command.correlation_id, &outcome, started.elapsed())
                    .await;
                tracker.advance(CommandEvent::Reported);
                // Leave the in-flight table before the caller sees the outcome
                drop(tracker);
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );

        handle
    }
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlightCommand>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Resolve, validate and take a place in the lock queues. Runs inside
    /// `submit`, so commands on a shared resource are granted in submission
    /// order whatever order their tasks are scheduled in.
    fn plan(&self, command: &Command) -> Plan {
        let extension = match self.registry.resolve(&command.name) {
            Ok(extension) => extension,
            Err(e) => return Plan::Unknown(e.to_string()),
        };
        if let Err(error) = extension.validate(&command.arguments) {
            return Plan::Invalid(error);
        }
        let resources = extension.resources();
        let ticket = (!resources.is_empty()).then(|| self.locks.reserve(resources, &command.correlation_id));
        Plan::Ready { extension, ticket }
    }

    async fn execute(&self, command: &Command, plan: Plan, tracker: &mut Tracker) -> ExecutionOutcome {
        let (extension, ticket) = match plan {
            Plan::Unknown(message) => {
                warn!(error = %message, "rejecting command");
                tracker.advance(CommandEvent::Rejected);
                return ExecutionOutcome::failure(ErrorKind::UnknownCommand, message);
            }
            Plan::Invalid(error) => {
                tracker.advance(CommandEvent::Resolved);
                warn!(%error, "rejecting command");
                tracker.advance(CommandEvent::Rejected);
                return ExecutionOutcome::Failure { error };
            }
            Plan::Ready { extension, ticket } => (extension, ticket),
        };
        tracker.advance(CommandEvent::Resolved);

        let mut force = self.force.subscribe();

        // Locks first: a worker slot is never held while queued on a resource
        let guard = match ticket {
            Some(ticket) => match self.await_resources(ticket, tracker, &mut force).await {
                Ok(guard) => Some(guard),
                Err(outcome) => return outcome,
            },
            None => None,
        };
        let permit = match self.acquire_worker(tracker, &mut force).await {
            Ok(permit) => permit,
            Err(outcome) => return outcome,
        };

        let outcome = self.run_handler(&extension, command, tracker, &mut force).await;

        // Locks and the worker slot go back before the result is reported
        drop(permit);
        drop(guard);
        outcome
    }

    async fn await_resources(
        &self,
        ticket: LockTicket,
        tracker: &mut Tracker,
        force: &mut watch::Receiver<bool>,
    ) -> Result<LockGuard, ExecutionOutcome> {
        if !ticket.contended().is_empty() {
            info!(contended = ?ticket.contended(), "waiting for resources");
            tracker.advance(CommandEvent::Blocked);
        }
        tokio::select! {
            guard = ticket.granted() => Ok(guard),
            _ = forced(force) => {
                tracker.advance(CommandEvent::DeadlineExpired);
                Err(ExecutionOutcome::failure(
                    ErrorKind::Timeout,
                    "agent shut down before resources were granted",
                ))
            }
        }
    }

    async fn acquire_worker(
        &self,
        tracker: &mut Tracker,
        force: &mut watch::Receiver<bool>,
    ) -> Result<OwnedSemaphorePermit, ExecutionOutcome> {
        if let Ok(permit) = self.workers.clone().try_acquire_owned() {
            return Ok(permit);
        }

        debug!("waiting for a worker slot");
        if tracker.state() != CommandState::ResourceWait {
            tracker.advance(CommandEvent::Blocked);
        }
        tokio::select! {
            permit = self.workers.clone().acquire_owned() => permit.map_err(|_| {
                tracker.advance(CommandEvent::Rejected);
                ExecutionOutcome::failure(ErrorKind::Busy, "worker pool closed")
            }),
            _ = forced(force) => {
                tracker.advance(CommandEvent::DeadlineExpired);
                Err(ExecutionOutcome::failure(
                    ErrorKind::Timeout,
                    "agent shut down before a worker slot was free",
                ))
            }
        }
    }

    async fn run_handler(
        &self,
        extension: &Extension,
        command: &Command,
        tracker: &mut Tracker,
        force: &mut watch::Receiver<bool>,
    ) -> ExecutionOutcome {
        let deadline = command
            .deadline
            .or(extension.default_deadline())
            .unwrap_or(self.config.default_deadline);

        let (cancel_handle, cancel) = cancel_pair();
        let ctx = HandlerContext {
            correlation_id: command.correlation_id.clone(),
            args: command.arguments.clone(),
            backend: self.backend.clone(),
            cancel,
        };

        tracker.advance(CommandEvent::Started);
        let mut task = tokio::spawn(extension.invoke(ctx).in_current_span());

        let interrupt = tokio::select! {
            joined = &mut task => {
                return match joined {
                    Ok(Ok(payload)) => {
                        tracker.advance(CommandEvent::Succeeded);
                        info!("command completed");
                        ExecutionOutcome::Success { payload }
                    }
                    Ok(Err(error)) => {
                        tracker.advance(CommandEvent::Faulted);
                        warn!(%error, "command failed");
                        ExecutionOutcome::Failure { error }
                    }
                    Err(join_error) => {
                        tracker.advance(CommandEvent::Faulted);
                        let message = if join_error.is_panic() {
                            "handler panicked"
                        } else {
                            "handler task was aborted"
                        };
                        error!(error = %join_error, "{message}");
                        ExecutionOutcome::failure(ErrorKind::HardwareFault, message)
                    }
                };
            }
            _ = tokio::time::sleep(deadline) => Interrupt::Deadline(deadline),
            _ = forced(force) => Interrupt::Shutdown,
        };

        // The handler keeps running detached; whatever it returns is dropped
        cancel_handle.cancel();
        tracker.advance(CommandEvent::DeadlineExpired);
        tokio::spawn(
            async move {
                if let Ok(late) = task.await {
                    debug!(success = late.is_ok(), "discarding late handler result");
                }
            }
            .in_current_span(),
        );

        let message = match interrupt {
            Interrupt::Deadline(deadline) => format!("no result within {deadline:?}"),
            Interrupt::Shutdown => "agent shut down while the command was executing".to_string(),
        };
        warn!(?interrupt, "command timed out");
        ExecutionOutcome::failure(ErrorKind::Timeout, message)
    }
}

/// Resolves once shutdown forces outstanding commands to time out
async fn forced(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Membership in the in-flight table; leaving it may complete a drain
struct InFlightEntry {
    inner: Arc<Inner>,
    correlation_id: String,
}

impl InFlightEntry {
    fn set_state(&self, state: CommandState) {
        if let Some(entry) = self.inner.in_flight().get_mut(&self.correlation_id) {
            entry.state = state;
        }
    }
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        let now_idle = {
            let mut in_flight = self.inner.in_flight();
            in_flight.remove(&self.correlation_id);
            in_flight.is_empty()
        };
        if now_idle {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Drives one command's lifecycle and mirrors it into the in-flight table
struct Tracker {
    lifecycle: CommandLifecycle,
    entry: Option<InFlightEntry>,
}

impl Tracker {
    fn new(entry: Option<InFlightEntry>) -> Self {
        Self {
            lifecycle: CommandLifecycle::new(),
            entry,
        }
    }

    fn state(&self) -> CommandState {
        self.lifecycle.state()
    }

    fn advance(&mut self, event: CommandEvent) {
        match self.lifecycle.process_event(event) {
            Ok(state) => {
                debug!(?state, "lifecycle");
                if let Some(entry) = &self.entry {
                    entry.set_state(state);
                }
            }
            Err(e) => warn!(error = %e, "ignoring lifecycle event"),
        }
    }
}
