//! Timeout tracking for pending commands and silent agents

use super::dispatcher::CommandDispatcher;
use crate::session::SessionManager;
use nic_agent_shared::limits;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::warn;

/// Periodically expires overdue commands and reaps dead sessions
pub struct TimeoutTracker {
    dispatcher: Arc<CommandDispatcher>,
    sessions: Arc<SessionManager>,
    check_interval: Duration,
    heartbeat_timeout: Duration,
}

impl TimeoutTracker {
    pub fn new(dispatcher: Arc<CommandDispatcher>, sessions: Arc<SessionManager>) -> Self {
        Self {
            dispatcher,
            sessions,
            check_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_millis(limits::HEARTBEAT_TIMEOUT_MS),
        }
    }

    /// One sweep; returns how many commands timed out
    pub async fn sweep(&self) -> usize {
        let timed_out = self.dispatcher.take_timed_out().await;
        for cmd in &timed_out {
            warn!(
                correlation_id = %cmd.correlation_id,
                device_id = %cmd.device_id,
                "No result for {} after {:?}",
                cmd.name,
                cmd.sent_at.elapsed()
            );
        }

        for device_id in self.sessions.remove_dead_sessions(self.heartbeat_timeout).await {
            let orphaned = self.dispatcher.drop_device(&device_id).await;
            warn!(
                device_id = %device_id,
                "Agent silent for {:?}, session dropped ({} pending command(s) abandoned)",
                self.heartbeat_timeout,
                orphaned.len()
            );
        }

        timed_out.len()
    }

    /// Sweep forever at the check interval
    pub async fn run(&self) {
        let mut ticker = interval(self.check_interval);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}
