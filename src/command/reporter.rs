//! Result reporting
//!
//! Turns an [`ExecutionOutcome`] into a wire `CommandResult` and delivers it
//! through a [`ResultSink`]. Delivery is retried a bounded number of times;
//! after that the result is dropped and logged, and the command is not
//! executed again.

use async_trait::async_trait;
use nic_agent_shared::CommandResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::types::ExecutionOutcome;
use crate::config::duration_ms;

/// Where results go: normally the management connection
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: CommandResult) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Delivery attempts per result, including the first
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct ResultReporter {
    sink: Arc<dyn ResultSink>,
    config: ReporterConfig,
}

impl ResultReporter {
    pub fn new(sink: Arc<dyn ResultSink>, config: ReporterConfig) -> Self {
        Self { sink, config }
    }

    /// Deliver one outcome. Returns whether the sink accepted it.
    pub async fn report(&self, correlation_id: &str, outcome: &ExecutionOutcome, elapsed: Duration) -> bool {
        let result = outcome.to_result(correlation_id, elapsed);
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.sink.deliver(result.clone()).await {
                Ok(()) => {
                    debug!(correlation_id, attempt, success = result.is_success(), "result delivered");
                    return true;
                }
                Err(e) => {
                    warn!(correlation_id, attempt, error = %e, "result delivery failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        error!(correlation_id, attempts, "dropping undeliverable result");
        false
    }
}
