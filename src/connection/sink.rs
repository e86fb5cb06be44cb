//! Result sink backed by the connection's outbound queue

use async_trait::async_trait;
use nic_agent_shared::{envelope, CommandResult, Envelope, MessageType};
use std::time::Duration;
use tokio::sync::mpsc;

use super::manager::Outbound;
use crate::command::ResultSink;

/// How long a delivery may wait for room in the outbound queue
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ChannelSink {
    outbound: Outbound,
    tx: mpsc::Sender<Envelope>,
}

impl ChannelSink {
    pub(crate) fn new(outbound: Outbound, tx: mpsc::Sender<Envelope>) -> Self {
        Self { outbound, tx }
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    /// Queues the result; it is written once the link is up. Fails when the
    /// queue stays full (link down for a long time) or the manager is gone.
    async fn deliver(&self, result: CommandResult) -> anyhow::Result<()> {
        let envelope = Envelope {
            header: Some(self.outbound.header(MessageType::MsgResult)),
            payload: Some(envelope::Payload::Result(result)),
        };
        self.tx
            .send_timeout(envelope, ENQUEUE_TIMEOUT)
            .await
            .map_err(|e| anyhow::anyhow!("outbound queue unavailable: {e}"))
    }
}
