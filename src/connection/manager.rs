//! Connection manager with a persistent link to the control plane and
//! automatic reconnection

use anyhow::{anyhow, Result};
use nic_agent_shared::{
    codec::{self, FrameDecoder},
    envelope, limits, Envelope, Header, Heartbeat, MessageType,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use super::sink::ChannelSink;
use crate::config::duration_ms;

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { addr: String },
    Disconnected { reason: String },
    /// Envelope received from the control plane
    Received(Envelope),
    /// A connection attempt failed; the manager keeps retrying
    ConnectionFailed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// First reconnection delay; doubles up to `max_reconnect_delay`
    #[serde(with = "duration_ms", rename = "reconnect_delay_ms")]
    pub reconnect_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_reconnect_delay_ms")]
    pub max_reconnect_delay: Duration,
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms", rename = "heartbeat_interval_ms")]
    pub heartbeat_interval: Duration,
    /// Outbound envelopes buffered while disconnected
    pub outbound_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(limits::HEARTBEAT_INTERVAL_MS),
            outbound_buffer: 256,
        }
    }
}

/// Agent health carried by each heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub in_flight: u32,
    pub healthy: bool,
    pub backend: String,
}

pub type StatusSource = Arc<dyn Fn() -> AgentStatus + Send + Sync>;

/// Shared identity and sequence counter for everything the agent sends
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    pub device_id: String,
    sequence_id: Arc<AtomicU64>,
}

impl Outbound {
    pub fn header(&self, msg_type: MessageType) -> Header {
        let seq = self.sequence_id.fetch_add(1, Ordering::SeqCst) + 1;
        Header::new(&self.device_id, msg_type, seq)
    }
}

/// Manages the persistent connection to the control plane
pub struct ConnectionManager {
    addr: String,
    config: ConnectionConfig,
    outbound: Outbound,
    outbound_tx: mpsc::Sender<Envelope>,
    outbound_rx: Option<mpsc::Receiver<Envelope>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    event_rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create the manager. Nothing connects until [`start`](Self::start).
    pub fn new(device_id: impl Into<String>, addr: impl Into<String>, config: ConnectionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(config.outbound_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);

        Self {
            addr: addr.into(),
            config,
            outbound: Outbound {
                device_id: device_id.into(),
                sequence_id: Arc::new(AtomicU64::new(0)),
            },
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            event_tx,
            event_rx,
        }
    }

    /// Sink that sends command results over this connection
    pub fn result_sink(&self) -> ChannelSink {
        ChannelSink::new(self.outbound.clone(), self.outbound_tx.clone())
    }

    /// Spawn the connection loop. Heartbeats report whatever `status`
    /// returns at send time. Calling this twice has no effect.
    pub fn start(&mut self, status: StatusSource) {
        let Some(outbound_rx) = self.outbound_rx.take() else {
            warn!("connection manager already started");
            return;
        };
        let link = Link {
            addr: self.addr.clone(),
            config: self.config.clone(),
            outbound: self.outbound.clone(),
            status,
            started: Instant::now(),
        };
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            link.run(outbound_rx, event_tx).await;
        });
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }
}

/// State owned by the background connection loop
struct Link {
    addr: String,
    config: ConnectionConfig,
    outbound: Outbound,
    status: StatusSource,
    started: Instant,
}

impl Link {
    async fn run(self, mut outbound_rx: mpsc::Receiver<Envelope>, event_tx: mpsc::Sender<ConnectionEvent>) {
        let mut reconnect_delay = self.config.reconnect_delay;
        // Envelope whose write failed; sent first on the next connection
        let mut unsent: Option<Envelope> = None;

        loop {
            match timeout(self.config.connect_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => {
                    reconnect_delay = self.config.reconnect_delay;
                    let _ = event_tx
                        .send(ConnectionEvent::Connected {
                            addr: self.addr.clone(),
                        })
                        .await;

                    let (reader, writer) = stream.into_split();
                    if let Err(reason) = self
                        .handle_connection(reader, writer, &mut outbound_rx, &event_tx, &mut unsent)
                        .await
                    {
                        let _ = event_tx
                            .send(ConnectionEvent::Disconnected {
                                reason: reason.to_string(),
                            })
                            .await;
                    }
                }
                Ok(Err(e)) => {
                    let _ = event_tx
                        .send(ConnectionEvent::ConnectionFailed {
                            reason: format!("{}: {e}", self.addr),
                        })
                        .await;
                }
                Err(_) => {
                    let _ = event_tx
                        .send(ConnectionEvent::ConnectionFailed {
                            reason: format!("{}: connect timed out", self.addr),
                        })
                        .await;
                }
            }

            if event_tx.is_closed() {
                if let Some(envelope) = unsent.take() {
                    error!(
                        correlation_id = result_id(&envelope).unwrap_or("-"),
                        "dropping unsent envelope, connection manager stopped"
                    );
                }
                debug!("event receiver dropped, stopping connection loop");
                return;
            }

            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
        }
    }

    fn heartbeat(&self) -> Envelope {
        let status = (self.status)();
        let uptime_ms = self.started.elapsed().as_millis() as u64;
        Envelope {
            header: Some(self.outbound.header(MessageType::MsgHeartbeat)),
            payload: Some(envelope::Payload::Heartbeat(Heartbeat::new(
                uptime_ms,
                status.in_flight,
                status.healthy,
                status.backend,
            ))),
        }
    }

    async fn handle_connection<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        outbound_rx: &mut mpsc::Receiver<Envelope>,
        event_tx: &mpsc::Sender<ConnectionEvent>,
        unsent: &mut Option<Envelope>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut decoder = FrameDecoder::new();
        let mut read_buf = vec![0u8; 4096];

        if let Some(envelope) = unsent.take() {
            send_or_hold(&mut writer, envelope, unsent).await?;
            debug!("resent envelope held over from the previous connection");
        }

        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                Some(envelope) = outbound_rx.recv() => {
                    send_or_hold(&mut writer, envelope, unsent).await?;
                }

                _ = heartbeat_interval.tick() => {
                    let encoded = codec::encode(&self.heartbeat())?;
                    writer.write_all(&encoded).await?;
                }

                result = reader.read(&mut read_buf) => {
                    let n = result.map_err(|e| anyhow!("read error: {e}"))?;
                    if n == 0 {
                        return Err(anyhow!("control plane closed the connection"));
                    }
                    decoder.extend(&read_buf[..n]);
                    for envelope in decoder.decode_all()? {
                        let _ = event_tx.send(ConnectionEvent::Received(envelope)).await;
                    }
                }
            }
        }
    }
}

/// Correlation id of a result envelope
fn result_id(envelope: &Envelope) -> Option<&str> {
    match &envelope.payload {
        Some(envelope::Payload::Result(result)) => Some(&result.correlation_id),
        _ => None,
    }
}

/// Write one outbound envelope. A failed write keeps the envelope in
/// `unsent` for the next connection; an envelope that cannot be encoded is
/// dropped with an error.
async fn send_or_hold<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: Envelope,
    unsent: &mut Option<Envelope>,
) -> Result<()> {
    let encoded = match codec::encode(&envelope) {
        Ok(encoded) => encoded,
        Err(e) => {
            error!(
                correlation_id = result_id(&envelope).unwrap_or("-"),
                error = %e,
                "dropping envelope that cannot be encoded"
            );
            return Ok(());
        }
    };
    if let Err(e) = writer.write_all(&encoded).await {
        warn!(
            correlation_id = result_id(&envelope).unwrap_or("-"),
            error = %e,
            "write failed, holding envelope for the next connection"
        );
        *unsent = Some(envelope);
        return Err(e.into());
    }
    Ok(())
}
