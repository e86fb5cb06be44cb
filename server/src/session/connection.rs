//! Individual agent session handling

use anyhow::{anyhow, Result};
use nic_agent_shared::{
    codec::{self, FrameDecoder},
    envelope, Envelope, Heartbeat,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Handle to send messages to a specific agent
#[derive(Clone)]
pub struct SessionHandle {
    pub device_id: String,
    pub addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pub connected_at: Instant,
}

impl SessionHandle {
    /// Send an envelope to this agent
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let encoded = codec::encode(envelope)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        Ok(())
    }
}

/// Active agent session
pub struct AgentSession {
    handle: SessionHandle,
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl AgentSession {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();

        let handle = SessionHandle {
            device_id: String::new(), // set from the first header
            addr,
            writer: Arc::new(Mutex::new(writer)),
            connected_at: Instant::now(),
        };

        Self {
            handle,
            reader,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Cloneable handle for sending messages
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Read the next envelope. `Ok(None)` when the agent closed the
    /// connection; framing and I/O errors end the session.
    pub async fn recv(&mut self) -> Result<Option<Envelope>> {
        loop {
            if let Some(envelope) = self.decoder.decode_next()? {
                if self.handle.device_id.is_empty() {
                    if let Some(header) = &envelope.header {
                        self.handle.device_id = header.device_id.clone();
                    }
                }
                return Ok(Some(envelope));
            }

            let n = self
                .reader
                .read(&mut self.read_buf)
                .await
                .map_err(|e| anyhow!("read error from {}: {e}", self.handle.addr))?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }

    /// Device ID (empty until the first message arrives)
    pub fn device_id(&self) -> &str {
        &self.handle.device_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }
}

/// Agent state tracked by the control plane
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub device_id: String,
    pub addr: SocketAddr,
    pub last_heartbeat: Instant,
    pub connected_at: Instant,
    pub uptime_ms: u64,
    pub in_flight: u32,
    pub healthy: bool,
    pub backend: String,
}

impl AgentInfo {
    pub fn new(device_id: String, addr: SocketAddr, connected_at: Instant) -> Self {
        Self {
            device_id,
            addr,
            last_heartbeat: Instant::now(),
            connected_at,
            uptime_ms: 0,
            in_flight: 0,
            healthy: true,
            backend: String::new(),
        }
    }

    pub fn record_heartbeat(&mut self, hb: &Heartbeat) {
        self.last_heartbeat = Instant::now();
        self.uptime_ms = hb.uptime_ms;
        self.in_flight = hb.in_flight;
        self.healthy = hb.healthy;
        self.backend = hb.backend.clone();
    }
}

/// True when the envelope carries a heartbeat
pub fn is_heartbeat(envelope: &Envelope) -> bool {
    matches!(envelope.payload, Some(envelope::Payload::Heartbeat(_)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nic_agent_shared::{Header, MessageType};
    use tokio::net::TcpListener;

    /// Connected (session, agent-side stream) pair over loopback
    pub(crate) async fn session_pair() -> (AgentSession, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, addr) = listener.accept().await.unwrap();
        (AgentSession::new(stream, addr), agent)
    }

    pub(crate) fn heartbeat(device_id: &str) -> Envelope {
        Envelope {
            header: Some(Header::new(device_id, MessageType::MsgHeartbeat, 1)),
            payload: Some(envelope::Payload::Heartbeat(Heartbeat::new(10, 2, true, "mock"))),
        }
    }

    #[tokio::test]
    async fn learns_device_id_from_first_message() {
        let (mut session, mut agent) = session_pair().await;
        assert!(session.device_id().is_empty());

        agent
            .write_all(&codec::encode(&heartbeat("nic-7")).unwrap())
            .await
            .unwrap();
        let envelope = session.recv().await.unwrap().unwrap();

        assert!(is_heartbeat(&envelope));
        assert_eq!(session.device_id(), "nic-7");
        assert_eq!(session.handle().device_id, "nic-7");
    }

    #[tokio::test]
    async fn closed_connection_ends_session() {
        let (mut session, agent) = session_pair().await;
        drop(agent);
        assert!(session.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_an_error() {
        let (mut session, mut agent) = session_pair().await;
        agent.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(session.recv().await.is_err());
    }
}
