//! Command dispatcher for sending commands to agents

use crate::session::SessionManager;
use nic_agent_shared::{envelope, limits, CommandRequest, CommandResult, Envelope, Header, MessageType};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

/// One entry of a command script
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedCommand {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// 0 leaves the deadline to the agent
    #[serde(default)]
    pub deadline_ms: u64,
}

impl ScriptedCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Map::new(),
            deadline_ms: 0,
        }
    }

    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.to_string(), value.into());
        self
    }
}

/// A sent command awaiting its result
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub correlation_id: String,
    pub device_id: String,
    pub name: String,
    pub sent_at: Instant,
}

/// Sends commands to agents and matches results by correlation ID
pub struct CommandDispatcher {
    session_manager: Arc<SessionManager>,
    sequence_id: AtomicU64,
    command_id: AtomicU64,
    pending: RwLock<HashMap<String, PendingCommand>>,
    result_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(session_manager: Arc<SessionManager>) -> Self {
        Self {
            session_manager,
            sequence_id: AtomicU64::new(0),
            command_id: AtomicU64::new(0),
            pending: RwLock::new(HashMap::new()),
            result_timeout: Duration::from_millis(limits::RESULT_TIMEOUT_MS),
        }
    }

    /// How long to wait for a result before giving up on a command
    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    fn next_sequence_id(&self) -> u64 {
        self.sequence_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Send a command and return its correlation ID
    pub async fn send_command(&self, device_id: &str, command: &ScriptedCommand) -> anyhow::Result<String> {
        let correlation_id = format!(
            "{}-{}",
            device_id,
            self.command_id.fetch_add(1, Ordering::SeqCst) + 1
        );

        let mut request = CommandRequest::new(&command.name, &correlation_id, &command.arguments);
        request.deadline_ms = command.deadline_ms;

        let seq = self.next_sequence_id();
        let envelope = Envelope {
            header: Some(Header::new("control-plane", MessageType::MsgCommand, seq)),
            payload: Some(envelope::Payload::Command(request)),
        };

        // Track before sending so a fast result always finds its entry
        self.pending.write().await.insert(
            correlation_id.clone(),
            PendingCommand {
                correlation_id: correlation_id.clone(),
                device_id: device_id.to_string(),
                name: command.name.clone(),
                sent_at: Instant::now(),
            },
        );

        if let Err(e) = self.session_manager.send_to(device_id, &envelope).await {
            self.pending.write().await.remove(&correlation_id);
            return Err(e);
        }

        info!(
            correlation_id = %correlation_id,
            device_id,
            seq,
            ">>> Sent {}",
            command.name
        );
        Ok(correlation_id)
    }

    /// Match a result to its pending command. `None` for results nobody is
    /// waiting for (unknown, duplicated or already timed out).
    pub async fn handle_result(&self, device_id: &str, result: &CommandResult) -> Option<PendingCommand> {
        let mut pending = self.pending.write().await;
        match pending.get(&result.correlation_id) {
            Some(cmd) if cmd.device_id == device_id => pending.remove(&result.correlation_id),
            _ => None,
        }
    }

    /// Remove and return commands whose result is overdue
    pub async fn take_timed_out(&self) -> Vec<PendingCommand> {
        let mut pending = self.pending.write().await;
        let overdue: Vec<String> = pending
            .values()
            .filter(|c| c.sent_at.elapsed() > self.result_timeout)
            .map(|c| c.correlation_id.clone())
            .collect();
        overdue.iter().filter_map(|id| pending.remove(id)).collect()
    }

    /// Forget everything pending for an agent that went away
    pub async fn drop_device(&self, device_id: &str) -> Vec<PendingCommand> {
        let mut pending = self.pending.write().await;
        let ids: Vec<String> = pending
            .values()
            .filter(|c| c.device_id == device_id)
            .map(|c| c.correlation_id.clone())
            .collect();
        ids.iter().filter_map(|id| pending.remove(id)).collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AgentSession;
    use nic_agent_shared::codec::FrameDecoder;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected(manager: &SessionManager, device_id: &str) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, addr) = listener.accept().await.unwrap();
        let mut handle = AgentSession::new(stream, addr).handle();
        handle.device_id = device_id.into();
        manager.register(handle).await;
        agent
    }

    #[tokio::test]
    async fn sends_request_and_matches_result() {
        let sessions = Arc::new(SessionManager::new());
        let mut agent = connected(&sessions, "nic-1").await;
        let dispatcher = CommandDispatcher::new(sessions);

        let command = ScriptedCommand::new("set-boot-device").arg("device", "pxe");
        let id = dispatcher.send_command("nic-1", &command).await.unwrap();
        assert_eq!(id, "nic-1-1");
        assert_eq!(dispatcher.pending_count().await, 1);

        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 4096];
        let request = loop {
            if let Some(envelope) = decoder.decode_next().unwrap() {
                match envelope.payload {
                    Some(envelope::Payload::Command(request)) => break request,
                    other => panic!("expected command, got {other:?}"),
                }
            }
            let n = agent.read(&mut buf).await.unwrap();
            decoder.extend(&buf[..n]);
        };
        assert_eq!(request.name, "set-boot-device");
        assert_eq!(request.correlation_id, id);
        assert_eq!(request.arguments().unwrap()["device"], "pxe");

        let result = CommandResult::success(id.clone(), "{}", 3);
        // Another agent cannot complete it
        assert!(dispatcher.handle_result("nic-2", &result).await.is_none());
        let done = dispatcher.handle_result("nic-1", &result).await.unwrap();
        assert_eq!(done.name, "set-boot-device");
        // Second delivery of the same result is unmatched
        assert!(dispatcher.handle_result("nic-1", &result).await.is_none());
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unreachable_agent_leaves_nothing_pending() {
        let dispatcher = CommandDispatcher::new(Arc::new(SessionManager::new()));
        assert!(dispatcher
            .send_command("nic-missing", &ScriptedCommand::new("power-on"))
            .await
            .is_err());
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn overdue_commands_time_out() {
        let sessions = Arc::new(SessionManager::new());
        let _agent = connected(&sessions, "nic-1").await;
        let dispatcher = CommandDispatcher::new(sessions).with_result_timeout(Duration::from_millis(20));

        dispatcher
            .send_command("nic-1", &ScriptedCommand::new("power-status"))
            .await
            .unwrap();
        assert!(dispatcher.take_timed_out().await.is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let overdue = dispatcher.take_timed_out().await;
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].name, "power-status");
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[test]
    fn script_entries_default_arguments_and_deadline() {
        let script: Vec<ScriptedCommand> = serde_json::from_str(
            r#"[{"name": "power-on"}, {"name": "provision-disk", "arguments": {"image": "/img"}, "deadline_ms": 5000}]"#,
        )
        .unwrap();
        assert!(script[0].arguments.is_empty());
        assert_eq!(script[0].deadline_ms, 0);
        assert_eq!(script[1].arguments["image"], "/img");
        assert_eq!(script[1].deadline_ms, 5000);
    }
}
