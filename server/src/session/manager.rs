//! Session manager for tracking all connected agents

use super::connection::{AgentInfo, SessionHandle};
use anyhow::{anyhow, Result};
use nic_agent_shared::{Envelope, Heartbeat};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::RwLock;

struct SessionEntry {
    handle: SessionHandle,
    info: AgentInfo,
}

/// Manages all active agent sessions, keyed by device ID
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. A reconnecting agent replaces its old session.
    pub async fn register(&self, handle: SessionHandle) -> bool {
        let device_id = handle.device_id.clone();
        if device_id.is_empty() {
            return false;
        }

        let info = AgentInfo::new(device_id.clone(), handle.addr, handle.connected_at);
        let entry = SessionEntry { handle, info };
        self.sessions.write().await.insert(device_id, entry);
        true
    }

    /// Remove a session, unless the agent has since reconnected from
    /// another address
    pub async fn unregister(&self, device_id: &str, addr: SocketAddr) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(device_id) {
            Some(entry) if entry.handle.addr == addr => {
                sessions.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// Send a message to a specific agent
    pub async fn send_to(&self, device_id: &str, envelope: &Envelope) -> Result<()> {
        let handle = self
            .sessions
            .read()
            .await
            .get(device_id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| anyhow!("agent not connected: {device_id}"))?;
        handle.send(envelope).await
    }

    pub async fn connected_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        devices.sort();
        devices
    }

    pub async fn get_info(&self, device_id: &str) -> Option<AgentInfo> {
        self.sessions.read().await.get(device_id).map(|e| e.info.clone())
    }

    pub async fn update_heartbeat(&self, device_id: &str, hb: &Heartbeat) {
        if let Some(entry) = self.sessions.write().await.get_mut(device_id) {
            entry.info.record_heartbeat(hb);
        }
    }

    /// Remove sessions whose last heartbeat is older than `timeout` and
    /// return their IDs
    pub async fn remove_dead_sessions(&self, timeout: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let dead: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| entry.info.last_heartbeat.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            sessions.remove(id);
        }
        dead
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
