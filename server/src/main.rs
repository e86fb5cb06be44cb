//! Control-plane simulator: accepts agent sessions, sends each agent a
//! command script and logs the results.

mod command;
mod session;

use anyhow::Context;
use command::{CommandDispatcher, ScriptedCommand, TimeoutTracker};
use nic_agent_shared::{envelope, Envelope, ErrorKind, MessageType};
use session::{is_heartbeat, AgentSession, SessionManager};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LISTEN_ENV: &str = "CONTROL_PLANE_LISTEN";
const DEFAULT_LISTEN: &str = "0.0.0.0:7600";

/// Script used when no file is given: exercises every built-in extension
/// plus one command the agent does not know.
fn default_script() -> Vec<ScriptedCommand> {
    vec![
        ScriptedCommand::new("power-status"),
        ScriptedCommand::new("set-boot-device")
            .arg("device", "pxe")
            .arg("persistent", true),
        ScriptedCommand::new("power-cycle"),
        ScriptedCommand::new("provision-disk").arg("image", "/var/lib/images/base.qcow2"),
        ScriptedCommand::new("connect-cloud-disk")
            .arg("iqn", "iqn.2016-06.io.spdk:disk1")
            .arg("ip", "192.168.1.100"),
        ScriptedCommand::new("list-devices"),
        ScriptedCommand::new("check-heartbeat").arg("ip", "192.168.1.100"),
        ScriptedCommand::new("disconnect-cloud-disk")
            .arg("iqn", "iqn.2016-06.io.spdk:disk1")
            .arg("ip", "192.168.1.100"),
        ScriptedCommand::new("reflash-firmware"),
        ScriptedCommand::new("power-off").arg("force", true),
    ]
}

fn load_script(path: &Path) -> anyhow::Result<Vec<ScriptedCommand>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let script = match std::env::args_os().nth(1) {
        Some(path) => load_script(Path::new(&path))?,
        None => default_script(),
    };
    let script = Arc::new(script);

    let listen = std::env::var(LISTEN_ENV).unwrap_or_else(|_| DEFAULT_LISTEN.to_string());
    let listener = TcpListener::bind(&listen).await?;
    info!("Control plane listening on {} ({} scripted command(s))", listen, script.len());

    let sessions = Arc::new(SessionManager::new());
    let dispatcher = Arc::new(CommandDispatcher::new(sessions.clone()));

    let tracker = TimeoutTracker::new(dispatcher.clone(), sessions.clone());
    tokio::spawn(async move { tracker.run().await });

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Connection from {}", addr);

        let sessions = sessions.clone();
        let dispatcher = dispatcher.clone();
        let script = script.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_agent(stream, addr, &sessions, &dispatcher, script).await {
                error!("Session {} ended with error: {:#}", addr, e);
            }
        });
    }
}

async fn serve_agent(
    stream: TcpStream,
    addr: SocketAddr,
    sessions: &Arc<SessionManager>,
    dispatcher: &Arc<CommandDispatcher>,
    script: Arc<Vec<ScriptedCommand>>,
) -> anyhow::Result<()> {
    let mut session = AgentSession::new(stream, addr);
    let mut registered = false;

    let outcome = async {
        while let Some(envelope) = session.recv().await? {
            if !registered && sessions.register(session.handle()).await {
                registered = true;
                info!(device_id = %session.device_id(), "Agent registered from {}", addr);
                spawn_script(session.device_id().to_string(), dispatcher.clone(), script.clone());
            }
            handle_envelope(session.device_id(), &envelope, sessions, dispatcher).await;
        }
        anyhow::Ok(())
    }
    .await;

    info!("Agent disconnected: {} ({})", session.device_id(), addr);
    if registered && sessions.unregister(session.device_id(), addr).await {
        let abandoned = dispatcher.drop_device(session.device_id()).await;
        if !abandoned.is_empty() {
            warn!("{} command(s) abandoned without a result", abandoned.len());
        }
    }
    outcome
}

fn spawn_script(device_id: String, dispatcher: Arc<CommandDispatcher>, script: Arc<Vec<ScriptedCommand>>) {
    tokio::spawn(async move {
        for command in script.iter() {
            if let Err(e) = dispatcher.send_command(&device_id, command).await {
                error!("Failed to send {} to {}: {:#}", command.name, device_id, e);
                return;
            }
        }
    });
}

async fn handle_envelope(
    device_id: &str,
    envelope: &Envelope,
    sessions: &SessionManager,
    dispatcher: &CommandDispatcher,
) {
    let Some(header) = &envelope.header else {
        warn!("Received envelope without header");
        return;
    };

    if is_heartbeat(envelope) {
        debug!(device_id, seq = header.sequence_id, "heartbeat");
    }

    match &envelope.payload {
        Some(envelope::Payload::Heartbeat(hb)) => {
            sessions.update_heartbeat(device_id, hb).await;
        }
        Some(envelope::Payload::Result(result)) => {
            let Some(pending) = dispatcher.handle_result(device_id, result).await else {
                warn!(
                    correlation_id = %result.correlation_id,
                    "<<< Result for unknown or expired command"
                );
                return;
            };
            if result.is_success() {
                info!(
                    correlation_id = %result.correlation_id,
                    "<<< {} succeeded in {}ms: {}",
                    pending.name,
                    result.processing_time_ms,
                    result.payload_json
                );
            } else {
                let kind = ErrorKind::try_from(result.error_kind).unwrap_or(ErrorKind::ErrorNone);
                warn!(
                    correlation_id = %result.correlation_id,
                    "<<< {} failed in {}ms: {:?}: {}",
                    pending.name,
                    result.processing_time_ms,
                    kind,
                    result.error_message
                );
            }
        }
        Some(envelope::Payload::Command(_)) => {
            warn!(device_id, "Agent sent a command; ignoring");
        }
        None => {
            let msg_type = MessageType::try_from(header.msg_type).unwrap_or(MessageType::MsgUnknown);
            debug!(device_id, "{:?} with no payload", msg_type);
        }
    }
}
