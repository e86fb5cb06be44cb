mod command;
mod config;
mod connection;
mod hardware;
#[cfg(test)]
mod testing;

use command::{builtin_registry, Dispatcher, ResultReporter};
use connection::{AgentStatus, ConnectionEvent, ConnectionManager};
use nic_agent_shared::{envelope, Envelope, MessageType};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Set to `json` for machine-readable log lines
const LOG_FORMAT_ENV: &str = "NIC_AGENT_LOG_FORMAT";

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = config::load(config::config_path().as_deref())?;

    info!("NIC agent starting: {}", config.device_id);
    info!("  control plane: {}", config.control_plane);
    info!("  backend: {}", config.backend);

    let backend = hardware::select_backend(&config)?;
    let registry = Arc::new(builtin_registry()?);
    info!("  extensions: {}", registry.names().join(", "));

    let mut conn = ConnectionManager::new(
        config.device_id.clone(),
        config.control_plane.clone(),
        config.connection.clone(),
    );

    let reporter = ResultReporter::new(Arc::new(conn.result_sink()), config.reporter.clone());
    let dispatcher = Dispatcher::new(registry, backend.clone(), reporter, config.dispatcher.clone());

    let status_dispatcher = dispatcher.clone();
    let backend_kind = backend.kind().to_string();
    conn.start(Arc::new(move || AgentStatus {
        in_flight: status_dispatcher.in_flight_count() as u32,
        healthy: status_dispatcher.is_accepting(),
        backend: backend_kind.clone(),
    }));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    // Main event loop
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, draining {} command(s)", dispatcher.in_flight_count());
                break;
            }
            event = conn.recv() => match event {
                Some(ConnectionEvent::Connected { addr }) => {
                    info!("Connected to control plane at {}", addr);
                }
                Some(ConnectionEvent::Disconnected { reason }) => {
                    warn!("Disconnected: {}", reason);
                }
                Some(ConnectionEvent::ConnectionFailed { reason }) => {
                    error!("Connection failed: {}", reason);
                }
                Some(ConnectionEvent::Received(envelope)) => {
                    handle_server_message(&envelope, &dispatcher);
                }
                None => {
                    error!("Connection manager closed");
                    break;
                }
            }
        }
    }

    let forced = dispatcher.shutdown(config.dispatcher.shutdown_grace).await;
    if forced > 0 {
        warn!("{} command(s) did not finish within the shutdown grace period", forced);
    }
    info!("NIC agent stopped");
    Ok(())
}

fn handle_server_message(envelope: &Envelope, dispatcher: &Dispatcher) {
    let Some(header) = &envelope.header else {
        error!("Received envelope without header");
        return;
    };

    let msg_type = MessageType::try_from(header.msg_type).unwrap_or(MessageType::MsgUnknown);
    debug!(
        "Received from control plane: seq={} type={:?}",
        header.sequence_id, msg_type
    );

    match &envelope.payload {
        Some(envelope::Payload::Command(request)) => {
            // Outcome is reported by the dispatcher; the handle is not needed here
            let _ = dispatcher.submit_request(request);
        }
        Some(envelope::Payload::Heartbeat(hb)) => {
            debug!("  Control plane heartbeat: healthy={}", hb.healthy);
        }
        _ => {
            debug!("  Unhandled payload type");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("SIGTERM handler unavailable: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
