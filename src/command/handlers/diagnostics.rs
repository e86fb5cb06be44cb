//! Read-only commands that take no resources

use serde_json::json;
use tracing::info;

use super::HandlerContext;
use crate::command::registry::{ArgKind, ArgSpec, Extension};
use crate::command::types::{Arguments, HandlerResult};

pub(super) fn extensions() -> Vec<Extension> {
    vec![
        Extension::new("list-devices", handle_list_devices),
        Extension::new("check-heartbeat", handle_check_heartbeat)
            .arg(ArgSpec::required("ip", ArgKind::IpAddr)),
    ]
}

pub async fn handle_list_devices(ctx: HandlerContext) -> HandlerResult {
    Ok(ctx.backend.list_devices().await?)
}

/// Liveness check from a storage peer; acknowledged without touching hardware
pub async fn handle_check_heartbeat(ctx: HandlerContext) -> HandlerResult {
    let ip = ctx.ip_arg("ip")?;
    info!(correlation_id = %ctx.correlation_id, %ip, "heartbeat received");

    let mut payload = Arguments::new();
    payload.insert("result".into(), json!("Cloud disk heartbeat successfully."));
    Ok(payload)
}
