//! Cloud disk attach/detach handlers

use std::time::Duration;

use super::{HandlerContext, STORAGE_MOUNT};
use crate::command::registry::{ArgKind, ArgSpec, Extension};
use crate::command::types::{CommandError, HandlerResult};
use crate::hardware::StorageTarget;

const CLOUD_DISK_DEADLINE: Duration = Duration::from_secs(120);

pub(super) fn extensions() -> Vec<Extension> {
    let target_args = |ext: Extension| {
        ext.requires(STORAGE_MOUNT)
            .arg(ArgSpec::required("iqn", ArgKind::NonEmptyString))
            .arg(ArgSpec::required("ip", ArgKind::IpAddr))
            .deadline(CLOUD_DISK_DEADLINE)
    };
    vec![
        target_args(Extension::new("connect-cloud-disk", handle_connect_cloud_disk)),
        target_args(Extension::new("disconnect-cloud-disk", handle_disconnect_cloud_disk)),
    ]
}

fn target(ctx: &HandlerContext) -> Result<StorageTarget, CommandError> {
    Ok(StorageTarget {
        iqn: ctx.str_arg("iqn")?.to_string(),
        ip: ctx.ip_arg("ip")?,
    })
}

pub async fn handle_connect_cloud_disk(ctx: HandlerContext) -> HandlerResult {
    let target = target(&ctx)?;
    Ok(ctx.backend.attach_storage(&target, &ctx.cancel).await?)
}

pub async fn handle_disconnect_cloud_disk(ctx: HandlerContext) -> HandlerResult {
    let target = target(&ctx)?;
    Ok(ctx.backend.detach_storage(&target, &ctx.cancel).await?)
}
