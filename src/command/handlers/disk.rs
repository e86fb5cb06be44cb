//! Disk provisioning handler

use std::time::Duration;
use tracing::info;

use super::{HandlerContext, HOST_DISK};
use crate::command::registry::{ArgKind, ArgSpec, Extension};
use crate::command::types::HandlerResult;
use crate::hardware::DiskImage;

/// Writing a full image takes far longer than any chassis operation
const PROVISION_DEADLINE: Duration = Duration::from_secs(30 * 60);

pub(super) fn extensions() -> Vec<Extension> {
    vec![Extension::new("provision-disk", handle_provision_disk)
        .requires(HOST_DISK)
        .arg(ArgSpec::required("image", ArgKind::NonEmptyString))
        .arg(ArgSpec::optional("sha256", ArgKind::NonEmptyString))
        .deadline(PROVISION_DEADLINE)]
}

pub async fn handle_provision_disk(ctx: HandlerContext) -> HandlerResult {
    let image = DiskImage {
        image: ctx.str_arg("image")?.to_string(),
        sha256: ctx.opt_str_arg("sha256").map(str::to_string),
    };
    info!(
        correlation_id = %ctx.correlation_id,
        image = %image.image,
        verify = image.sha256.is_some(),
        "provisioning host disk"
    );
    Ok(ctx.backend.provision_disk(&image, &ctx.cancel).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, SpyBackend};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn image_and_checksum_reach_the_backend() {
        let spy = Arc::new(SpyBackend::default());
        let payload = handle_provision_disk(context(
            spy.clone(),
            json!({"image": "/images/rocky9.qcow2", "sha256": "ab12"}),
        ))
        .await
        .unwrap();

        assert_eq!(payload["image"], "/images/rocky9.qcow2");
        assert_eq!(payload["verified"], true);
        assert_eq!(spy.calls(), vec!["provision_disk(/images/rocky9.qcow2)"]);
    }

    #[test]
    fn provisioning_has_a_long_deadline() {
        let ext = extensions().remove(0);
        assert_eq!(ext.default_deadline(), Some(PROVISION_DEADLINE));
    }
}
