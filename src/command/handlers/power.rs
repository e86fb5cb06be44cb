//! Chassis power and boot device handlers

use tracing::info;

use super::{HandlerContext, BMC_SESSION};
use crate::command::registry::{ArgKind, ArgSpec, Extension};
use crate::command::types::{CommandError, HandlerResult};
use crate::hardware::{BootDevice, PowerAction};

pub(super) fn extensions() -> Vec<Extension> {
    vec![
        Extension::new("power-on", handle_power_on).requires(BMC_SESSION),
        Extension::new("power-off", handle_power_off)
            .requires(BMC_SESSION)
            .arg(ArgSpec::optional("force", ArgKind::Bool)),
        Extension::new("power-cycle", handle_power_cycle).requires(BMC_SESSION),
        Extension::new("power-status", handle_power_status).requires(BMC_SESSION),
        Extension::new("set-boot-device", handle_set_boot_device)
            .requires(BMC_SESSION)
            .arg(ArgSpec::required("device", ArgKind::OneOf(BootDevice::NAMES)))
            .arg(ArgSpec::optional("persistent", ArgKind::Bool)),
    ]
}

pub async fn handle_power_on(ctx: HandlerContext) -> HandlerResult {
    info!(correlation_id = %ctx.correlation_id, "powering on host");
    Ok(ctx.backend.set_power(PowerAction::On, &ctx.cancel).await?)
}

/// Soft (ACPI) shutdown unless `force` is set
pub async fn handle_power_off(ctx: HandlerContext) -> HandlerResult {
    let action = if ctx.flag("force") {
        PowerAction::Off
    } else {
        PowerAction::SoftOff
    };
    info!(correlation_id = %ctx.correlation_id, ?action, "powering off host");
    Ok(ctx.backend.set_power(action, &ctx.cancel).await?)
}

pub async fn handle_power_cycle(ctx: HandlerContext) -> HandlerResult {
    info!(correlation_id = %ctx.correlation_id, "power cycling host");
    Ok(ctx.backend.set_power(PowerAction::Cycle, &ctx.cancel).await?)
}

pub async fn handle_power_status(ctx: HandlerContext) -> HandlerResult {
    Ok(ctx.backend.power_status(&ctx.cancel).await?)
}

pub async fn handle_set_boot_device(ctx: HandlerContext) -> HandlerResult {
    let device: BootDevice = ctx
        .str_arg("device")?
        .parse()
        .map_err(CommandError::invalid_arguments)?;
    let persistent = ctx.flag("persistent");
    Ok(ctx
        .backend
        .set_boot_device(device, persistent, &ctx.cancel)
        .await?)
}
