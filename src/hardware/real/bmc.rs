//! Chassis power and boot order through `ipmitool`

use std::sync::Arc;
use tracing::info;

use super::runner::{run_checked, CommandRunner, Invocation};
use crate::config::BmcConfig;
use crate::hardware::{
    boot_payload, power_payload, BackendError, BackendResult, BootDevice, CancelSignal,
    PowerAction, PowerState,
};

pub struct IpmiPower {
    runner: Arc<dyn CommandRunner>,
    config: BmcConfig,
}

impl IpmiPower {
    pub fn new(runner: Arc<dyn CommandRunner>, config: BmcConfig) -> Self {
        Self { runner, config }
    }

    /// Base invocation: the local interface, or lanplus to a remote BMC. The
    /// password goes through the environment (`-E`), never the command line.
    fn invocation(&self, args: &[&str]) -> Invocation {
        let mut inv = Invocation::new(&self.config.tool);
        if let Some(host) = &self.config.host {
            inv = inv.args(["-I", self.config.interface.as_str(), "-H", host.as_str()]);
            if let Some(user) = &self.config.user {
                inv = inv.args(["-U", user.as_str()]);
            }
            if let Some(password) = &self.config.password {
                inv = inv.arg("-E").env("IPMI_PASSWORD", password.as_str());
            }
        }
        inv.args(args.iter().copied())
    }

    pub async fn set_power(&self, action: PowerAction, cancel: &CancelSignal) -> BackendResult {
        let verb = match action {
            PowerAction::On => "on",
            PowerAction::Off => "off",
            PowerAction::SoftOff => "soft",
            PowerAction::Cycle => "cycle",
        };
        run_checked(
            self.runner.as_ref(),
            &self.invocation(&["chassis", "power", verb]),
            cancel,
        )
        .await?;
        info!(action = verb, "chassis power changed");
        Ok(power_payload(action.resulting_state()))
    }

    pub async fn power_status(&self, cancel: &CancelSignal) -> BackendResult {
        let output = run_checked(
            self.runner.as_ref(),
            &self.invocation(&["chassis", "power", "status"]),
            cancel,
        )
        .await?;
        Ok(power_payload(parse_power_status(&output.stdout)?))
    }

    pub async fn set_boot_device(
        &self,
        device: BootDevice,
        persistent: bool,
        cancel: &CancelSignal,
    ) -> BackendResult {
        let mut args = vec!["chassis", "bootdev", device.as_str()];
        if persistent {
            args.push("options=persistent");
        }
        run_checked(self.runner.as_ref(), &self.invocation(&args), cancel).await?;
        info!(device = device.as_str(), persistent, "boot device set");
        Ok(boot_payload(device, persistent))
    }
}

/// Parse `Chassis Power is on|off`
fn parse_power_status(stdout: &str) -> Result<PowerState, BackendError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("Chassis Power is"))
        .ok_or_else(|| BackendError::fault(format!("unexpected power status output: {stdout:?}")))?;

    match line.trim_start_matches("Chassis Power is").trim() {
        "on" => Ok(PowerState::On),
        "off" => Ok(PowerState::Off),
        other => Err(BackendError::fault(format!("unknown power state `{other}`"))),
    }
}
