//! [`RealBackend`] – drives the physical devices through vendor tools.

mod bmc;
mod devices;
mod disk;
pub mod runner;
mod storage;

pub use devices::{cloud_disk_names, CloudDiskNames, DeviceRegistry};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use self::bmc::IpmiPower;
use self::disk::ImageWriter;
use self::runner::{CommandRunner, ProcessRunner};
use self::storage::CloudDiskRpc;
use super::{
    BackendKind, BackendResult, BootDevice, CancelSignal, DiskImage, DiskProvision,
    HardwareBackend, PowerAction, PowerControl, StorageAttach, StorageTarget,
};
use crate::config::AgentConfig;

pub struct RealBackend {
    power: IpmiPower,
    disk: ImageWriter,
    storage: CloudDiskRpc,
}

impl RealBackend {
    pub fn from_config(config: &AgentConfig) -> anyhow::Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(config.tool_timeout));
        let devices = DeviceRegistry::load(&config.storage.state_file);
        info!(
            bmc = config.bmc.host.as_deref().unwrap_or("local"),
            disk = %config.disk.device,
            "real hardware backend configured"
        );
        Ok(Self::with_runner(runner, config, devices))
    }

    pub fn with_runner(
        runner: Arc<dyn CommandRunner>,
        config: &AgentConfig,
        devices: DeviceRegistry,
    ) -> Self {
        Self {
            power: IpmiPower::new(runner.clone(), config.bmc.clone()),
            disk: ImageWriter::new(runner.clone(), config.disk.clone()),
            storage: CloudDiskRpc::new(runner, config.storage.clone(), devices),
        }
    }
}

#[async_trait]
impl PowerControl for RealBackend {
    async fn set_power(&self, action: PowerAction, cancel: &CancelSignal) -> BackendResult {
        self.power.set_power(action, cancel).await
    }

    async fn power_status(&self, cancel: &CancelSignal) -> BackendResult {
        self.power.power_status(cancel).await
    }

    async fn set_boot_device(
        &self,
        device: BootDevice,
        persistent: bool,
        cancel: &CancelSignal,
    ) -> BackendResult {
        self.power.set_boot_device(device, persistent, cancel).await
    }
}

#[async_trait]
impl DiskProvision for RealBackend {
    async fn provision_disk(&self, image: &DiskImage, cancel: &CancelSignal) -> BackendResult {
        self.disk.provision(image, cancel).await
    }
}

#[async_trait]
impl StorageAttach for RealBackend {
    async fn attach_storage(&self, target: &StorageTarget, cancel: &CancelSignal) -> BackendResult {
        self.storage.attach(target, cancel).await
    }

    async fn detach_storage(&self, target: &StorageTarget, cancel: &CancelSignal) -> BackendResult {
        self.storage.detach(target, cancel).await
    }

    async fn list_devices(&self) -> BackendResult {
        self.storage.list()
    }
}

impl HardwareBackend for RealBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Real
    }
}

#[cfg(test)]
mod tests {
    use super::runner::testing::ScriptedRunner;
    use super::runner::CommandOutput;
    use super::*;
    use crate::hardware::MockBackend;

    fn target() -> StorageTarget {
        StorageTarget {
            iqn: "iqn.2016-06.io.spdk:disk7".into(),
            ip: "10.20.0.4".parse().unwrap(),
        }
    }

    /// Success payloads must be indistinguishable between the two backends
    #[tokio::test]
    async fn success_payloads_match_mock_backend() {
        let config = AgentConfig::default();
        let runner = Arc::new(ScriptedRunner::new(|inv| {
            if inv.args.ends_with(&["status".to_string()]) {
                Ok(CommandOutput::ok("Chassis Power is on"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        }));
        let real = RealBackend::with_runner(runner, &config, DeviceRegistry::in_memory());
        let mock = MockBackend::new(config.disk.device.clone());
        let cancel = CancelSignal::never();

        assert_eq!(
            real.set_power(PowerAction::Cycle, &cancel).await,
            mock.set_power(PowerAction::Cycle, &cancel).await
        );
        assert_eq!(
            real.power_status(&cancel).await,
            mock.power_status(&cancel).await
        );
        assert_eq!(
            real.set_boot_device(BootDevice::Disk, false, &cancel).await,
            mock.set_boot_device(BootDevice::Disk, false, &cancel).await
        );
        let image = DiskImage {
            image: "/images/base.raw".into(),
            sha256: None,
        };
        assert_eq!(
            real.provision_disk(&image, &cancel).await,
            mock.provision_disk(&image, &cancel).await
        );
        assert_eq!(
            real.attach_storage(&target(), &cancel).await,
            mock.attach_storage(&target(), &cancel).await
        );
        assert_eq!(real.kind(), BackendKind::Real);
    }
}
