//! Cloud disk attach/detach through the storage emulator RPC tools.
//!
//! Attaching a cloud disk is two steps: an iSCSI bdev in the storage daemon,
//! then a virtio-blk device on top of it that the host sees. Detach undoes
//! them in reverse order.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::devices::{cloud_disk_names, CloudDiskNames, DeviceRegistry};
use super::runner::{run_checked, CommandRunner, Invocation};
use crate::config::StorageConfig;
use crate::hardware::{
    attach_payload, detach_payload, devices_payload, BackendError, BackendResult, CancelSignal,
    StorageTarget,
};

pub struct CloudDiskRpc {
    runner: Arc<dyn CommandRunner>,
    config: StorageConfig,
    devices: DeviceRegistry,
}

impl CloudDiskRpc {
    pub fn new(runner: Arc<dyn CommandRunner>, config: StorageConfig, devices: DeviceRegistry) -> Self {
        Self {
            runner,
            config,
            devices,
        }
    }

    async fn stor_rpc(&self, args: Vec<String>, cancel: &CancelSignal) -> Result<(), BackendError> {
        let invocation = Invocation::new(&self.config.stor_rpc).args(args);
        run_checked(self.runner.as_ref(), &invocation, cancel).await?;
        Ok(())
    }

    async fn emulator_rpc(&self, args: Vec<String>, cancel: &CancelSignal) -> Result<(), BackendError> {
        let invocation = Invocation::new(&self.config.emulator_rpc).args(args);
        run_checked(self.runner.as_ref(), &invocation, cancel).await?;
        Ok(())
    }

    pub async fn attach(&self, target: &StorageTarget, cancel: &CancelSignal) -> BackendResult {
        let names = cloud_disk_names(target);
        for name in [&names.iscsi, &names.blk] {
            if self.devices.contains(name) {
                return Err(BackendError::busy(format!("device {name} already exists")));
            }
        }

        let url = format!("iscsi://{}/{}/0", target.ip, target.iqn);
        self.stor_rpc(
            vec![
                "bdev_iscsi_create".into(),
                "-b".into(),
                names.iscsi.clone(),
                "-i".into(),
                format!("{}/0", target.iqn),
                "--url".into(),
                url,
            ],
            cancel,
        )
        .await?;
        self.devices.insert(&names.iscsi);

        let created = self
            .emulator_rpc(
                vec![
                    "emulator_virtio_blk_device_create".into(),
                    "--name".into(),
                    names.blk.clone(),
                    "--cpumask".into(),
                    self.config.cpumask.clone(),
                    "--num_queues".into(),
                    self.config.num_queues.to_string(),
                    "--bdev_name".into(),
                    names.iscsi.clone(),
                    "--rom_idx".into(),
                    "0".into(),
                ],
                cancel,
            )
            .await;
        if let Err(err) = created {
            self.rollback_iscsi(&names).await;
            return Err(err);
        }
        self.devices.insert(&names.blk);

        info!(iqn = %target.iqn, ip = %target.ip, blk = %names.blk, "cloud disk attached");
        Ok(attach_payload(&names))
    }

    /// Remove a half-created attachment. Runs even when the command itself
    /// was cancelled, so it gets its own signal.
    async fn rollback_iscsi(&self, names: &CloudDiskNames) {
        let result = self
            .stor_rpc(
                vec!["bdev_iscsi_delete".into(), names.iscsi.clone()],
                &CancelSignal::never(),
            )
            .await;
        match result {
            Ok(()) => {
                self.devices.remove(&names.iscsi);
                warn!(bdev = %names.iscsi, "rolled back iSCSI bdev after failed attach");
            }
            Err(e) => error!(bdev = %names.iscsi, error = %e, "rollback of iSCSI bdev failed"),
        }
    }

    pub async fn detach(&self, target: &StorageTarget, cancel: &CancelSignal) -> BackendResult {
        let names = cloud_disk_names(target);

        if !self.devices.contains(&names.blk) {
            return Err(BackendError::fault(format!("block device {} is not attached", names.blk)));
        }
        self.emulator_rpc(
            vec![
                "emulator_virtio_blk_device_delete".into(),
                "--name".into(),
                names.blk.clone(),
            ],
            cancel,
        )
        .await?;
        self.devices.remove(&names.blk);

        if !self.devices.contains(&names.iscsi) {
            return Err(BackendError::fault(format!("iSCSI bdev {} is not attached", names.iscsi)));
        }

        // The emulator releases the bdev asynchronously
        tokio::select! {
            _ = tokio::time::sleep(self.config.settle_delay) => {}
            _ = cancel.cancelled() => {
                return Err(BackendError::fault(format!(
                    "cancelled before deleting iSCSI bdev {}", names.iscsi
                )));
            }
        }

        self.stor_rpc(vec!["bdev_iscsi_delete".into(), names.iscsi.clone()], cancel)
            .await?;
        self.devices.remove(&names.iscsi);

        info!(iqn = %target.iqn, ip = %target.ip, "cloud disk detached");
        Ok(detach_payload())
    }

    pub fn list(&self) -> BackendResult {
        Ok(devices_payload(self.devices.list()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::real::runner::testing::ScriptedRunner;
    use crate::hardware::real::runner::CommandOutput;
    use crate::hardware::{cancel_pair, BackendErrorKind};
    use std::time::Duration;

    fn target() -> StorageTarget {
        StorageTarget {
            iqn: "iqn.2016-06.io.spdk:disk1".into(),
            ip: "192.168.10.20".parse().unwrap(),
        }
    }

    fn config() -> StorageConfig {
        StorageConfig {
            settle_delay: Duration::from_secs(10),
            ..StorageConfig::default()
        }
    }

    fn rpc(runner: Arc<ScriptedRunner>) -> CloudDiskRpc {
        CloudDiskRpc::new(runner, config(), DeviceRegistry::in_memory())
    }

    fn stderr(msg: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: msg.into(),
        }
    }

    #[tokio::test]
    async fn attach_creates_bdev_then_blk_device() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let rpc = rpc(runner.clone());
        let names = cloud_disk_names(&target());

        let payload = rpc.attach(&target(), &CancelSignal::never()).await.unwrap();
        assert_eq!(payload["blk_device"], names.blk.as_str());

        let lines = runner.command_lines();
        assert_eq!(
            lines[0],
            format!(
                "nbl_stor_rpc.py bdev_iscsi_create -b {} -i iqn.2016-06.io.spdk:disk1/0 --url iscsi://192.168.10.20/iqn.2016-06.io.spdk:disk1/0",
                names.iscsi
            )
        );
        assert_eq!(
            lines[1],
            format!(
                "nbl_rpc.py emulator_virtio_blk_device_create --name {} --cpumask 0x2 --num_queues 1 --bdev_name {} --rom_idx 0",
                names.blk, names.iscsi
            )
        );

        let listed = rpc.list().unwrap();
        assert_eq!(listed["devices"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_attach_of_same_target_is_busy() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let rpc = rpc(runner.clone());

        rpc.attach(&target(), &CancelSignal::never()).await.unwrap();
        let err = rpc.attach(&target(), &CancelSignal::never()).await.unwrap_err();

        assert_eq!(err.kind, BackendErrorKind::Busy);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn failed_blk_create_rolls_back_bdev() {
        let runner = Arc::new(ScriptedRunner::new(|inv| {
            if inv.args.first().map(String::as_str) == Some("emulator_virtio_blk_device_create") {
                Ok(stderr("Failed to create virtio-blk device"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        }));
        let rpc = rpc(runner.clone());
        let names = cloud_disk_names(&target());

        let err = rpc.attach(&target(), &CancelSignal::never()).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::HardwareFault);

        let lines = runner.command_lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], format!("nbl_stor_rpc.py bdev_iscsi_delete {}", names.iscsi));
        assert_eq!(rpc.list().unwrap()["devices"], serde_json::json!([]));
    }

    #[tokio::test(start_paused = true)]
    async fn detach_waits_for_settle_then_deletes_bdev() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let rpc = rpc(runner.clone());
        let names = cloud_disk_names(&target());
        rpc.attach(&target(), &CancelSignal::never()).await.unwrap();

        let started = tokio::time::Instant::now();
        let payload = rpc.detach(&target(), &CancelSignal::never()).await.unwrap();

        assert_eq!(payload["result"], "Cloud disk disconnected successfully.");
        assert!(started.elapsed() >= Duration::from_secs(10));
        let lines = runner.command_lines();
        assert_eq!(lines[2], format!("nbl_rpc.py emulator_virtio_blk_device_delete --name {}", names.blk));
        assert_eq!(lines[3], format!("nbl_stor_rpc.py bdev_iscsi_delete {}", names.iscsi));
        assert_eq!(rpc.list().unwrap()["devices"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn detach_of_unknown_target_fails_without_rpc() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let rpc = rpc(runner.clone());

        let err = rpc.detach(&target(), &CancelSignal::never()).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::HardwareFault);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_detach_stops_during_settle() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let rpc = Arc::new(rpc(runner.clone()));
        rpc.attach(&target(), &CancelSignal::never()).await.unwrap();

        let (handle, signal) = cancel_pair();
        let task = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.detach(&target(), &signal).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.message.contains("cancelled"));
        // blk device deleted, bdev still registered
        assert_eq!(runner.calls().len(), 3);
        assert_eq!(
            rpc.list().unwrap()["devices"],
            serde_json::json!([cloud_disk_names(&target()).iscsi])
        );
    }
}
