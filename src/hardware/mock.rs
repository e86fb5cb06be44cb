//! [`MockBackend`] – hardware-free backend for bring-up and CI.
//!
//! Every operation succeeds immediately with the payload the real backend
//! returns on its success path. Nothing is remembered between calls, so
//! repeating a command always yields the same answer.

use async_trait::async_trait;

use super::real::cloud_disk_names;
use super::{
    attach_payload, boot_payload, detach_payload, devices_payload, power_payload,
    provision_payload, BackendKind, BackendResult, BootDevice, CancelSignal, DiskImage,
    DiskProvision, HardwareBackend, PowerAction, PowerControl, PowerState, StorageAttach,
    StorageTarget,
};

pub struct MockBackend {
    disk_device: String,
}

impl MockBackend {
    /// `disk_device` is echoed back by `provision_disk`, as the real backend does
    pub fn new(disk_device: impl Into<String>) -> Self {
        Self {
            disk_device: disk_device.into(),
        }
    }
}

#[async_trait]
impl PowerControl for MockBackend {
    async fn set_power(&self, action: PowerAction, _cancel: &CancelSignal) -> BackendResult {
        Ok(power_payload(action.resulting_state()))
    }

    async fn power_status(&self, _cancel: &CancelSignal) -> BackendResult {
        Ok(power_payload(PowerState::On))
    }

    async fn set_boot_device(
        &self,
        device: BootDevice,
        persistent: bool,
        _cancel: &CancelSignal,
    ) -> BackendResult {
        Ok(boot_payload(device, persistent))
    }
}

#[async_trait]
impl DiskProvision for MockBackend {
    async fn provision_disk(&self, image: &DiskImage, _cancel: &CancelSignal) -> BackendResult {
        Ok(provision_payload(image, &self.disk_device))
    }
}

#[async_trait]
impl StorageAttach for MockBackend {
    async fn attach_storage(&self, target: &StorageTarget, _cancel: &CancelSignal) -> BackendResult {
        Ok(attach_payload(&cloud_disk_names(target)))
    }

    async fn detach_storage(&self, _target: &StorageTarget, _cancel: &CancelSignal) -> BackendResult {
        Ok(detach_payload())
    }

    async fn list_devices(&self) -> BackendResult {
        Ok(devices_payload(Vec::new()))
    }
}

impl HardwareBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }
}
