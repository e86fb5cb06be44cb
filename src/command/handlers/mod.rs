//! Built-in extensions and the context their handlers run with

mod diagnostics;
mod disk;
mod power;
mod storage;

use std::net::IpAddr;
use std::sync::Arc;

use super::registry::{ExtensionRegistry, RegistryError};
use super::types::{Arguments, CommandError};
use crate::hardware::{CancelSignal, HardwareBackend};

/// Baseboard management controller session; one chassis operation at a time
pub const BMC_SESSION: &str = "bmc-session";
/// The host disk written by provisioning
pub const HOST_DISK: &str = "disk-0";
/// Storage emulator state (bdevs and virtio-blk devices)
pub const STORAGE_MOUNT: &str = "storage-mount";

/// Everything a handler gets for one invocation
#[derive(Clone)]
pub struct HandlerContext {
    pub correlation_id: String,
    /// Already validated against the extension's argument specs
    pub args: Arguments,
    pub backend: Arc<dyn HardwareBackend>,
    /// Fires when the command's deadline passes
    pub cancel: CancelSignal,
}

impl HandlerContext {
    pub fn str_arg(&self, name: &str) -> Result<&str, CommandError> {
        self.args
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| CommandError::invalid_arguments(format!("`{name}` must be a string")))
    }

    pub fn opt_str_arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(|v| v.as_str())
    }

    /// Optional boolean, `false` when absent
    pub fn flag(&self, name: &str) -> bool {
        self.args.get(name).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn ip_arg(&self, name: &str) -> Result<IpAddr, CommandError> {
        let raw = self.str_arg(name)?;
        raw.parse()
            .map_err(|_| CommandError::invalid_arguments(format!("`{name}` is not an IP address: {raw}")))
    }
}

/// Registry holding every built-in extension
pub fn builtin_registry() -> Result<ExtensionRegistry, RegistryError> {
    let mut registry = ExtensionRegistry::new();
    let extensions = power::extensions()
        .into_iter()
        .chain(disk::extensions())
        .chain(storage::extensions())
        .chain(diagnostics::extensions());
    for extension in extensions {
        registry.register(extension)?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_register_without_conflict() {
        let registry = builtin_registry().unwrap();
        assert_eq!(
            registry.names(),
            vec![
                "check-heartbeat",
                "connect-cloud-disk",
                "disconnect-cloud-disk",
                "list-devices",
                "power-cycle",
                "power-off",
                "power-on",
                "power-status",
                "provision-disk",
                "set-boot-device",
            ]
        );
    }

    #[test]
    fn builtins_declare_expected_resources() {
        let registry = builtin_registry().unwrap();
        let resources = |name: &str| -> Vec<String> {
            registry.resolve(name).unwrap().resources().iter().cloned().collect()
        };

        assert_eq!(resources("power-cycle"), vec![BMC_SESSION]);
        assert_eq!(resources("provision-disk"), vec![HOST_DISK]);
        assert_eq!(resources("connect-cloud-disk"), vec![STORAGE_MOUNT]);
        assert!(resources("check-heartbeat").is_empty());
        assert!(resources("list-devices").is_empty());
    }
}
