//! Cloud-disk device naming and the persisted registry of attached devices

use md5::{Digest, Md5};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::hardware::StorageTarget;

/// Names of the two emulator objects backing one cloud disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudDiskNames {
    /// iSCSI bdev in the storage daemon
    pub iscsi: String,
    /// virtio-blk device exposed to the host
    pub blk: String,
}

/// Derive device names from the target. The same target always maps to the
/// same names, so a detach can find what an earlier attach created. The MD5
/// prefix keeps names compatible with devices already on the card.
pub fn cloud_disk_names(target: &StorageTarget) -> CloudDiskNames {
    let digest = Md5::digest(format!("{}_{}", target.ip, target.iqn).as_bytes());
    let short = &hex::encode(digest)[..8];
    CloudDiskNames {
        iscsi: format!("iscsi{short}"),
        blk: format!("blk{short}"),
    }
}

/// Set of device names currently created on the card.
///
/// Backed by a JSON array on disk when a path is given, so a restarted agent
/// still knows what it attached.
pub struct DeviceRegistry {
    path: Option<PathBuf>,
    names: Mutex<BTreeSet<String>>,
}

impl DeviceRegistry {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            names: Mutex::new(BTreeSet::new()),
        }
    }

    /// Load the registry from `path`. A missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let names = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeSet<String>>(&bytes) {
                Ok(names) => {
                    info!(path = %path.display(), count = names.len(), "loaded device registry");
                    names
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "device registry is corrupt, starting empty");
                    BTreeSet::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read device registry, starting empty");
                BTreeSet::new()
            }
        };

        Self {
            path: Some(path),
            names: Mutex::new(names),
        }
    }

    fn names(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().contains(name)
    }

    pub fn insert(&self, name: &str) {
        let mut names = self.names();
        if names.insert(name.to_string()) {
            self.persist(&names);
        }
    }

    pub fn remove(&self, name: &str) {
        let mut names = self.names();
        if names.remove(name) {
            self.persist(&names);
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.names().iter().cloned().collect()
    }

    fn persist(&self, names: &BTreeSet<String>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_json(path, names) {
            warn!(path = %path.display(), error = %e, "failed to persist device registry");
        }
    }
}

fn write_json(path: &Path, names: &BTreeSet<String>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(names)?;
    std::fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(ip: &str, iqn: &str) -> StorageTarget {
        StorageTarget {
            iqn: iqn.into(),
            ip: ip.parse().unwrap(),
        }
    }

    #[test]
    fn names_are_stable_and_target_specific() {
        let a = cloud_disk_names(&target("10.0.0.5", "iqn.2016-06.io.spdk:disk1"));
        let again = cloud_disk_names(&target("10.0.0.5", "iqn.2016-06.io.spdk:disk1"));
        let other = cloud_disk_names(&target("10.0.0.6", "iqn.2016-06.io.spdk:disk1"));

        assert_eq!(a, again);
        assert_ne!(a, other);
        assert!(a.iscsi.starts_with("iscsi"));
        assert_eq!(a.iscsi.len(), "iscsi".len() + 8);
        assert_eq!(a.iscsi["iscsi".len()..], a.blk["blk".len()..]);
    }

    #[test]
    fn names_match_existing_card_layout() {
        let names = cloud_disk_names(&target("192.168.10.20", "iqn.2016-06.io.spdk:disk1"));
        assert_eq!(names.iscsi, "iscsie753e540");
        assert_eq!(names.blk, "blke753e540");
    }

    #[test]
    fn registry_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("devices.json");

        let registry = DeviceRegistry::load(&path);
        registry.insert("iscsi0a1b2c3d");
        registry.insert("blk0a1b2c3d");
        registry.remove("iscsi0a1b2c3d");

        let reloaded = DeviceRegistry::load(&path);
        assert_eq!(reloaded.list(), vec!["blk0a1b2c3d".to_string()]);
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, b"{not json").unwrap();

        let registry = DeviceRegistry::load(&path);
        assert!(registry.list().is_empty());

        // The next change overwrites the corrupt file
        registry.insert("blk01234567");
        assert_eq!(DeviceRegistry::load(&path).list(), vec!["blk01234567".to_string()]);
    }
}
