use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A live mount on this host.
///
/// A record exists iff the remote lock is held, the kernel mapping is
/// present, the mountpoint directory exists, and the filesystem is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    /// Image name within the pool.
    pub name: String,
    pub pool: String,
    /// Host kernel device path, e.g. `/dev/rbd/<pool>/<image>`.
    pub device: PathBuf,
    pub fstype: String,
    /// Cookie under which this host holds the advisory lock.
    pub locker: String,
    /// Opaque id Docker supplied on Mount; matched on Unmount.
    pub client_id: String,
}

/// What this host currently owns, keyed by mountpoint.
///
/// Process-wide and deliberately not persisted: after a daemon restart any
/// surviving kernel mappings are unknown to the registry, and Unmount on
/// them succeeds silently. Mutation happens only under the engine lock.
#[derive(Debug, Default)]
pub struct MountRegistry {
    mounts: HashMap<PathBuf, VolumeRecord>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mountpoint: &Path) -> Option<&VolumeRecord> {
        self.mounts.get(mountpoint)
    }

    pub fn contains(&self, mountpoint: &Path) -> bool {
        self.mounts.contains_key(mountpoint)
    }

    pub fn insert(&mut self, mountpoint: PathBuf, record: VolumeRecord) {
        self.mounts.insert(mountpoint, record);
    }

    pub fn remove(&mut self, mountpoint: &Path) -> Option<VolumeRecord> {
        self.mounts.remove(mountpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn snapshot(&self) -> Vec<(PathBuf, VolumeRecord)> {
        self.mounts
            .iter()
            .map(|(p, r)| (p.clone(), r.clone()))
            .collect()
    }
}
