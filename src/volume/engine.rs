//! Volume lifecycle engine.
//!
//! Turns a volume name into a mounted host path and back, guaranteeing
//! exclusive ownership across hosts (advisory lock) and on this host
//! (one engine-wide lock). Every mutating verb holds the engine lock for
//! its full duration, external commands included; each forward step that
//! fails triggers compensating actions for the steps before it, in
//! reverse order. Compensation failures are logged, never returned — the
//! caller sees the original failure.

use super::api::{CreateOptions, VolumeInfo};
use super::driver::VolumeDriver;
use super::error::PluginError;
use super::registry::{MountRegistry, VolumeRecord};
use crate::config::{DaemonConfig, RemoveAction};
use crate::name::VolumeName;
use crate::rbd::BlockOps;
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Locker cookie when the hostname cannot be determined.
pub const UNKNOWN_HOST: &str = "HOST_UNKNOWN";

/// Cookie under which this host takes advisory locks.
pub fn hostname_cookie() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

pub struct LifecycleEngine {
    config: DaemonConfig,
    ops: Arc<dyn BlockOps>,
    locker: String,
    state: Mutex<MountRegistry>,
}

impl LifecycleEngine {
    pub fn new(config: DaemonConfig, ops: Arc<dyn BlockOps>, locker: String) -> Self {
        Self {
            config,
            ops,
            locker,
            state: Mutex::new(MountRegistry::new()),
        }
    }

    fn parse(&self, fullname: &str) -> Result<VolumeName, PluginError> {
        VolumeName::parse(fullname, &self.config.pool, self.config.size_mb).map_err(Into::into)
    }

    fn mount_path(&self, name: &VolumeName) -> PathBuf {
        self.config.mount_path(&name.pool, &name.image)
    }

    async fn ensure_mountpoint(path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o775)).await
    }

    async fn undo_map(&self, device: &Path) {
        if let Err(e) = self.ops.unmap_device(device).await {
            error!(device = %device.display(), error = %e, "compensating unmap failed");
        }
    }

    async fn undo_lock(&self, name: &VolumeName) {
        if let Err(e) = self
            .ops
            .unlock_image(&name.pool, &name.image, &self.locker)
            .await
        {
            error!(volume = %name, error = %e, "compensating unlock failed");
        }
    }
}

#[async_trait]
impl VolumeDriver for LifecycleEngine {
    async fn create(&self, fullname: &str, opts: CreateOptions) -> Result<(), PluginError> {
        let mut name = self.parse(fullname)?;
        if let Some(pool) = opts.pool {
            name.pool = pool;
        }
        if let Some(size) = &opts.size {
            match size.parse::<u64>() {
                Ok(n) if n > 0 => name.size_mb = n,
                _ => warn!(%size, "ignoring unusable size option"),
            }
        }
        let fstype = opts.fstype.unwrap_or_else(|| self.config.fstype.clone());

        let state = self.state.lock().await;
        let mountpoint = self.mount_path(&name);

        // Already mounted here means already created; Docker retries Create freely.
        if state.contains(&mountpoint) {
            return Ok(());
        }

        if self.ops.image_exists(&name.pool, &name.image).await? {
            return Ok(());
        }
        if !self.config.can_create {
            return Err(PluginError::NotFound(name.image));
        }

        info!(volume = %name, size_mb = name.size_mb, %fstype, "provisioning image");
        self.ops
            .create_image(&name.pool, &name.image, name.size_mb, &fstype)
            .await?;
        Ok(())
    }

    async fn mount(&self, fullname: &str, id: &str) -> Result<PathBuf, PluginError> {
        let name = self.parse(fullname)?;
        let mut state = self.state.lock().await;
        let mountpoint = self.mount_path(&name);

        self.ops
            .lock_image(&name.pool, &name.image, &self.locker)
            .await
            .map_err(|source| PluginError::LockDenied {
                pool: name.pool.clone(),
                image: name.image.clone(),
                source,
            })?;

        let device = match self.ops.map_image(&name.pool, &name.image).await {
            Ok(d) => d,
            Err(source) => {
                self.undo_lock(&name).await;
                return Err(PluginError::MapFailed {
                    pool: name.pool.clone(),
                    image: name.image.clone(),
                    source,
                });
            }
        };

        let fstype = match self.ops.detect_fstype(&device).await {
            Ok(Some(fs)) => fs,
            Ok(None) => {
                warn!(device = %device.display(), default = %self.config.fstype,
                    "unable to detect filesystem type, using default");
                self.config.fstype.clone()
            }
            Err(e) => {
                warn!(device = %device.display(), error = %e,
                    "filesystem detection failed, using default");
                self.config.fstype.clone()
            }
        };

        if let Err(source) = self.ops.verify_fs(&device, &fstype, &mountpoint).await {
            self.undo_map(&device).await;
            self.undo_lock(&name).await;
            return Err(PluginError::FsCorrupt { device, source });
        }

        if let Err(source) = Self::ensure_mountpoint(&mountpoint).await {
            self.undo_map(&device).await;
            self.undo_lock(&name).await;
            return Err(PluginError::MountPath {
                path: mountpoint,
                source,
            });
        }

        if let Err(source) = self.ops.mount(&device, &mountpoint, &fstype).await {
            self.undo_map(&device).await;
            self.undo_lock(&name).await;
            return Err(PluginError::MountFailed {
                device,
                path: mountpoint,
                source,
            });
        }

        state.insert(
            mountpoint.clone(),
            VolumeRecord {
                name: name.image.clone(),
                pool: name.pool.clone(),
                device,
                fstype,
                locker: self.locker.clone(),
                client_id: id.to_string(),
            },
        );
        info!(volume = %name, mountpoint = %mountpoint.display(), "volume mounted");
        Ok(mountpoint)
    }

    async fn unmount(&self, fullname: &str, id: &str) -> Result<(), PluginError> {
        let name = self.parse(fullname)?;
        let mut state = self.state.lock().await;
        let mountpoint = self.mount_path(&name);

        let record = match state.get(&mountpoint) {
            Some(r) => r.clone(),
            None => {
                // Docker issues Unmount after a failed Mount. A speculative
                // teardown of a device we do not own could rip a volume out
                // from under another container, so do nothing.
                warn!(volume = %name, "unmount for unknown mountpoint, ignoring");
                return Ok(());
            }
        };

        if record.client_id != id {
            warn!(volume = %name, expected = %record.client_id, got = %id,
                "unmount from stale client, ignoring");
            return Ok(());
        }

        let mut failures: Vec<String> = Vec::new();

        if let Err(e) = self.ops.unmount(&record.device).await {
            error!(volume = %name, error = %e, "unmount failed");
            failures.push(format!("unmount error: {e}"));
        }

        match self.ops.unmap_device(&record.device).await {
            Ok(()) => {}
            Err(e) if e.is_busy() => {
                // Still open inside a container. The host view is already
                // gone after the umount above; releasing the lock or the
                // record now would hand the image to another host mid-write.
                return Err(PluginError::Busy(record.device));
            }
            Err(e) => {
                error!(volume = %name, error = %e, "unmap failed");
                failures.push(format!("unmap error: {e}"));
            }
        }

        if let Err(e) = self
            .ops
            .unlock_image(&record.pool, &record.name, &record.locker)
            .await
        {
            error!(volume = %name, error = %e, "unlock failed");
            failures.push(format!("unlock error: {e}"));
        }

        state.remove(&mountpoint);

        if failures.is_empty() {
            info!(volume = %name, "volume unmounted");
            Ok(())
        } else {
            Err(PluginError::Teardown(failures.join("; ")))
        }
    }

    async fn remove(&self, fullname: &str) -> Result<(), PluginError> {
        let name = self.parse(fullname)?;
        let mut state = self.state.lock().await;
        let mountpoint = self.mount_path(&name);

        if !self.ops.image_exists(&name.pool, &name.image).await? {
            return Err(PluginError::NotFound(name.image));
        }

        // The lock is mutual exclusion against other hosts touching the
        // image while we delete or rename it.
        self.ops
            .lock_image(&name.pool, &name.image, &self.locker)
            .await
            .map_err(|source| PluginError::LockDenied {
                pool: name.pool.clone(),
                image: name.image.clone(),
                source,
            })?;

        match self.config.remove_action {
            RemoveAction::Delete => {
                if let Err(e) = self.ops.remove_image(&name.pool, &name.image).await {
                    self.undo_lock(&name).await;
                    return Err(e.into());
                }
                // The lock usually evaporates with the image.
                if let Err(e) = self
                    .ops
                    .unlock_image(&name.pool, &name.image, &self.locker)
                    .await
                {
                    debug!(volume = %name, error = %e, "unlock after delete failed");
                }
                info!(volume = %name, "image deleted");
            }
            RemoveAction::Rename => {
                let renamed = format!("zz_{}", name.image);
                if let Err(e) = self
                    .ops
                    .rename_image(&name.pool, &name.image, &renamed)
                    .await
                {
                    self.undo_lock(&name).await;
                    return Err(e.into());
                }
                if let Err(e) = self.ops.unlock_image(&name.pool, &renamed, &self.locker).await {
                    warn!(volume = %name, %renamed, error = %e, "unlock after rename failed");
                }
                info!(volume = %name, %renamed, "image renamed out of the way");
            }
            RemoveAction::Ignore => {
                if let Err(e) = self
                    .ops
                    .unlock_image(&name.pool, &name.image, &self.locker)
                    .await
                {
                    warn!(volume = %name, error = %e, "unlock failed");
                }
                info!(volume = %name, "image left in place");
            }
        }

        state.remove(&mountpoint);
        Ok(())
    }

    async fn path(&self, fullname: &str) -> Result<PathBuf, PluginError> {
        // Purely computational; Docker calls this even for volumes that
        // were never mounted here.
        let name = self.parse(fullname)?;
        Ok(self.mount_path(&name))
    }

    async fn get(&self, fullname: &str) -> Result<VolumeInfo, PluginError> {
        let name = self.parse(fullname)?;
        let mountpoint = self.mount_path(&name);

        if !self.ops.image_exists(&name.pool, &name.image).await? {
            let mut state = self.state.lock().await;
            if state.remove(&mountpoint).is_some() {
                warn!(volume = %name, "dropped stale registry entry for missing image");
            }
            return Err(PluginError::NotFound(name.image));
        }

        let state = self.state.lock().await;
        let mountpoint = if state.contains(&mountpoint) {
            mountpoint.display().to_string()
        } else {
            String::new()
        };
        Ok(VolumeInfo {
            name: fullname.to_string(),
            mountpoint,
        })
    }

    async fn list(&self) -> Result<Vec<VolumeInfo>, PluginError> {
        // Only the default pool is enumerated; volumes living in other
        // pools do not show up here.
        let images = self.ops.list_images(&self.config.pool).await?;

        let state = self.state.lock().await;
        Ok(images
            .into_iter()
            .map(|image| {
                let mountpoint = self.config.mount_path(&self.config.pool, &image);
                let mountpoint = if state.contains(&mountpoint) {
                    mountpoint.display().to_string()
                } else {
                    String::new()
                };
                VolumeInfo {
                    name: image,
                    mountpoint,
                }
            })
            .collect())
    }
}
