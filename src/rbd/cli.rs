//! Production [`BlockOps`] backend shelling out to the `rbd` tool and the
//! usual host utilities (`blkid`, `mkfs.*`, `xfs_repair`, `mount`, `umount`).

use super::{BlockError, BlockOps};
use crate::shell::{self, MKFS_TIMEOUT, ShellError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, warn};

pub struct RbdTool {
    /// Ceph client id passed as `--id` on every rbd invocation.
    user: String,
    /// Cookie for the temporary lock held while formatting a new image.
    locker: String,
    timeout: Duration,
}

enum Probe {
    Clean,
    Dirty(String),
    TimedOut,
}

impl RbdTool {
    pub fn new(user: impl Into<String>, locker: impl Into<String>, timeout: Duration) -> Self {
        Self {
            user: user.into(),
            locker: locker.into(),
            timeout,
        }
    }

    async fn rbd(&self, args: &[&str]) -> Result<String, ShellError> {
        let mut full: Vec<&str> = args.to_vec();
        full.push("--id");
        full.push(&self.user);
        shell::run(self.timeout, "rbd", &full).await
    }

    async fn xfs_probe(&self, device: &str) -> Probe {
        match shell::run(self.timeout, "xfs_repair", &["-n", device]).await {
            Ok(_) => Probe::Clean,
            Err(e) if e.is_timeout() => Probe::TimedOut,
            Err(ShellError::Failed { stdout, stderr, .. }) => {
                Probe::Dirty(if stderr.is_empty() { stdout } else { stderr })
            }
            Err(e) => Probe::Dirty(e.to_string()),
        }
    }
}

/// Device path the kernel exposes for a mapped image.
fn device_path(pool: &str, image: &str) -> PathBuf {
    PathBuf::from(format!("/dev/rbd/{pool}/{image}"))
}

/// Find `mkfs.<fstype>` on PATH before touching the cluster.
fn lookup_mkfs(fstype: &str) -> Result<PathBuf, BlockError> {
    let binary = format!("mkfs.{fstype}");
    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(&binary);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(BlockError::MkfsMissing(fstype.to_string()))
}

/// Pick the `client.<id>` holding the lock `cookie` out of
/// `rbd lock list` output.
///
/// ```text
/// There is 1 exclusive lock on this image.
/// Locker        ID         Address
/// client.4485   myhost     192.168.10.2:0/1234
/// ```
fn parse_lock_owner(output: &str, cookie: &str) -> Option<String> {
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(locker), Some(id)) = (fields.next(), fields.next()) else {
            continue;
        };
        if locker.starts_with("client.") && id == cookie {
            return Some(locker.to_string());
        }
    }
    None
}

#[async_trait]
impl BlockOps for RbdTool {
    async fn image_exists(&self, pool: &str, image: &str) -> Result<bool, BlockError> {
        match self.rbd(&["info", image, "--pool", pool]).await {
            Ok(_) => Ok(true),
            Err(ShellError::Failed { status, stderr, .. })
                if status.code() == Some(2) || stderr.contains("No such file or directory") =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_image(
        &self,
        pool: &str,
        image: &str,
        size_mb: u64,
        fstype: &str,
    ) -> Result<(), BlockError> {
        let mkfs = lookup_mkfs(fstype)?;
        let size = size_mb.to_string();

        self.rbd(&[
            "create",
            image,
            "--pool",
            pool,
            "--size",
            &size,
            "--image-format",
            "2",
        ])
        .await?;

        if let Err(e) = self.lock_image(pool, image, &self.locker).await {
            if let Err(undo) = self.remove_image(pool, image).await {
                error!(%pool, %image, error = %undo, "failed to remove image after lock failure");
            }
            return Err(e);
        }

        let device = match self.map_image(pool, image).await {
            Ok(d) => d,
            Err(e) => {
                if let Err(undo) = self.unlock_image(pool, image, &self.locker).await {
                    error!(%pool, %image, error = %undo, "failed to unlock image after map failure");
                }
                if let Err(undo) = self.remove_image(pool, image).await {
                    error!(%pool, %image, error = %undo, "failed to remove image after map failure");
                }
                return Err(e);
            }
        };

        let dev = device.to_string_lossy();
        let mkfs_bin = mkfs.to_string_lossy();
        if let Err(e) = shell::run(MKFS_TIMEOUT, mkfs_bin.as_ref(), &[dev.as_ref()]).await {
            if let Err(undo) = self.unmap_device(&device).await {
                error!(%pool, %image, error = %undo, "failed to unmap device after mkfs failure");
            }
            if let Err(undo) = self.unlock_image(pool, image, &self.locker).await {
                error!(%pool, %image, error = %undo, "failed to unlock image after mkfs failure");
            }
            if let Err(undo) = self.remove_image(pool, image).await {
                error!(%pool, %image, error = %undo, "failed to remove image after mkfs failure");
            }
            return Err(e.into());
        }

        self.unmap_device(&device).await?;
        self.unlock_image(pool, image, &self.locker).await?;
        Ok(())
    }

    async fn remove_image(&self, pool: &str, image: &str) -> Result<(), BlockError> {
        self.rbd(&["rm", image, "--pool", pool]).await?;
        Ok(())
    }

    async fn rename_image(
        &self,
        pool: &str,
        image: &str,
        new_name: &str,
    ) -> Result<(), BlockError> {
        self.rbd(&["rename", image, new_name, "--pool", pool]).await?;
        Ok(())
    }

    async fn lock_image(&self, pool: &str, image: &str, cookie: &str) -> Result<(), BlockError> {
        self.rbd(&["lock", "add", image, cookie, "--pool", pool])
            .await?;
        Ok(())
    }

    async fn unlock_image(&self, pool: &str, image: &str, cookie: &str) -> Result<(), BlockError> {
        // The remove subcommand wants the internal client id, which only
        // `lock list` can tell us.
        let listing = self.rbd(&["lock", "list", image, "--pool", pool]).await?;
        let owner =
            parse_lock_owner(&listing, cookie).ok_or_else(|| BlockError::LockNotFound {
                pool: pool.to_string(),
                image: image.to_string(),
                cookie: cookie.to_string(),
            })?;
        self.rbd(&["lock", "remove", image, cookie, &owner, "--pool", pool])
            .await?;
        Ok(())
    }

    async fn map_image(&self, pool: &str, image: &str) -> Result<PathBuf, BlockError> {
        let out = self.rbd(&["map", image, "--pool", pool]).await?;
        if out.is_empty() {
            // Some kernels print nothing; the udev path is deterministic.
            Ok(device_path(pool, image))
        } else {
            Ok(PathBuf::from(out))
        }
    }

    async fn unmap_device(&self, device: &Path) -> Result<(), BlockError> {
        let dev = device.to_string_lossy();
        match self.rbd(&["unmap", dev.as_ref()]).await {
            Ok(_) => Ok(()),
            Err(ShellError::Failed { status, stderr, .. })
                if status.code() == Some(16) || stderr.to_lowercase().contains("busy") =>
            {
                Err(BlockError::Busy(device.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn detect_fstype(&self, device: &Path) -> Result<Option<String>, BlockError> {
        let dev = device.to_string_lossy();
        match shell::run(
            self.timeout,
            "blkid",
            &["-o", "value", "-s", "TYPE", dev.as_ref()],
        )
        .await
        {
            Ok(out) if out.is_empty() => Ok(None),
            Ok(out) => Ok(Some(out)),
            // blkid exits 2 when the probe recognizes nothing
            Err(ShellError::Failed { status, .. }) if status.code() == Some(2) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn verify_fs(
        &self,
        device: &Path,
        fstype: &str,
        mountpoint: &Path,
    ) -> Result<(), BlockError> {
        if fstype != "xfs" {
            debug!(device = %device.display(), %fstype, "no verification for filesystem type");
            return Ok(());
        }

        let dev = device.to_string_lossy();
        match self.xfs_probe(dev.as_ref()).await {
            Probe::Clean => Ok(()),
            Probe::TimedOut => {
                warn!(device = %device.display(), "xfs probe timed out, continuing");
                Ok(())
            }
            Probe::Dirty(detail) => {
                // A dirty log shows up as corruption to xfs_repair -n; a
                // mount/unmount cycle replays the journal, then re-probe.
                warn!(device = %device.display(), %detail, "xfs probe reported errors, replaying journal");
                tokio::fs::create_dir_all(mountpoint).await?;
                self.mount(device, mountpoint, fstype).await?;
                self.unmount(device).await?;
                match self.xfs_probe(dev.as_ref()).await {
                    Probe::Clean | Probe::TimedOut => Ok(()),
                    Probe::Dirty(detail) => Err(BlockError::Corrupt {
                        device: device.to_path_buf(),
                        detail,
                    }),
                }
            }
        }
    }

    async fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        fstype: &str,
    ) -> Result<(), BlockError> {
        let dev = device.to_string_lossy();
        let target = mountpoint.to_string_lossy();
        shell::run(
            self.timeout,
            "mount",
            &["-t", fstype, dev.as_ref(), target.as_ref()],
        )
        .await?;
        Ok(())
    }

    async fn unmount(&self, device: &Path) -> Result<(), BlockError> {
        let dev = device.to_string_lossy();
        shell::run(self.timeout, "umount", &[dev.as_ref()]).await?;
        Ok(())
    }

    async fn list_images(&self, pool: &str) -> Result<Vec<String>, BlockError> {
        let out = self.rbd(&["ls", "--pool", pool]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}
