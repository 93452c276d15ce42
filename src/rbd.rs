//! Capability surface over the Ceph RBD control plane and the host kernel.
//!
//! [`BlockOps`] is the minimum set of primitives the lifecycle engine
//! needs: image management, advisory locking, kernel mapping, filesystem
//! probing, and mounting. Nothing above this layer sees the `rbd` tool's
//! vocabulary. The production implementation is [`RbdTool`]; tests drive
//! the engine through an in-memory fake.

use crate::shell::ShellError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod cli;
pub use cli::RbdTool;

#[derive(Debug, Error)]
pub enum BlockError {
    /// The kernel refused to release the device; something still has it open.
    #[error("device {device} is busy", device = .0.display())]
    Busy(PathBuf),

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("mkfs.{0} not found on this host")]
    MkfsMissing(String),

    #[error("filesystem on {dev} failed verification: {detail}", dev = .device.display())]
    Corrupt { device: PathBuf, detail: String },

    #[error("no advisory lock held by '{cookie}' on {pool}/{image}")]
    LockNotFound {
        pool: String,
        image: String,
        cookie: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BlockError {
    pub fn is_busy(&self) -> bool {
        matches!(self, BlockError::Busy(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BlockError::Shell(e) if e.is_timeout())
    }
}

/// Operations on the remote block service and the host kernel.
///
/// Every call may block up to its configured deadline; a stuck tool
/// surfaces as a [`ShellError::Timeout`] wrapped in [`BlockError::Shell`].
#[async_trait]
pub trait BlockOps: Send + Sync {
    async fn image_exists(&self, pool: &str, image: &str) -> Result<bool, BlockError>;

    /// Provision a new image ready to mount: create at format v2, lock,
    /// map, mkfs, unmap, unlock. Steps compensate earlier ones on failure.
    async fn create_image(
        &self,
        pool: &str,
        image: &str,
        size_mb: u64,
        fstype: &str,
    ) -> Result<(), BlockError>;

    async fn remove_image(&self, pool: &str, image: &str) -> Result<(), BlockError>;

    async fn rename_image(&self, pool: &str, image: &str, new_name: &str)
    -> Result<(), BlockError>;

    /// Take the advisory exclusive lock under `cookie`.
    async fn lock_image(&self, pool: &str, image: &str, cookie: &str) -> Result<(), BlockError>;

    /// Release the advisory lock held under `cookie`, discovering the
    /// remote client id if the backend needs it.
    async fn unlock_image(&self, pool: &str, image: &str, cookie: &str) -> Result<(), BlockError>;

    /// Map the image into the kernel, returning the host device path.
    async fn map_image(&self, pool: &str, image: &str) -> Result<PathBuf, BlockError>;

    /// Unmap a device. [`BlockError::Busy`] means something on this host
    /// still holds it open.
    async fn unmap_device(&self, device: &Path) -> Result<(), BlockError>;

    /// Probe the filesystem type; `Ok(None)` when nothing is recognized.
    async fn detect_fstype(&self, device: &Path) -> Result<Option<String>, BlockError>;

    /// Verify the filesystem is mountable, attempting limited repair where
    /// the filesystem supports it. Probe timeouts are recoverable and do
    /// not fail verification.
    async fn verify_fs(
        &self,
        device: &Path,
        fstype: &str,
        mountpoint: &Path,
    ) -> Result<(), BlockError>;

    async fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        fstype: &str,
    ) -> Result<(), BlockError>;

    async fn unmount(&self, device: &Path) -> Result<(), BlockError>;

    /// Enumerate image names in a pool.
    async fn list_images(&self, pool: &str) -> Result<Vec<String>, BlockError>;
}
