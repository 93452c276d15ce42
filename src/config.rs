//! Daemon configuration, fixed at startup.

use crate::shell::ShellTimeout;
use clap::{Args, ValueEnum};
use std::path::PathBuf;

/// What happens to the backing image on `VolumeDriver.Remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RemoveAction {
    /// Leave the image untouched.
    #[default]
    Ignore,
    /// Delete the backing image.
    Delete,
    /// Rename the image with a `zz_` prefix so it can be reclaimed later.
    Rename,
}

#[derive(Args, Debug, Clone)]
pub struct DaemonConfig {
    /// Plugin name; the socket is created as <socket-dir>/<name>.sock
    #[arg(long, env = "RBDVOL_PLUGIN_NAME", default_value = "rbd")]
    pub plugin_name: String,

    /// Directory for the Docker plugin socket
    #[arg(long, env = "RBDVOL_SOCKET_DIR", default_value = "/run/docker/plugins")]
    pub socket_dir: PathBuf,

    /// Default Ceph pool for volumes that do not name one
    #[arg(long, env = "RBDVOL_POOL", default_value = "rbd")]
    pub pool: String,

    /// Ceph client id used for rbd commands
    #[arg(long, env = "RBDVOL_USER", default_value = "admin")]
    pub user: String,

    /// Default size in MB for newly provisioned images
    #[arg(long = "size", env = "RBDVOL_SIZE_MB", default_value_t = 20480)]
    pub size_mb: u64,

    /// Default filesystem for newly provisioned images
    #[arg(long, env = "RBDVOL_FSTYPE", default_value = "xfs")]
    pub fstype: String,

    /// Root directory under which volumes are mounted
    #[arg(
        long,
        env = "RBDVOL_MOUNT_ROOT",
        default_value = "/var/lib/docker/volumes/rbd"
    )]
    pub mount_root: PathBuf,

    /// What to do with the backing image on Remove
    #[arg(
        long,
        env = "RBDVOL_REMOVE_ACTION",
        value_enum,
        default_value_t = RemoveAction::Ignore
    )]
    pub remove_action: RemoveAction,

    /// Allow provisioning of missing images on Create
    #[arg(long, env = "RBDVOL_CAN_CREATE")]
    pub can_create: bool,

    /// Deadline for external commands (bare seconds or humantime, e.g. "2m")
    #[arg(long, env = "RBDVOL_SHELL_TIMEOUT", default_value_t = ShellTimeout::default())]
    pub shell_timeout: ShellTimeout,
}

impl DaemonConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", self.plugin_name))
    }

    /// Host mountpoint for an image: `<mount-root>/<pool>/<image>`.
    pub fn mount_path(&self, pool: &str, image: &str) -> PathBuf {
        self.mount_root.join(pool).join(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: DaemonConfig,
    }

    #[test]
    fn defaults_match_the_documented_layout() {
        let cli = TestCli::parse_from(["rbdvol"]);
        let config = cli.config;
        assert_eq!(config.pool, "rbd");
        assert_eq!(config.size_mb, 20480);
        assert_eq!(config.fstype, "xfs");
        assert_eq!(config.remove_action, RemoveAction::Ignore);
        assert!(!config.can_create);
        assert_eq!(
            config.socket_path(),
            PathBuf::from("/run/docker/plugins/rbd.sock")
        );
        assert_eq!(
            config.mount_path("rbd", "foo"),
            PathBuf::from("/var/lib/docker/volumes/rbd/rbd/foo")
        );
    }

    #[test]
    fn remove_action_parses_from_flag() {
        let cli = TestCli::parse_from(["rbdvol", "--remove-action", "rename"]);
        assert_eq!(cli.config.remove_action, RemoveAction::Rename);
    }
}
