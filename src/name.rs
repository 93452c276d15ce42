//! Volume name parsing.
//!
//! Docker hands the plugin a single opaque volume name; the Ceph side needs
//! a pool, an image name, and a provisioning size. The accepted grammar is
//! `[<pool>/]<image>[@<sizeMB>]`, with pool and size falling back to the
//! daemon defaults when absent.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::warn;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([-_.[:alnum:]]+)/)?([-_.[:alnum:]]+)(?:@([0-9]+))?$")
        .expect("volume name grammar must compile")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid volume name: '{0}'")]
pub struct NameError(pub String);

/// A volume name resolved against the daemon defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeName {
    pub pool: String,
    pub image: String,
    pub size_mb: u64,
}

impl VolumeName {
    /// Parse `[<pool>/]<image>[@<sizeMB>]`.
    ///
    /// A size that matches the grammar but is not a usable positive integer
    /// (zero, or too large to represent) falls back to the default with a
    /// warning rather than failing the request.
    pub fn parse(
        fullname: &str,
        default_pool: &str,
        default_size_mb: u64,
    ) -> Result<Self, NameError> {
        let caps = NAME_RE
            .captures(fullname)
            .ok_or_else(|| NameError(fullname.to_string()))?;

        let pool = caps
            .get(1)
            .map_or(default_pool, |m| m.as_str())
            .to_string();
        let image = caps[2].to_string();

        let size_mb = match caps.get(3) {
            None => default_size_mb,
            Some(m) => match m.as_str().parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!(
                        name = fullname,
                        size = m.as_str(),
                        default = default_size_mb,
                        "unusable size in volume name, using default"
                    );
                    default_size_mb
                }
            },
        };

        Ok(Self {
            pool,
            image,
            size_mb,
        })
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.image)
    }
}
