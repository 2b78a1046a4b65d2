//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Linux. Unprivileged mounts go through fusermount3, privileged ones open
//!   /dev/fuse directly.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

#[cfg(target_os = "linux")]
use tracing::info;

use super::PathFs;
use crate::config::MountConfig;
use crate::engine::StorageEngine;

/// Mount `fs` on the given directory with the session settings in `config`.
#[cfg(target_os = "linux")]
pub async fn mount<E>(
    fs: PathFs<E>,
    mount_point: impl AsRef<Path>,
    config: &MountConfig,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    E: StorageEngine + 'static,
{
    let mount_point = mount_point.as_ref();
    let session = rfuse3::raw::Session::new(config.mount_options());
    if config.privileged {
        info!(mountpoint = %mount_point.display(), "mounting (privileged)");
        session.mount(fs, mount_point).await
    } else {
        // Requires fusermount3 in PATH
        info!(mountpoint = %mount_point.display(), "mounting (unprivileged)");
        session.mount_with_unprivileged(fs, mount_point).await
    }
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount<E>(
    _fs: PathFs<E>,
    _mount_point: impl AsRef<Path>,
    _config: &MountConfig,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    E: StorageEngine + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
