//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Linux, where unprivileged mounts go through fusermount3.
//! - Thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use crate::fuse::BlobFuse;

fn default_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("blobfs");
    mo
}

/// Mounts `fs` on an empty directory without root privileges.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: BlobFuse,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let session = rfuse3::raw::Session::new(default_mount_options());
    session.mount_with_unprivileged(fs, mount_point).await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: BlobFuse,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let _ = default_mount_options();
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
