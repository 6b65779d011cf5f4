// SPDX-License-Identifier: GPL-3.0-only

use std::fmt::Write;
use std::io;
use std::path::PathBuf;

use elemental_sys::SysError;
use elemental_types::LayoutError;
use thiserror::Error;

/// Errors of the deployment orchestrators
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("disk {} does not exist", .0.display())]
    DiskNotFound(PathBuf),

    #[error("no partition given")]
    MissingPartition,

    #[error("partition {0} has no mount point")]
    NoMountPoint(String),

    #[error("{} is mounted but missing from the mount table", .0.display())]
    NotInMountTable(PathBuf),

    #[error("preloading an image is only supported on ext2, ext3 and ext4, not {0}")]
    UnsupportedPreload(String),

    #[error("unknown image source type: {0}")]
    UnknownSourceType(String),

    #[error("signature verification of {reference} failed: {output}")]
    Verification { reference: String, output: String },

    #[error("{}", unmount_failures(.0))]
    UnmountFailures(Vec<(PathBuf, SysError)>),

    #[error("a system is already installed ({label} on {}), force is required to overwrite it", device.display())]
    ExistingInstallation { label: String, device: PathBuf },

    #[error("invalid ISO {}: {reason}", path.display())]
    InvalidIso { path: PathBuf, reason: String },

    #[error("invalid configuration {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Sys(#[from] SysError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;

fn unmount_failures(failures: &[(PathBuf, SysError)]) -> String {
    let mut msg = String::from("failed to unmount");
    for (mount_point, err) in failures {
        let _ = write!(msg, "\n  {}: {err}", mount_point.display());
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmount_failures_name_every_mount_point() {
        let err = DeployError::UnmountFailures(vec![
            (
                PathBuf::from("/run/cos/oem"),
                SysError::DeviceNotFound("busy".into()),
            ),
            (
                PathBuf::from("/run/cos/state"),
                SysError::DeviceNotFound("gone".into()),
            ),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("/run/cos/oem"));
        assert!(msg.contains("/run/cos/state"));
    }
}
