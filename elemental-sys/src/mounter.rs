// SPDX-License-Identifier: GPL-3.0-only

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::mount::{MntFlags, umount2};
use tracing::debug;

use crate::error::{Result, SysError};
use crate::mountinfo::{MountEntry, read_mount_table};
use crate::runner::{CommandRunner, Runner};

/// Mount table access
pub trait Mounter: Send + Sync {
    fn mount(&self, source: &Path, target: &Path, fs_type: &str, options: &[&str]) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Cheap check comparing the device of `path` with its parent's.
    ///
    /// Bind mounts of the same filesystem are not detected. A missing path is
    /// not a mount point.
    fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool>;

    /// Current mount table
    fn list(&self) -> Result<Vec<MountEntry>>;
}

/// Mounts through the `mount` binary so filesystem type probing (`auto`) and
/// loop option handling stay with util-linux
#[derive(Debug, Clone, Default)]
pub struct SystemMounter {
    runner: CommandRunner,
}

impl SystemMounter {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

impl Mounter for SystemMounter {
    fn mount(&self, source: &Path, target: &Path, fs_type: &str, options: &[&str]) -> Result<()> {
        let source = source.to_string_lossy();
        let target = target.to_string_lossy();
        let joined = options.join(",");

        let mut args: Vec<&str> = Vec::with_capacity(6);
        if !fs_type.is_empty() && fs_type != "auto" {
            args.extend(["-t", fs_type]);
        }
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.push(&source);
        args.push(&target);

        self.runner.run("mount", &args)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        debug!(target = %target.display(), "unmounting");
        umount2(target, MntFlags::empty()).map_err(|errno| SysError::Io(io::Error::from(errno)))
    }

    fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool> {
        let metadata = match path.symlink_metadata() {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        if metadata.file_type().is_symlink() {
            return Ok(true);
        }

        let Some(parent) = path.parent() else {
            return Ok(false);
        };
        let parent_metadata = parent.metadata()?;
        Ok(metadata.dev() == parent_metadata.dev())
    }

    fn list(&self) -> Result<Vec<MountEntry>> {
        read_mount_table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_directories_are_not_mount_points() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).expect("mkdir");

        let mounter = SystemMounter::default();
        assert!(mounter.is_likely_not_mount_point(&nested).unwrap());
        assert!(
            mounter
                .is_likely_not_mount_point(&dir.path().join("missing"))
                .unwrap()
        );
    }

    #[test]
    fn root_is_a_mount_point() {
        let mounter = SystemMounter::default();
        assert!(!mounter.is_likely_not_mount_point(Path::new("/")).unwrap());
    }

    #[test]
    fn lists_host_mounts() {
        let entries = SystemMounter::default().list().expect("mountinfo readable");
        assert!(entries.iter().any(|entry| entry.mount_point == Path::new("/")));
    }
}
