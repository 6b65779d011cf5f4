// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem tree helpers: sizing, copying and scaffolding

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, lchown, symlink};
use std::path::{Path, PathBuf};

use elemental_types::constants::ESSENTIAL_DIRS;
use filetime::{FileTime, set_file_times, set_symlink_file_times};
use nix::sys::stat::{Mode, SFlag, mknod};
use tempfile::TempDir;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::{Result, SysError};

pub const MIB: u64 = 1024 * 1024;

/// Apparent size in bytes of every non-directory entry below `path`.
/// Symlinks are counted, not followed.
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(walk_error)?;
        if entry.file_type().is_dir() {
            continue;
        }
        total = total.saturating_add(entry.metadata().map_err(walk_error)?.len());
    }
    Ok(total)
}

/// Size of the tree rounded up to the next whole MiB
pub fn dir_size_mb(path: &Path) -> Result<u32> {
    let size = dir_size(path)?;
    Ok(u32::try_from(size.div_ceil(MIB)).unwrap_or(u32::MAX))
}

/// Creates the directories every root tree is expected to provide
pub fn create_dir_structure(target: &Path) -> Result<()> {
    for dir in ESSENTIAL_DIRS {
        fs::create_dir_all(target.join(dir))?;
    }
    Ok(())
}

/// Private scratch directory, removed when dropped
pub fn temp_dir(base: Option<&Path>, prefix: &str) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    let dir = match base {
        Some(base) => {
            fs::create_dir_all(base)?;
            builder.tempdir_in(base)?
        }
        None => builder.tempdir()?,
    };
    Ok(dir)
}

pub fn copy_file(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target)?;
    Ok(())
}

#[derive(Hash, Eq, PartialEq, Clone, Copy)]
struct FileId {
    dev: u64,
    ino: u64,
}

/// Copies the contents of `source` into `target`, preserving permissions,
/// ownership (when running as root), timestamps, extended attributes and
/// hard links.
///
/// Excludes are paths relative to `source`; a leading `/` is ignored.
pub fn sync_data(source: &Path, target: &Path, excludes: &[&str]) -> Result<()> {
    debug!(
        source = %source.display(),
        target = %target.display(),
        "syncing tree"
    );

    let excludes: Vec<PathBuf> = excludes
        .iter()
        .map(|pattern| PathBuf::from(pattern.trim_start_matches('/')))
        .collect();
    let is_root = unsafe { libc::geteuid() } == 0;
    let mut links: HashMap<FileId, PathBuf> = HashMap::new();
    let mut dirs: Vec<(PathBuf, fs::Metadata)> = Vec::new();

    fs::create_dir_all(target)?;

    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(source)
                .map(|rel| !excludes.iter().any(|excluded| rel == excluded))
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| SysError::Io(io::Error::other(err)))?;
        let dest = target.join(rel);
        let metadata = entry.path().symlink_metadata()?;
        let file_type = metadata.file_type();

        trace!(path = %rel.display(), "copying entry");

        if file_type.is_dir() {
            if !dest.is_dir() {
                remove_existing(&dest)?;
                fs::create_dir_all(&dest)?;
            }
            dirs.push((dest, metadata));
            continue;
        }

        remove_existing(&dest)?;

        if metadata.nlink() > 1 {
            let id = FileId {
                dev: metadata.dev(),
                ino: metadata.ino(),
            };
            if let Some(first) = links.get(&id) {
                fs::hard_link(first, &dest)?;
                continue;
            }
            links.insert(id, dest.clone());
        }

        if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &dest)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest)?;
        } else if file_type.is_fifo()
            || file_type.is_char_device()
            || file_type.is_block_device()
            || file_type.is_socket()
        {
            let kind = SFlag::from_bits_truncate(metadata.mode() & libc::S_IFMT);
            let perm = Mode::from_bits_truncate(metadata.mode() & 0o7777);
            mknod(&dest, kind, perm, metadata.rdev())
                .map_err(|errno| SysError::Io(io::Error::from(errno)))?;
        }

        apply_metadata(entry.path(), &dest, &metadata, is_root)?;
    }

    // Directory times change while their children are written, fix them last
    for (dest, metadata) in dirs.iter().rev() {
        apply_metadata(Path::new(""), dest, metadata, is_root)?;
    }

    Ok(())
}

fn apply_metadata(source: &Path, dest: &Path, metadata: &fs::Metadata, is_root: bool) -> Result<()> {
    let is_symlink = metadata.file_type().is_symlink();

    if is_root {
        lchown(dest, Some(metadata.uid()), Some(metadata.gid()))?;
    }

    if !is_symlink {
        fs::set_permissions(dest, metadata.permissions())?;
    }

    if !source.as_os_str().is_empty() {
        copy_xattrs(source, dest);
    }

    let atime = FileTime::from_last_access_time(metadata);
    let mtime = FileTime::from_last_modification_time(metadata);
    if is_symlink {
        set_symlink_file_times(dest, atime, mtime)?;
    } else {
        set_file_times(dest, atime, mtime)?;
    }
    Ok(())
}

/// Best effort: the target filesystem may not support every namespace
fn copy_xattrs(source: &Path, dest: &Path) {
    let Ok(names) = xattr::list(source) else {
        return;
    };
    for name in names {
        if let Ok(Some(value)) = xattr::get(source, &name)
            && let Err(err) = xattr::set(dest, &name, &value)
        {
            trace!(path = %dest.display(), attr = ?name, "xattr not copied: {err}");
        }
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

fn walk_error(err: walkdir::Error) -> SysError {
    SysError::Io(err.into())
}
