// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem image lifecycle: create, loop mount, populate and copy

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use elemental_sys::device::{attach_loop, detach_loop};
use elemental_sys::fsutil::{MIB, copy_file, dir_size_mb, sync_data, temp_dir};
use elemental_sys::partitioner::format_device;
use elemental_sys::squashfs::create_squashfs;
use elemental_types::constants::{IMG_OVERHEAD_MB, IMG_SIZE, SYNC_EXCLUDES};
use elemental_types::{Image, ImageSource};
use tracing::{debug, error, info, warn};

use crate::cleanstack::{CleanStack, Cleaner};
use crate::config::Config;
use crate::error::{DeployError, Result};
use crate::source::dump_source;
use crate::system::resolve_temp_dir;

fn is_ext(fs: &str) -> bool {
    matches!(fs, "ext2" | "ext3" | "ext4")
}

/// Creates the image file and formats it.
///
/// A size of 0 is computed from `root_dir` plus some headroom and written
/// back to `img.size`. With `preload`, ext filesystems are built straight
/// from `root_dir`. On format failure the file is removed.
pub fn create_filesystem_image(
    cfg: &Config,
    img: &mut Image,
    root_dir: Option<&Path>,
    preload: bool,
) -> Result<()> {
    if preload && !is_ext(&img.fs) {
        return Err(DeployError::UnsupportedPreload(img.fs.clone()));
    }

    if img.size == 0 {
        img.size = match root_dir {
            Some(root) => dir_size_mb(root)?.saturating_add(IMG_OVERHEAD_MB),
            None => IMG_SIZE,
        };
    }

    info!("creating file system image {}", img.file.display());
    if let Some(parent) = img.file.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(&img.file)?;
    if let Err(err) = file.set_len(u64::from(img.size) * MIB) {
        drop(file);
        let _ = fs::remove_file(&img.file);
        return Err(err.into());
    }
    drop(file);

    let mut opts: Vec<String> = Vec::new();
    match root_dir {
        Some(root) if preload => {
            opts.extend(["-d".to_string(), root.display().to_string()]);
        }
        None if preload => warn!("nothing to preload into {}", img.file.display()),
        _ => {}
    }
    let opts: Vec<&str> = opts.iter().map(String::as_str).collect();

    if let Err(err) = format_device(cfg.runner.as_ref(), &img.file, &img.fs, &img.label, &opts) {
        error!("failed formatting {}: {err}", img.file.display());
        let _ = fs::remove_file(&img.file);
        return Err(err.into());
    }
    Ok(())
}

/// Attaches the image to a loop device and mounts it read-write
pub fn mount_filesystem_image(cfg: &Config, img: &mut Image) -> Result<()> {
    fs::create_dir_all(&img.mount_point)?;
    let loop_device = attach_loop(cfg.runner.as_ref(), &img.file, false)?;

    if let Err(err) = cfg
        .mounter
        .mount(&loop_device, &img.mount_point, "auto", &["rw"])
    {
        error!(
            "failed mounting {} on {}: {err}",
            loop_device.display(),
            img.mount_point.display()
        );
        if let Err(detach) = detach_loop(cfg.runner.as_ref(), &loop_device) {
            warn!("failed to release {}: {detach}", loop_device.display());
        }
        return Err(err.into());
    }

    img.loop_device = Some(loop_device);
    Ok(())
}

/// Unmounts the image and releases its loop device. No-op when not mounted.
pub fn unmount_filesystem_image(cfg: &Config, img: &mut Image) -> Result<()> {
    if cfg
        .mounter
        .is_likely_not_mount_point(&img.mount_point)
        .unwrap_or(true)
    {
        debug!(
            "not unmounting image, {} doesn't look like mountpoint",
            img.mount_point.display()
        );
        return Ok(());
    }

    cfg.mounter.unmount(&img.mount_point)?;
    if let Some(loop_device) = img.loop_device.take() {
        detach_loop(cfg.runner.as_ref(), &loop_device)?;
    }
    Ok(())
}

/// Builds `img` from the tree at `root`.
///
/// Every cleaner runs before returning, whatever the outcome. Squashfs images
/// are built in one go; anything else is created, then either preloaded or
/// mounted and filled with the tree.
pub fn create_image_from_tree<'a>(
    cfg: &Config,
    img: &mut Image,
    root: &Path,
    preload: bool,
    cleaners: Vec<Cleaner<'a>>,
) -> Result<()> {
    let mut stack = CleanStack::new();
    for cleaner in cleaners {
        stack.push_cleaner(cleaner);
    }
    let result = build_image_from_tree(cfg, img, root, preload);
    stack.cleanup(result)
}

fn build_image_from_tree(cfg: &Config, img: &mut Image, root: &Path, preload: bool) -> Result<()> {
    if img.is_squashfs() {
        if let Some(parent) = img.file.parent() {
            fs::create_dir_all(parent)?;
        }
        create_squashfs(
            cfg.runner.as_ref(),
            root,
            &img.file,
            &cfg.settings.squashfs_options,
        )?;
        return Ok(());
    }

    create_filesystem_image(cfg, img, Some(root), preload)?;
    if preload {
        return Ok(());
    }

    mount_filesystem_image(cfg, img)?;
    let synced = sync_data(root, &img.mount_point, SYNC_EXCLUDES)
        .inspect_err(|err| error!("failed syncing {} into image: {err}", root.display()))
        .map_err(DeployError::from);
    let unmounted = unmount_filesystem_image(cfg, img);
    synced.and(unmounted)
}

/// Builds `img` from its source: directories are used in place, file sources
/// are loop mounted and OCI images are extracted to a scratch tree first
pub fn deploy_image(cfg: &Config, img: &mut Image) -> Result<()> {
    info!("preparing image {} from {}", img.file.display(), img.source);
    let mut source = img.source.clone();

    let (tree, cleaner): (PathBuf, Cleaner<'_>) = match img.source.clone() {
        ImageSource::Dir(path) => {
            let cleaner: Cleaner<'_> = Box::new(|| -> Result<()> { Ok(()) });
            (path, cleaner)
        }
        ImageSource::File(path) => {
            let tree = temp_dir(Some(&resolve_temp_dir(cfg)), "elemental-tree-")?.keep();
            if let Err(err) = cfg.mounter.mount(&path, &tree, "auto", &["loop", "ro"]) {
                let _ = fs::remove_dir(&tree);
                return Err(err.into());
            }
            let mount_point = tree.clone();
            let cleaner: Cleaner<'_> = Box::new(move || -> Result<()> {
                cfg.mounter.unmount(&mount_point)?;
                fs::remove_dir(&mount_point)?;
                Ok(())
            });
            (tree, cleaner)
        }
        ImageSource::Oci { .. } => {
            let tree = temp_dir(Some(&resolve_temp_dir(cfg)), "elemental-tree-")?.keep();
            if let Err(err) = dump_source(cfg, &tree, &mut source) {
                let _ = fs::remove_dir_all(&tree);
                return Err(err);
            }
            let scratch = tree.clone();
            let cleaner: Cleaner<'_> = Box::new(move || -> Result<()> {
                fs::remove_dir_all(&scratch)?;
                Ok(())
            });
            (tree, cleaner)
        }
        ImageSource::Empty => {
            return Err(DeployError::UnknownSourceType("empty".to_string()));
        }
    };

    create_image_from_tree(cfg, img, &tree, false, vec![cleaner])?;
    img.source = source;
    Ok(())
}

/// Copies the file source of `img` to `img.file` and sets the filesystem
/// label of the copy. The copy is removed when relabeling fails.
pub fn copy_file_image(cfg: &Config, img: &Image) -> Result<()> {
    let ImageSource::File(source) = &img.source else {
        return Err(DeployError::UnknownSourceType(format!(
            "{} is not a file source",
            img.source
        )));
    };

    info!("copying image file {} to {}", source.display(), img.file.display());
    copy_file(source, &img.file)?;

    if is_ext(&img.fs) && !img.label.is_empty() {
        let file = img.file.to_string_lossy().into_owned();
        if let Err(err) = cfg
            .runner
            .run("tune2fs", &["-L", img.label.as_str(), file.as_str()])
        {
            error!("failed to apply label {} to {file}: {err}", img.label);
            let _ = fs::remove_file(&img.file);
            return Err(err.into());
        }
    }
    Ok(())
}
