// SPDX-License-Identifier: GPL-3.0-only

//! Partition lifecycle: create, format, mount and unmount

use std::fs;
use std::path::{Path, PathBuf};

use elemental_sys::device::get_device_by_label;
use elemental_sys::mountinfo::find_mount;
use elemental_sys::partitioner::{Disk, format_device};
use elemental_types::{InstallSpec, Partition, sort_by_mount_point};
use tracing::{debug, error, info, warn};

use crate::cleanstack::Cleaner;
use crate::config::{Config, LABEL_LOOKUP_TRIES};
use crate::error::{DeployError, Result};

/// Writes a new partition table on the install target and creates every
/// partition of the layout in install order.
///
/// Not atomic: the previous table is gone as soon as the new one is written,
/// and a failure halfway leaves the partitions created so far on disk.
pub fn partition_and_format_device(cfg: &Config, install: &mut InstallSpec) -> Result<()> {
    let mut disk = Disk::new(install.target.clone(), cfg.runner.as_ref())
        .with_retry_interval(cfg.retry_interval);
    if !disk.exists() {
        error!("disk {} does not exist", install.target.display());
        return Err(DeployError::DiskNotFound(install.target.clone()));
    }

    info!("partitioning device {}", disk.device().display());
    let out = disk
        .new_partition_table(install.part_table)
        .inspect_err(|err| error!("failed creating new partition table: {err}"))?;
    debug!("partitioner output: {out}");

    create_partitions(cfg, &mut disk, install)
}

/// Creates and formats the layout partitions one after the other, firmware
/// partitions first. Stops at the first failure.
pub fn create_partitions(cfg: &Config, disk: &mut Disk<'_>, install: &mut InstallSpec) -> Result<()> {
    let device = disk.device().to_path_buf();
    for part in install
        .partitions
        .partitions_by_install_order(&mut install.extra_partitions.0)
    {
        part.disk = Some(device.clone());
        create_and_format_partition(cfg, disk, part)?;
    }
    Ok(())
}

/// Adds `part` to the disk, then formats it or wipes stale signatures when no
/// filesystem is declared. `part.path` is set as soon as the device node shows up.
pub fn create_and_format_partition(
    cfg: &Config,
    disk: &mut Disk<'_>,
    part: &mut Partition,
) -> Result<()> {
    debug!("adding partition {}", part.name);
    let number = disk
        .add_partition(part.size, part.filesystem(), &part.name, &part.flags)
        .inspect_err(|err| error!("failed creating {} partition: {err}", part.name))?;

    let device = disk.find_partition_device(number)?;
    part.path = Some(device.clone());

    match part.filesystem() {
        Some(fs) => {
            debug!("formatting partition {} with label {}", part.name, part.filesystem_label);
            format_device(cfg.runner.as_ref(), &device, fs, &part.filesystem_label, &[])
                .inspect_err(|err| error!("failed formatting partition {}: {err}", part.name))?;
        }
        None => {
            debug!("wiping filesystem signatures of partition {}", part.name);
            disk.wipe_fs_on_partition(&device)
                .inspect_err(|err| error!("failed to wipe filesystem of partition {number}: {err}"))?;
        }
    }
    Ok(())
}

/// Mounts every partition that has a mount point, parents before nested mount
/// points. Already mounted partitions are left alone. On failure every mount
/// made by this call is undone and the mount error is returned.
///
/// `overwrite_flags`, when not empty, replace each partition's own mount options.
pub fn mount_partitions<'p>(
    cfg: &Config,
    parts: impl IntoIterator<Item = &'p Partition>,
    overwrite_flags: &[&str],
) -> Result<()> {
    info!("mounting disk partitions");
    let mut mounted: Vec<&Partition> = Vec::new();

    for part in sort_by_mount_point(parts.into_iter().collect(), false) {
        let result = is_mounted(cfg, Some(part)).and_then(|already| {
            if already {
                debug!("partition {} already mounted", part.name);
                return Ok(false);
            }
            mount_partition(cfg, part, overwrite_flags).map(|()| true)
        });
        match result {
            Ok(true) => mounted.push(part),
            Ok(false) => {}
            Err(err) => {
                error!("failed mounting partition {}: {err}", part.name);
                roll_back(cfg, &mounted);
                return Err(err);
            }
        }
    }
    Ok(())
}

fn roll_back(cfg: &Config, mounted: &[&Partition]) {
    for done in mounted.iter().rev() {
        if let Err(undo) = unmount_partition(cfg, done) {
            warn!("rollback of partition {} failed: {undo}", done.name);
        }
    }
}

/// Unmounts every partition that has a mount point, nested mount points
/// first. Keeps going after a failure and reports all of them at the end.
pub fn unmount_partitions<'p>(
    cfg: &Config,
    parts: impl IntoIterator<Item = &'p Partition>,
) -> Result<()> {
    info!("unmounting disk partitions");
    let mut failures = Vec::new();

    for part in sort_by_mount_point(parts.into_iter().collect(), true) {
        let Some(mount_point) = part.mount_point() else {
            continue;
        };
        if let Err(err) = unmount_mount_point(cfg, mount_point) {
            error!("failed to unmount {}: {err}", mount_point.display());
            failures.push((mount_point.to_path_buf(), err));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(DeployError::UnmountFailures(failures))
    }
}

/// Mounts `part` on its mount point with the `auto` filesystem type.
///
/// The device is `part.path` when known, otherwise it is looked up by
/// filesystem label. Options default to the partition's own, then `rw`.
pub fn mount_partition(cfg: &Config, part: &Partition, opts: &[&str]) -> Result<()> {
    let mount_point = part
        .mount_point()
        .ok_or_else(|| DeployError::NoMountPoint(part.name.clone()))?;
    fs::create_dir_all(mount_point)?;

    let device = partition_device(cfg, part)?;
    let options: Vec<&str> = if !opts.is_empty() {
        opts.to_vec()
    } else if !part.mount_options.is_empty() {
        part.mount_options.iter().map(String::as_str).collect()
    } else {
        vec!["rw"]
    };

    debug!(
        "mounting {} on {} ({})",
        device.display(),
        mount_point.display(),
        options.join(",")
    );
    cfg.mounter.mount(&device, mount_point, "auto", &options)?;
    Ok(())
}

/// No-op when the mount point does not look mounted
pub fn unmount_partition(cfg: &Config, part: &Partition) -> Result<()> {
    match part.mount_point() {
        Some(mount_point) => Ok(unmount_mount_point(cfg, mount_point)?),
        None => Ok(()),
    }
}

fn unmount_mount_point(cfg: &Config, mount_point: &Path) -> elemental_sys::Result<()> {
    // Bind mounts are not detected, good enough for partitions
    if cfg
        .mounter
        .is_likely_not_mount_point(mount_point)
        .unwrap_or(true)
    {
        debug!(
            "not unmounting partition, {} doesn't look like mountpoint",
            mount_point.display()
        );
        return Ok(());
    }
    cfg.mounter.unmount(mount_point)
}

/// Whether the partition's mount point is currently mounted.
///
/// A partition without mount point is never mounted. Bind mounts are not
/// told apart from the real device.
pub fn is_mounted(cfg: &Config, part: Option<&Partition>) -> Result<bool> {
    let part = part.ok_or(DeployError::MissingPartition)?;
    let Some(mount_point) = part.mount_point() else {
        return Ok(false);
    };
    let not_mounted = cfg.mounter.is_likely_not_mount_point(mount_point)?;
    Ok(!not_mounted)
}

/// Makes `part` writable and returns how to restore its previous state:
/// nothing when it was already mounted read-write, a read-only remount when
/// it was mounted read-only, and a full unmount when it was not mounted.
pub fn mount_rw_partition<'a>(cfg: &'a Config, part: &'a Partition) -> Result<Cleaner<'a>> {
    if !is_mounted(cfg, Some(part))? {
        mount_partition(cfg, part, &["rw"])?;
        return Ok(Box::new(move || unmount_partition(cfg, part)));
    }

    let mount_point = part
        .mount_point()
        .ok_or_else(|| DeployError::NoMountPoint(part.name.clone()))?;
    let entries = cfg.mounter.list()?;
    let entry = match find_mount(&entries, mount_point) {
        Some(entry) => entry,
        // The mount table only knows resolved paths
        None => fs::canonicalize(mount_point)
            .ok()
            .and_then(|resolved| find_mount(&entries, &resolved))
            .ok_or_else(|| DeployError::NotInMountTable(mount_point.to_path_buf()))?,
    };
    if !entry.is_read_only() {
        debug!("{} already mounted read-write", mount_point.display());
        return Ok(Box::new(|| -> Result<()> { Ok(()) }));
    }

    let source = PathBuf::from(&entry.source);
    let target = entry.mount_point.clone();
    info!("remounting {} read-write", target.display());
    cfg.mounter
        .mount(&source, &target, "auto", &["remount", "rw"])?;

    Ok(Box::new(move || -> Result<()> {
        debug!("remounting {} read-only", target.display());
        cfg.mounter
            .mount(&source, &target, "auto", &["remount", "ro"])?;
        Ok(())
    }))
}

fn partition_device(cfg: &Config, part: &Partition) -> Result<PathBuf> {
    if let Some(path) = &part.path {
        return Ok(path.clone());
    }
    let device = get_device_by_label(
        cfg.runner.as_ref(),
        &part.filesystem_label,
        LABEL_LOOKUP_TRIES,
        cfg.retry_interval,
    )?;
    Ok(device)
}
