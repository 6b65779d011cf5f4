// SPDX-License-Identifier: GPL-3.0-only

//! End to end installation onto a target disk

use std::fs;
use std::path::{Path, PathBuf};

use elemental_sys::device::get_device_by_label;
use elemental_sys::fsutil::{copy_file, temp_dir};
use elemental_types::constants::{
    ACTIVE_IMG_FILE, ACTIVE_LABEL, LINUX_IMG_FS, OEM_PART_NAME, PASSIVE_IMG_FILE, PASSIVE_LABEL,
    RECOVERY_IMG_FILE, RECOVERY_PART_NAME, RECOVERY_SQUASH_FILE, STATE_PART_NAME, SYSTEM_LABEL,
};
use elemental_types::{ElementalPartitions, Image, ImageSource, InstallSpec, Partition};
use tracing::{error, info, warn};

use crate::cleanstack::CleanStack;
use crate::config::Config;
use crate::error::{DeployError, Result};
use crate::images::{
    copy_file_image, deploy_image, mount_filesystem_image, unmount_filesystem_image,
};
use crate::partitions::{mount_partitions, partition_and_format_device, unmount_partitions};
use crate::system::{
    copy_cloud_config, deactivate_devices, mount_iso_source, resolve_temp_dir, selinux_relabel,
};

/// Directory holding the system images inside the state and recovery partitions
const IMAGES_DIR: &str = "cOS";

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub source: ImageSource,
    /// Live ISO whose root filesystem is installed instead of `source`
    pub iso: Option<PathBuf>,
    pub cloud_init: Vec<PathBuf>,
    /// Size of the system images in MiB, 0 sizes them from the source tree
    pub image_size: u32,
    /// Install over an existing system
    pub force: bool,
}

/// Wipes the target disk and installs the system on it.
///
/// Refuses to run while an active or passive system is found on the host,
/// unless `opts.force` is set. The active image is built from the source and
/// passive is a copy of it. Recovery is the `recovery.squashfs` shipped next
/// to a file source when there is one, another copy of active otherwise.
/// Partitions are unmounted again whatever the outcome.
pub fn install(cfg: &Config, spec: &mut InstallSpec, opts: &InstallOptions) -> Result<()> {
    let mut stack = CleanStack::new();
    let source = match &opts.iso {
        Some(iso) => {
            let (source, cleaner) = mount_iso_source(cfg, iso)?;
            stack.push_cleaner(cleaner);
            source
        }
        None => opts.source.clone(),
    };

    let result = install_from(cfg, spec, source, opts);
    stack.cleanup(result)
}

fn install_from(
    cfg: &Config,
    spec: &mut InstallSpec,
    source: ImageSource,
    opts: &InstallOptions,
) -> Result<()> {
    if source.is_empty() {
        return Err(DeployError::UnknownSourceType("no source to install".to_string()));
    }
    info!("installing {source} to {}", spec.target.display());

    check_existing_install(cfg, opts.force)?;
    deactivate_devices(cfg)?;
    partition_and_format_device(cfg, spec)?;

    let spec: &InstallSpec = spec;
    mount_partitions(
        cfg,
        spec.partitions.iter().chain(spec.extra_partitions.iter()),
        &[],
    )?;

    let mut stack = CleanStack::new();
    stack.push(|| {
        unmount_partitions(
            cfg,
            spec.partitions.iter().chain(spec.extra_partitions.iter()),
        )
    });
    let result = deploy_system(cfg, &spec.partitions, source, opts);
    stack.cleanup(result)
}

fn deploy_system(
    cfg: &Config,
    parts: &ElementalPartitions,
    source: ImageSource,
    opts: &InstallOptions,
) -> Result<()> {
    let bundled_recovery = bundled_recovery(&source);
    let state_dir = mount_point_of(parts.state.as_ref(), STATE_PART_NAME)?;
    let recovery_dir = mount_point_of(parts.recovery.as_ref(), RECOVERY_PART_NAME)?;

    let mount_point = temp_dir(Some(&resolve_temp_dir(cfg)), "elemental-active-")?.keep();
    let mut stack = CleanStack::new();
    let scratch = mount_point.clone();
    stack.push(move || {
        if let Err(err) = fs::remove_dir(&scratch) {
            warn!("leaving {} behind: {err}", scratch.display());
        }
        Ok(())
    });

    let mut active = Image {
        label: ACTIVE_LABEL.to_string(),
        file: state_dir.join(IMAGES_DIR).join(ACTIVE_IMG_FILE),
        fs: LINUX_IMG_FS.to_string(),
        size: opts.image_size,
        mount_point,
        source,
        loop_device: None,
    };

    let result = populate(
        cfg,
        parts,
        &mut active,
        state_dir,
        recovery_dir,
        bundled_recovery.as_deref(),
        &opts.cloud_init,
    );
    stack.cleanup(result)
}

fn populate(
    cfg: &Config,
    parts: &ElementalPartitions,
    active: &mut Image,
    state_dir: &Path,
    recovery_dir: &Path,
    bundled_recovery: Option<&Path>,
    cloud_init: &[PathBuf],
) -> Result<()> {
    deploy_image(cfg, active)?;

    mount_filesystem_image(cfg, active)?;
    let relabeled = selinux_relabel(cfg, &active.mount_point, false);
    let unmounted = unmount_filesystem_image(cfg, active);
    relabeled.and(unmounted)?;

    if !cloud_init.is_empty() {
        let oem_dir = mount_point_of(parts.oem.as_ref(), OEM_PART_NAME)?;
        copy_cloud_config(cloud_init, oem_dir)?;
    }

    copy_file_image(
        cfg,
        &copy_of(active, PASSIVE_LABEL, state_dir.join(IMAGES_DIR).join(PASSIVE_IMG_FILE)),
    )?;

    let recovery_images = recovery_dir.join(IMAGES_DIR);
    match bundled_recovery {
        Some(squashfs) => {
            let target = recovery_images.join(RECOVERY_SQUASH_FILE);
            info!("copying recovery {} to {}", squashfs.display(), target.display());
            copy_file(squashfs, &target)?;
        }
        None => copy_file_image(
            cfg,
            &copy_of(active, SYSTEM_LABEL, recovery_images.join(RECOVERY_IMG_FILE)),
        )?,
    }

    info!("installation finished, active image {}", active.file.display());
    Ok(())
}

fn copy_of(active: &Image, label: &str, file: PathBuf) -> Image {
    Image {
        label: label.to_string(),
        file,
        fs: active.fs.clone(),
        source: ImageSource::file(&active.file),
        ..Default::default()
    }
}

/// Recovery squashfs shipped next to a file source, as live ISOs do
fn bundled_recovery(source: &ImageSource) -> Option<PathBuf> {
    let ImageSource::File(file) = source else {
        return None;
    };
    let squashfs = file.parent()?.join(RECOVERY_SQUASH_FILE);
    squashfs.is_file().then_some(squashfs)
}

/// Fails when a device labeled as active or passive system is present
fn check_existing_install(cfg: &Config, force: bool) -> Result<()> {
    for label in [ACTIVE_LABEL, PASSIVE_LABEL] {
        let Ok(device) = get_device_by_label(cfg.runner.as_ref(), label, 1, cfg.retry_interval)
        else {
            continue;
        };
        if force {
            info!("overwriting existing system found on {}", device.display());
            return Ok(());
        }
        error!("existing system found on {}", device.display());
        return Err(DeployError::ExistingInstallation {
            label: label.to_string(),
            device,
        });
    }
    Ok(())
}

fn mount_point_of<'p>(part: Option<&'p Partition>, name: &str) -> Result<&'p Path> {
    part.and_then(Partition::mount_point)
        .ok_or_else(|| DeployError::NoMountPoint(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Fakes, simulate_parted};
    use elemental_sys::testing::MountCall;
    use elemental_types::constants::{LINUX_FS, OEM_LABEL, RECOVERY_LABEL, STATE_LABEL};
    use elemental_types::{Firmware, InstallSettings, PartitionTable};

    struct Target {
        fakes: Fakes,
        spec: InstallSpec,
        source: PathBuf,
    }

    fn target() -> Target {
        let fakes = Fakes::new();
        let root = fakes.scratch.path().to_path_buf();
        simulate_parted(&fakes.runner, 209715200);
        fakes.runner.respond("losetup --show -f", "/dev/loop0\n");

        let device = root.join("vda");
        fs::write(&device, b"").unwrap();
        for number in 1..=5 {
            fs::write(root.join(format!("vda{number}")), b"").unwrap();
        }

        let linux = |name: &str, label: &str, size: u32| Partition {
            name: name.to_string(),
            fs: Some(LINUX_FS.to_string()),
            filesystem_label: label.to_string(),
            size,
            mount_point: Some(root.join("run").join(name)),
            ..Default::default()
        };
        let settings = InstallSettings {
            firmware: Firmware::Bios,
            part_table: PartitionTable::Gpt,
            partitions: vec![
                linux(OEM_PART_NAME, OEM_LABEL, 64),
                linux(RECOVERY_PART_NAME, RECOVERY_LABEL, 2048),
                linux(STATE_PART_NAME, STATE_LABEL, 4096),
            ],
            ..Default::default()
        };
        let spec = InstallSpec::new(&device, &settings).unwrap();

        let source = root.join("rootfs");
        fs::create_dir_all(source.join("etc")).unwrap();
        fs::write(source.join("etc/os-release"), b"NAME=elemental\n").unwrap();

        Target {
            fakes,
            spec,
            source,
        }
    }

    #[test]
    fn installs_active_passive_and_recovery_images() {
        let Target {
            fakes,
            mut spec,
            source,
        } = target();
        let cloud = fakes.scratch.path().join("cloud.yaml");
        fs::write(&cloud, b"#cloud-config\n").unwrap();
        let opts = InstallOptions {
            source: ImageSource::dir(&source),
            cloud_init: vec![cloud],
            image_size: 8,
            ..Default::default()
        };

        install(&fakes.config, &mut spec, &opts).unwrap();

        let state_dir = spec.partitions.state.as_ref().unwrap().mount_point().unwrap();
        let recovery_dir = spec.partitions.recovery.as_ref().unwrap().mount_point().unwrap();
        let oem_dir = spec.partitions.oem.as_ref().unwrap().mount_point().unwrap();
        let active = state_dir.join("cOS/active.img");

        assert!(fakes.runner.called("blkdeactivate"));
        assert!(fakes.runner.called(&format!(
            "mkfs.ext2 -L COS_ACTIVE {}",
            active.display()
        )));
        assert!(state_dir.join("cOS/passive.img").is_file());
        assert!(recovery_dir.join("cOS/recovery.img").is_file());
        assert!(fakes.runner.called(&format!(
            "tune2fs -L COS_PASSIVE {}",
            state_dir.join("cOS/passive.img").display()
        )));
        assert!(fakes.runner.called(&format!(
            "tune2fs -L COS_SYSTEM {}",
            recovery_dir.join("cOS/recovery.img").display()
        )));
        assert!(oem_dir.join("90_custom.yaml").is_file());
        assert!(fakes.mounter.mounted().is_empty());
    }

    #[test]
    fn recovery_squashfs_shipped_with_the_source_is_installed() {
        let Target {
            fakes, mut spec, ..
        } = target();
        let live = fakes.scratch.path().join("live");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("rootfs.squashfs"), b"rootfs").unwrap();
        fs::write(live.join("recovery.squashfs"), b"recovery").unwrap();
        let opts = InstallOptions {
            source: ImageSource::file(live.join("rootfs.squashfs")),
            image_size: 8,
            ..Default::default()
        };

        install(&fakes.config, &mut spec, &opts).unwrap();

        let state_dir = spec.partitions.state.as_ref().unwrap().mount_point().unwrap();
        let recovery_dir = spec.partitions.recovery.as_ref().unwrap().mount_point().unwrap();
        assert_eq!(
            fs::read(recovery_dir.join("cOS/recovery.squashfs")).unwrap(),
            b"recovery"
        );
        assert!(!recovery_dir.join("cOS/recovery.img").exists());
        assert!(!fakes.runner.called("tune2fs -L COS_SYSTEM"));
        assert!(fakes.runner.called(&format!(
            "tune2fs -L COS_PASSIVE {}",
            state_dir.join("cOS/passive.img").display()
        )));
        assert!(fakes.mounter.mounted().is_empty());
    }

    #[test]
    fn existing_system_is_kept_without_force() {
        let Target {
            fakes,
            mut spec,
            source,
        } = target();
        fakes.runner.respond("blkid --label COS_ACTIVE", "/dev/vda3\n");
        let opts = InstallOptions {
            source: ImageSource::dir(&source),
            ..Default::default()
        };

        let err = install(&fakes.config, &mut spec, &opts).unwrap_err();

        assert!(matches!(
            err,
            DeployError::ExistingInstallation { ref label, ref device }
                if label == ACTIVE_LABEL && device == Path::new("/dev/vda3")
        ));
        assert!(!fakes.runner.called("blkdeactivate"));
        assert!(!fakes.runner.called("parted"));
        assert!(fakes.mounter.calls().is_empty());
    }

    #[test]
    fn force_installs_over_an_existing_system() {
        let Target {
            fakes,
            mut spec,
            source,
        } = target();
        fakes.runner.respond("blkid --label COS_PASSIVE", "/dev/vda3\n");
        let opts = InstallOptions {
            source: ImageSource::dir(&source),
            image_size: 8,
            force: true,
            ..Default::default()
        };

        install(&fakes.config, &mut spec, &opts).unwrap();
        assert!(fakes.runner.called("parted"));
    }

    #[test]
    fn partitions_are_unmounted_when_deployment_fails() {
        let Target {
            fakes,
            mut spec,
            source,
        } = target();
        fakes.runner.fail("mkfs.ext2", "Failed calling mkfs.ext2");
        let opts = InstallOptions {
            source: ImageSource::dir(&source),
            image_size: 8,
            ..Default::default()
        };

        let err = install(&fakes.config, &mut spec, &opts).unwrap_err();

        assert!(err.to_string().contains("mkfs.ext2"));
        assert!(fakes.mounter.mounted().is_empty());
        let state_dir = spec.partitions.state.as_ref().unwrap().mount_point().unwrap();
        assert!(
            fakes
                .mounter
                .calls()
                .contains(&MountCall::Unmount(state_dir.to_path_buf()))
        );
    }

    #[test]
    fn device_teardown_failure_stops_before_partitioning() {
        let Target {
            fakes,
            mut spec,
            source,
        } = target();
        fakes.runner.fail("blkdeactivate", "device busy");
        let opts = InstallOptions {
            source: ImageSource::dir(&source),
            ..Default::default()
        };

        assert!(install(&fakes.config, &mut spec, &opts).is_err());
        assert!(!fakes.runner.called("parted"));
    }

    #[test]
    fn missing_source_leaves_the_disk_alone() {
        let Target {
            fakes, mut spec, ..
        } = target();

        let err = install(&fakes.config, &mut spec, &InstallOptions::default()).unwrap_err();
        assert!(matches!(err, DeployError::UnknownSourceType(_)));
        assert!(fakes.runner.calls().is_empty());
    }

    #[test]
    fn missing_iso_is_reported() {
        let Target {
            fakes, mut spec, ..
        } = target();
        let opts = InstallOptions {
            iso: Some(fakes.scratch.path().join("missing.iso")),
            ..Default::default()
        };

        let err = install(&fakes.config, &mut spec, &opts).unwrap_err();
        assert!(matches!(err, DeployError::InvalidIso { .. }));
        assert!(!fakes.runner.called("parted"));
    }
}
