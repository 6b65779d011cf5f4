// SPDX-License-Identifier: GPL-3.0-only

//! Host helpers around a deployment: boot mode, ISO sources, cloud-config,
//! SELinux labels and device teardown

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use elemental_sys::command_exists;
use elemental_sys::fsutil::{copy_file, temp_dir};
use elemental_types::ImageSource;
use elemental_types::constants::{
    ACTIVE_MODE, ISO_ROOT_FILE, PASSIVE_MODE, RECOVERY_MODE, SELINUX_TARGETED_CONTEXT_FILE,
    SELINUX_TARGETED_POLICY_DIR,
};
use tracing::{debug, info, warn};

use crate::cleanstack::Cleaner;
use crate::config::Config;
use crate::error::{DeployError, Result};

/// First file name used for copied cloud-config files; later ones count up
const CLOUD_CONFIG_FIRST: usize = 90;

/// What the running system booted into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Active,
    Passive,
    Recovery,
    Unknown,
}

/// Reads the boot mode sentinel files below `root`. Only their presence counts.
pub fn boot_state(root: &Path) -> BootState {
    if root.join(ACTIVE_MODE).exists() {
        BootState::Active
    } else if root.join(PASSIVE_MODE).exists() {
        BootState::Passive
    } else if root.join(RECOVERY_MODE).exists() {
        BootState::Recovery
    } else {
        BootState::Unknown
    }
}

/// Configured scratch directory, the system one otherwise
pub fn resolve_temp_dir(cfg: &Config) -> PathBuf {
    cfg.settings
        .tmp_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir)
}

/// Loop mounts a live ISO read-only and returns its root filesystem image as
/// a file source, along with the cleaner that unmounts it again
pub fn mount_iso_source<'a>(cfg: &'a Config, iso: &Path) -> Result<(ImageSource, Cleaner<'a>)> {
    if !iso.is_file() {
        return Err(DeployError::InvalidIso {
            path: iso.to_path_buf(),
            reason: "no such file".to_string(),
        });
    }

    let mount_point = temp_dir(Some(&resolve_temp_dir(cfg)), "elemental-iso-")?.keep();
    info!("mounting iso {} into {}", iso.display(), mount_point.display());
    if let Err(err) = cfg
        .mounter
        .mount(iso, &mount_point, "auto", &["loop", "ro"])
    {
        let _ = fs::remove_dir(&mount_point);
        return Err(err.into());
    }

    let rootfs = mount_point.join(ISO_ROOT_FILE);
    if !rootfs.exists() {
        if let Err(err) = cfg.mounter.unmount(&mount_point) {
            warn!("failed to unmount {}: {err}", mount_point.display());
        } else {
            let _ = fs::remove_dir(&mount_point);
        }
        return Err(DeployError::InvalidIso {
            path: iso.to_path_buf(),
            reason: format!("{ISO_ROOT_FILE} not found"),
        });
    }

    let cleaner: Cleaner<'a> = Box::new(move || -> Result<()> {
        cfg.mounter.unmount(&mount_point)?;
        fs::remove_dir(&mount_point)?;
        Ok(())
    });
    Ok((ImageSource::file(rootfs), cleaner))
}

/// Copies cloud-config files into `target_dir` as `90_custom.yaml`,
/// `91_custom.yaml` and so on, readable by root only
pub fn copy_cloud_config(sources: &[PathBuf], target_dir: &Path) -> Result<()> {
    for (index, source) in sources.iter().enumerate() {
        let target = target_dir.join(format!("{}_custom.yaml", CLOUD_CONFIG_FIRST + index));
        info!(
            "copying cloud config file {} to {}",
            source.display(),
            target.display()
        );
        copy_file(source, &target)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Restores SELinux file labels of the tree at `root` with `setfiles`.
///
/// Does nothing without `setfiles` or without a targeted policy in the tree.
/// Relabel failures are only returned with `raise_error`.
pub fn selinux_relabel(cfg: &Config, root: &Path, raise_error: bool) -> Result<()> {
    let context = root.join(SELINUX_TARGETED_CONTEXT_FILE);
    let Some(policy) = latest_policy(&root.join(SELINUX_TARGETED_POLICY_DIR)) else {
        debug!("no SELinux policy below {}, skipping relabel", root.display());
        return Ok(());
    };
    if !context.exists() || !command_exists("setfiles") {
        debug!("no SELinux file contexts or setfiles, skipping relabel");
        return Ok(());
    }

    let args = setfiles_args(root, &policy, &context);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match cfg.runner.run("setfiles", &args) {
        Ok(_) => Ok(()),
        Err(err) if raise_error => Err(err.into()),
        Err(err) => {
            warn!("SELinux relabel of {} failed: {err}", root.display());
            Ok(())
        }
    }
}

fn setfiles_args(root: &Path, policy: &Path, context: &Path) -> Vec<String> {
    let mut args = vec!["-c".to_string(), policy.display().to_string()];
    if root == Path::new("/") {
        for pseudo in ["/dev", "/proc", "/sys"] {
            args.extend(["-e".to_string(), pseudo.to_string()]);
        }
        args.extend([
            "-F".to_string(),
            context.display().to_string(),
            "/".to_string(),
        ]);
    } else {
        let root = root.display().to_string();
        args.extend([
            "-F".to_string(),
            "-r".to_string(),
            root.clone(),
            context.display().to_string(),
            root,
        ]);
    }
    args
}

/// Highest numbered `policy.N` file in `dir`
fn latest_policy(dir: &Path) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let version: u32 = name.to_str()?.strip_prefix("policy.")?.parse().ok()?;
            Some((version, entry.path()))
        })
        .max_by_key(|(version, _)| *version)
        .map(|(_, path)| path)
}

/// Tears down LVM and device-mapper devices so their disks can be repartitioned
pub fn deactivate_devices(cfg: &Config) -> Result<()> {
    cfg.runner.run(
        "blkdeactivate",
        &[
            "--lvmoptions",
            "retry,wholevg",
            "--dmoptions",
            "force,retry",
            "--errors",
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fakes;
    use elemental_sys::Mounter;
    use elemental_sys::MountEntry;
    use elemental_sys::testing::FakeMounter;
    use std::sync::Arc;

    #[test]
    fn boot_state_follows_sentinel_files() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(boot_state(root.path()), BootState::Unknown);

        fs::create_dir_all(root.path().join("run/cos")).unwrap();
        fs::write(root.path().join(RECOVERY_MODE), b"").unwrap();
        assert_eq!(boot_state(root.path()), BootState::Recovery);

        fs::write(root.path().join(PASSIVE_MODE), b"").unwrap();
        assert_eq!(boot_state(root.path()), BootState::Passive);
    }

    #[test]
    fn cloud_configs_are_numbered_and_private() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.yaml");
        let second = dir.path().join("second.yaml");
        fs::write(&first, "#cloud-config\nhostname: one\n").unwrap();
        fs::write(&second, "#cloud-config\nhostname: two\n").unwrap();

        let oem = dir.path().join("oem");
        copy_cloud_config(&[first, second], &oem).unwrap();

        let copied = fs::read_to_string(oem.join("90_custom.yaml")).unwrap();
        assert!(copied.contains("hostname: one"));
        assert!(oem.join("91_custom.yaml").exists());
        let mode = fs::metadata(oem.join("90_custom.yaml"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn relabel_arguments_for_the_running_root() {
        let args = setfiles_args(
            Path::new("/"),
            Path::new("/etc/selinux/targeted/policy/policy.31"),
            Path::new("/etc/selinux/targeted/contexts/files/file_contexts"),
        );
        assert_eq!(
            args,
            vec![
                "-c",
                "/etc/selinux/targeted/policy/policy.31",
                "-e",
                "/dev",
                "-e",
                "/proc",
                "-e",
                "/sys",
                "-F",
                "/etc/selinux/targeted/contexts/files/file_contexts",
                "/",
            ]
        );
    }

    #[test]
    fn relabel_arguments_for_a_tree() {
        let args = setfiles_args(
            Path::new("/mnt/root"),
            Path::new("/mnt/root/policy.31"),
            Path::new("/mnt/root/file_contexts"),
        );
        assert_eq!(
            args,
            vec![
                "-c",
                "/mnt/root/policy.31",
                "-F",
                "-r",
                "/mnt/root",
                "/mnt/root/file_contexts",
                "/mnt/root",
            ]
        );
    }

    #[test]
    fn picks_the_newest_policy() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["policy.31", "policy.33", "policy.4", "README"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(latest_policy(dir.path()), Some(dir.path().join("policy.33")));
    }

    #[test]
    fn relabel_skips_trees_without_policy() {
        let fakes = Fakes::new();
        let root = tempfile::tempdir().unwrap();
        selinux_relabel(&fakes.config, root.path(), true).unwrap();
        assert!(fakes.runner.calls().is_empty());
    }

    #[test]
    fn deactivates_lvm_and_dm_devices() {
        let fakes = Fakes::new();
        deactivate_devices(&fakes.config).unwrap();
        assert_eq!(
            fakes.runner.calls(),
            vec!["blkdeactivate --lvmoptions retry,wholevg --dmoptions force,retry --errors"]
        );
    }

    /// Pretends every mounted ISO carries a root filesystem image
    struct LiveIsoMounter(FakeMounter);

    impl Mounter for LiveIsoMounter {
        fn mount(
            &self,
            source: &Path,
            target: &Path,
            fs_type: &str,
            options: &[&str],
        ) -> elemental_sys::Result<()> {
            self.0.mount(source, target, fs_type, options)?;
            fs::write(target.join(ISO_ROOT_FILE), b"hsqs")?;
            Ok(())
        }

        fn unmount(&self, target: &Path) -> elemental_sys::Result<()> {
            self.0.unmount(target)?;
            fs::remove_file(target.join(ISO_ROOT_FILE))?;
            Ok(())
        }

        fn is_likely_not_mount_point(&self, path: &Path) -> elemental_sys::Result<bool> {
            self.0.is_likely_not_mount_point(path)
        }

        fn list(&self) -> elemental_sys::Result<Vec<MountEntry>> {
            self.0.list()
        }
    }

    #[test]
    fn iso_root_image_becomes_a_file_source() {
        let fakes = Fakes::new();
        let config = fakes
            .config
            .clone()
            .with_mounter(Arc::new(LiveIsoMounter(FakeMounter::new())));
        let iso = fakes.scratch.path().join("live.iso");
        fs::write(&iso, b"iso").unwrap();

        let (source, cleaner) = mount_iso_source(&config, &iso).unwrap();
        let ImageSource::File(rootfs) = &source else {
            panic!("expected a file source, got {source:?}");
        };
        assert!(rootfs.ends_with(ISO_ROOT_FILE));
        assert!(rootfs.exists());

        cleaner().unwrap();
        assert!(!rootfs.parent().unwrap().exists());
    }

    #[test]
    fn iso_without_root_image_is_rejected_and_unmounted() {
        let fakes = Fakes::new();
        let iso = fakes.scratch.path().join("other.iso");
        fs::write(&iso, b"iso").unwrap();

        let err = match mount_iso_source(&fakes.config, &iso) {
            Err(err) => err,
            Ok(_) => panic!("ISO without root image accepted"),
        };
        assert!(matches!(err, DeployError::InvalidIso { .. }));
        assert!(fakes.mounter.mounted().is_empty());
    }

    #[test]
    fn missing_iso_is_rejected_before_mounting() {
        let fakes = Fakes::new();
        let missing = fakes.scratch.path().join("missing.iso");
        assert!(mount_iso_source(&fakes.config, &missing).is_err());
        assert!(fakes.mounter.calls().is_empty());
    }
}
