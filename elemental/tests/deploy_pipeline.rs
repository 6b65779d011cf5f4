// SPDX-License-Identifier: GPL-3.0-only

//! Deployment flows driven through the public API against fake host collaborators

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use elemental::{
    Config, DeployError, create_image_from_tree, deploy_image, dump_source, is_mounted,
    mount_partitions, mount_rw_partition, unmount_partitions,
};
use elemental_sys::testing::{FakeExtractor, FakeMounter, FakeRunner, FakeVerifier};
use elemental_types::{DeploySettings, Image, ImageSource, Partition};

struct Host {
    runner: Arc<FakeRunner>,
    mounter: Arc<FakeMounter>,
    extractor: Arc<FakeExtractor>,
    verifier: Arc<FakeVerifier>,
    config: Config,
    dir: tempfile::TempDir,
}

fn host(settings: DeploySettings, verifier: FakeVerifier) -> Host {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    let mounter = Arc::new(FakeMounter::new());
    let extractor = Arc::new(FakeExtractor::new().with_file("usr/lib/os-release", b"ID=sl\n"));
    let verifier = Arc::new(verifier);

    let config = Config::new(DeploySettings {
        tmp_dir: Some(dir.path().join("tmp")),
        ..settings
    })
    .with_runner(runner.clone())
    .with_mounter(mounter.clone())
    .with_extractor(extractor.clone())
    .with_verifier(verifier.clone())
    .with_retry_interval(Duration::ZERO)
    .with_image_source_dir(dir.path().join("imgsrc"));

    runner.respond("losetup --show -f", "/dev/loop1\n");
    Host {
        runner,
        mounter,
        extractor,
        verifier,
        config,
        dir,
    }
}

fn labeled(name: &str, label: &str, mount_point: PathBuf) -> Partition {
    Partition {
        name: name.to_string(),
        fs: Some("ext4".to_string()),
        filesystem_label: label.to_string(),
        mount_point: Some(mount_point),
        ..Default::default()
    }
}

fn tmp_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir.join("tmp")).unwrap().next().is_none()
}

#[test]
fn recovery_squashfs_is_built_from_a_signed_image() {
    let settings = DeploySettings {
        cosign: true,
        ..Default::default()
    };
    let host = host(settings, FakeVerifier::accepting());
    let mut recovery = Image {
        label: "COS_SYSTEM".to_string(),
        file: host.dir.path().join("recovery/cOS/recovery.squashfs"),
        fs: "squashfs".to_string(),
        mount_point: host.dir.path().join("transition"),
        source: ImageSource::oci("registry.org/elemental/os:v2"),
        ..Default::default()
    };

    deploy_image(&host.config, &mut recovery).unwrap();

    assert_eq!(host.verifier.calls().len(), 1);
    assert_eq!(recovery.source.digest(), Some("sha256:fakedigest"));
    assert!(host.runner.called("mksquashfs"));
    assert!(
        host.runner
            .calls()
            .iter()
            .any(|call| call.ends_with("recovery.squashfs -b 1024k"))
    );
    assert!(host.mounter.calls().is_empty());
    assert!(tmp_is_empty(host.dir.path()));
}

#[test]
fn unsigned_image_is_never_extracted() {
    let settings = DeploySettings {
        cosign: true,
        ..Default::default()
    };
    let host = host(settings, FakeVerifier::rejecting());
    let mut active = Image {
        label: "COS_ACTIVE".to_string(),
        file: host.dir.path().join("state/cOS/active.img"),
        fs: "ext2".to_string(),
        mount_point: host.dir.path().join("active"),
        source: ImageSource::oci("registry.org/elemental/os:v2"),
        ..Default::default()
    };

    let err = deploy_image(&host.config, &mut active).unwrap_err();

    assert!(matches!(err, DeployError::Verification { .. }));
    assert!(host.extractor.calls().is_empty());
    assert!(!active.file.exists());
    assert!(!host.runner.called("mkfs"));
    assert!(tmp_is_empty(host.dir.path()));
}

#[test]
fn dumped_tree_can_be_preloaded_into_an_image() {
    let host = host(DeploySettings::default(), FakeVerifier::accepting());
    let tree = host.dir.path().join("tree");
    let mut source = ImageSource::oci("registry.org/elemental/os:v2");

    dump_source(&host.config, &tree, &mut source).unwrap();
    assert!(tree.join("usr/lib/os-release").is_file());
    assert!(tree.join("proc").is_dir());

    let mut img = Image {
        label: "COS_ACTIVE".to_string(),
        file: host.dir.path().join("active.img"),
        fs: "ext4".to_string(),
        size: 32,
        mount_point: host.dir.path().join("active"),
        ..Default::default()
    };
    create_image_from_tree(&host.config, &mut img, &tree, true, Vec::new()).unwrap();

    assert!(host.runner.called(&format!(
        "mkfs.ext4 -L COS_ACTIVE -d {} {}",
        tree.display(),
        img.file.display()
    )));
    assert!(!host.runner.called("losetup"));
}

#[test]
fn partitions_mount_by_label_and_become_writable() {
    let host = host(DeploySettings::default(), FakeVerifier::accepting());
    host.runner.respond("blkid --label COS_STATE", "/dev/vda4\n");
    host.runner.respond("blkid --label COS_OEM", "/dev/vda2\n");

    let state = labeled("p.state", "COS_STATE", host.dir.path().join("run/state"));
    let oem = labeled("p.oem", "COS_OEM", host.dir.path().join("run/oem"));
    let parts = [state, oem];

    mount_partitions(&host.config, parts.iter(), &["ro"]).unwrap();
    assert!(is_mounted(&host.config, Some(&parts[0])).unwrap());
    assert!(is_mounted(&host.config, Some(&parts[1])).unwrap());

    let undo = mount_rw_partition(&host.config, &parts[0]).unwrap();
    undo().unwrap();

    unmount_partitions(&host.config, parts.iter()).unwrap();
    assert!(host.mounter.mounted().is_empty());
}

#[test]
fn unmount_reports_every_busy_mount_point() {
    let host = host(DeploySettings::default(), FakeVerifier::accepting());
    let state = labeled("p.state", "COS_STATE", host.dir.path().join("run/state"));
    let oem = labeled("p.oem", "COS_OEM", host.dir.path().join("run/oem"));
    host.mounter
        .add_mount("/dev/vda4", state.mount_point.clone().unwrap(), &["rw"]);
    host.mounter
        .add_mount("/dev/vda2", oem.mount_point.clone().unwrap(), &["rw"]);
    host.mounter.fail_unmount_on(state.mount_point.clone().unwrap());
    host.mounter.fail_unmount_on(oem.mount_point.clone().unwrap());

    let err = unmount_partitions(&host.config, [&state, &oem]).unwrap_err();

    let message = err.to_string();
    assert!(message.contains("run/state"));
    assert!(message.contains("run/oem"));
    assert!(matches!(err, DeployError::UnmountFailures(ref failures) if failures.len() == 2));
}
