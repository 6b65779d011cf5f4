// SPDX-License-Identifier: GPL-3.0-only

//! Well-known labels, sizes and paths of an elemental deployment

pub const EFI_LABEL: &str = "COS_GRUB";
pub const ACTIVE_LABEL: &str = "COS_ACTIVE";
pub const PASSIVE_LABEL: &str = "COS_PASSIVE";
pub const SYSTEM_LABEL: &str = "COS_SYSTEM";
pub const RECOVERY_LABEL: &str = "COS_RECOVERY";
pub const STATE_LABEL: &str = "COS_STATE";
pub const PERSISTENT_LABEL: &str = "COS_PERSISTENT";
pub const OEM_LABEL: &str = "COS_OEM";

pub const BIOS_PART_NAME: &str = "p.bios";
pub const EFI_PART_NAME: &str = "p.grub";
pub const OEM_PART_NAME: &str = "p.oem";
pub const RECOVERY_PART_NAME: &str = "p.recovery";
pub const STATE_PART_NAME: &str = "p.state";
pub const PERSISTENT_PART_NAME: &str = "p.persistent";

/// Partition flags understood by parted
pub const ESP_FLAG: &str = "esp";
pub const BIOS_FLAG: &str = "bios_grub";
pub const BOOT_FLAG: &str = "boot";

pub const LINUX_FS: &str = "ext4";
pub const LINUX_IMG_FS: &str = "ext2";
pub const EFI_FS: &str = "vfat";
pub const SQUASHFS: &str = "squashfs";

/// Sizes in MiB
pub const EFI_SIZE: u32 = 64;
pub const OEM_SIZE: u32 = 64;
pub const STATE_SIZE: u32 = 15360;
pub const RECOVERY_SIZE: u32 = 8192;
pub const PERSISTENT_SIZE: u32 = 0;
pub const BIOS_SIZE: u32 = 1;
pub const IMG_SIZE: u32 = 3072;

/// Headroom added to an auto-sized image for filesystem metadata and journal (MiB)
pub const IMG_OVERHEAD_MB: u32 = 256;

pub const EFI_DIR: &str = "/run/cos/efi";
pub const OEM_DIR: &str = "/run/cos/oem";
pub const STATE_DIR: &str = "/run/cos/state";
pub const RECOVERY_DIR: &str = "/run/cos/recovery";
pub const PERSISTENT_DIR: &str = "/run/cos/persistent";

/// Staging mount point used while dumping a file (image) source
pub const IMG_SRC_DIR: &str = "/run/cos/imgsrc";

pub const ACTIVE_IMG_FILE: &str = "active.img";
pub const PASSIVE_IMG_FILE: &str = "passive.img";
pub const RECOVERY_IMG_FILE: &str = "recovery.img";
pub const RECOVERY_SQUASH_FILE: &str = "recovery.squashfs";

/// Root filesystem image expected inside a live ISO
pub const ISO_ROOT_FILE: &str = "rootfs.squashfs";

/// Boot mode sentinel files, relative to the system root. Only existence matters.
pub const ACTIVE_MODE: &str = "run/cos/active_mode";
pub const PASSIVE_MODE: &str = "run/cos/passive_mode";
pub const RECOVERY_MODE: &str = "run/cos/recovery_mode";

/// Paths never copied from a source tree
pub const SYNC_EXCLUDES: &[&str] = &["mnt", "proc", "sys", "dev", "tmp", "host", "run"];

/// Directories every deployed tree must provide
pub const ESSENTIAL_DIRS: &[&str] = &[
    "sys",
    "proc",
    "dev",
    "tmp",
    "run",
    "boot",
    "usr/local",
    "oem",
];

pub const SELINUX_TARGETED_CONTEXT_FILE: &str = "etc/selinux/targeted/contexts/files/file_contexts";
pub const SELINUX_TARGETED_POLICY_DIR: &str = "etc/selinux/targeted/policy";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/elemental/config.toml";

/// Default options handed to mksquashfs
pub fn default_squashfs_options() -> Vec<String> {
    vec!["-b".into(), "1024k".into()]
}

/// Default `os/arch` pair for the running host
pub fn default_platform() -> String {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "amd64",
        "x86" => "386",
        other => other,
    };
    format!("linux/{arch}")
}
