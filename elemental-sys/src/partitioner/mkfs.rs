// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use tracing::info;

use crate::error::{Result, SysError};
use crate::runner::Runner;

/// Builds the `mkfs.<fs>` argument list: label flag, custom options, device
pub fn mkfs_args(fs: &str, label: &str, custom: &[&str], device: &str) -> Result<Vec<String>> {
    let label_flag = match fs {
        "ext2" | "ext3" | "ext4" | "xfs" | "btrfs" => "-L",
        "fat" | "vfat" => "-n",
        other => return Err(SysError::UnsupportedFilesystem(other.to_string())),
    };

    let mut args = Vec::with_capacity(custom.len() + 4);
    if !label.is_empty() {
        args.extend([label_flag.to_string(), label.to_string()]);
    }
    if fs == "btrfs" {
        args.push("-f".to_string());
    }
    args.extend(custom.iter().map(|opt| opt.to_string()));
    args.push(device.to_string());
    Ok(args)
}

/// Creates a filesystem on a block device or image file
pub fn format_device(
    runner: &dyn Runner,
    device: &Path,
    fs: &str,
    label: &str,
    opts: &[&str],
) -> Result<()> {
    let device = device.to_string_lossy();
    let args = mkfs_args(fs, label, opts, &device)?;
    info!(device = %device, fs, label, "formatting");

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    runner.run(&format!("mkfs.{fs}"), &arg_refs)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext_and_xfs_take_dash_capital_l() {
        assert_eq!(
            mkfs_args("ext4", "COS_STATE", &[], "/dev/sda2").unwrap(),
            vec!["-L", "COS_STATE", "/dev/sda2"]
        );
        assert_eq!(
            mkfs_args("xfs", "DATA", &["-m", "crc=1"], "/dev/sda3").unwrap(),
            vec!["-L", "DATA", "-m", "crc=1", "/dev/sda3"]
        );
    }

    #[test]
    fn fat_takes_dash_n() {
        assert_eq!(
            mkfs_args("vfat", "COS_GRUB", &[], "/dev/sda1").unwrap(),
            vec!["-n", "COS_GRUB", "/dev/sda1"]
        );
    }

    #[test]
    fn btrfs_forces_overwrite() {
        assert_eq!(
            mkfs_args("btrfs", "", &[], "/dev/sda4").unwrap(),
            vec!["-f", "/dev/sda4"]
        );
    }

    #[test]
    fn rejects_unknown_filesystems() {
        assert!(matches!(
            mkfs_args("ntfs", "X", &[], "/dev/sda1"),
            Err(SysError::UnsupportedFilesystem(fs)) if fs == "ntfs"
        ));
        assert!(mkfs_args("", "X", &[], "/dev/sda1").is_err());
    }
}
