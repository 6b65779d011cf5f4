// SPDX-License-Identifier: GPL-3.0-only

//! Block device lookup and loop device handling

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, SysError};
use crate::runner::Runner;

/// Resolves the device carrying the filesystem `label`, letting udev settle
/// between attempts
pub fn get_device_by_label(
    runner: &dyn Runner,
    label: &str,
    attempts: u32,
    interval: Duration,
) -> Result<PathBuf> {
    for attempt in 1..=attempts {
        if let Err(err) = runner.run("udevadm", &["settle"]) {
            warn!("udevadm settle failed: {err}");
        }
        if let Ok(out) = runner.run("blkid", &["--label", label]) {
            let device = String::from_utf8_lossy(&out).trim().to_string();
            if !device.is_empty() {
                return Ok(PathBuf::from(device));
            }
        }
        debug!("no device labeled {label} yet (attempt {attempt}/{attempts})");
        if attempt < attempts {
            thread::sleep(interval);
        }
    }
    Err(SysError::DeviceNotFound(format!("label {label}")))
}

/// Attaches `file` to the first free loop device and returns the device path
pub fn attach_loop(runner: &dyn Runner, file: &Path, read_only: bool) -> Result<PathBuf> {
    let file = file.to_string_lossy().into_owned();
    let mut args = vec!["--show", "-f"];
    if read_only {
        args.push("-r");
    }
    args.push(file.as_str());

    let out = runner.run("losetup", &args)?;
    let device = String::from_utf8_lossy(&out).trim().to_string();
    if device.is_empty() {
        return Err(SysError::DeviceNotFound(format!("loop device for {file}")));
    }
    Ok(PathBuf::from(device))
}

pub fn detach_loop(runner: &dyn Runner, device: &Path) -> Result<()> {
    let device = device.to_string_lossy().into_owned();
    runner.run("losetup", &["-d", device.as_str()])?;
    Ok(())
}
