// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::{default_platform, default_squashfs_options};
use crate::install::InstallSettings;

/// Deployment settings as read from the TOML configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// `os/arch` pair used to pick an image out of a multi-platform index
    pub platform: String,
    /// Verify OCI images with cosign before extracting them
    pub cosign: bool,
    /// Public key for cosign, keyless verification when unset
    pub cosign_key: Option<String>,
    /// Resolve OCI references against the local image store
    pub local_images: bool,
    pub tmp_dir: Option<PathBuf>,
    pub squashfs_options: Vec<String>,
    /// Deadline for every external command, no deadline when unset
    pub command_timeout_secs: Option<u64>,
    pub log_file: Option<PathBuf>,
    pub debug: bool,
    pub install: InstallSettings,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            cosign: false,
            cosign_key: None,
            local_images: false,
            tmp_dir: None,
            squashfs_options: default_squashfs_options(),
            command_timeout_secs: None,
            log_file: None,
            debug: false,
            install: InstallSettings::default(),
        }
    }
}
