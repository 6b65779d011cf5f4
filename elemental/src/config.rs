// SPDX-License-Identifier: GPL-3.0-only

//! Collaborators and settings shared by every deploy operation

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use elemental_sys::{
    CommandRunner, CosignVerifier, ImageExtractor, Mounter, OciImageExtractor, Runner,
    SignatureVerifier, SystemMounter,
};
use elemental_types::DeploySettings;
use elemental_types::constants::IMG_SRC_DIR;
use tracing::debug;

use crate::error::{DeployError, Result};

/// Attempts made when looking a device up by filesystem label
pub const LABEL_LOOKUP_TRIES: u32 = 5;

/// Everything an operation needs to touch the host, built once and passed by reference
#[derive(Clone)]
pub struct Config {
    pub runner: Arc<dyn Runner>,
    pub mounter: Arc<dyn Mounter>,
    pub extractor: Arc<dyn ImageExtractor>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub settings: DeploySettings,
    /// Pause between device lookups while udev catches up
    pub retry_interval: Duration,
    /// Staging mount point for file sources
    pub image_source_dir: PathBuf,
}

impl Config {
    /// Host collaborators honouring the command deadline of `settings`
    pub fn new(settings: DeploySettings) -> Self {
        let runner =
            CommandRunner::with_timeout(settings.command_timeout_secs.map(Duration::from_secs));
        Self {
            runner: Arc::new(runner.clone()),
            mounter: Arc::new(SystemMounter::new(runner)),
            extractor: Arc::new(OciImageExtractor::new()),
            verifier: Arc::new(CosignVerifier),
            settings,
            retry_interval: Duration::from_secs(1),
            image_source_dir: PathBuf::from(IMG_SRC_DIR),
        }
    }

    /// Reads a TOML settings file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(load_settings(path)?))
    }

    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ImageExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_image_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_source_dir = dir.into();
        self
    }
}

pub fn load_settings(path: &Path) -> Result<DeploySettings> {
    if !path.exists() {
        debug!("no configuration at {}, using defaults", path.display());
        return Ok(DeploySettings::default());
    }
    let contents = fs::read_to_string(path)?;
    toml::from_str(&contents).map_err(|err| DeployError::Config {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}
