// SPDX-License-Identifier: GPL-3.0-only

//! In-memory collaborators for unit tests

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cosign::SignatureVerifier;
use crate::error::{Result, SysError};
use crate::extractor::ImageExtractor;
use crate::mounter::Mounter;
use crate::mountinfo::MountEntry;
use crate::runner::{Runner, render};

type Handler = Box<dyn Fn(&str, &[&str]) -> Result<Vec<u8>> + Send + Sync>;

/// Records every command and answers from rules matched on the rendered
/// command line prefix. The most recently added rule wins, unmatched
/// commands succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<String>>,
    rules: Mutex<Vec<(String, Handler)>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, prefix: &str, handler: F) -> &Self
    where
        F: Fn(&str, &[&str]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.rules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((prefix.to_string(), Box::new(handler)));
        self
    }

    pub fn respond(&self, prefix: &str, output: &str) -> &Self {
        let output = output.as_bytes().to_vec();
        self.on(prefix, move |_, _| Ok(output.clone()))
    }

    pub fn fail(&self, prefix: &str, message: &str) -> &Self {
        let message = message.to_string();
        self.on(prefix, move |command, args| {
            Err(SysError::CommandFailed {
                command: render(command, args),
                output: message.clone(),
            })
        })
    }

    /// Rendered command lines in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|call| call.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl Runner for FakeRunner {
    fn run(&self, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        let rendered = render(command, args);
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(rendered.clone());

        let rules = self
            .rules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match rules
            .iter()
            .rev()
            .find(|(prefix, _)| rendered.starts_with(prefix.as_str()))
        {
            Some((_, handler)) => handler(command, args),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount {
        source: PathBuf,
        target: PathBuf,
        fs_type: String,
        options: Vec<String>,
    },
    Unmount(PathBuf),
}

/// Mount table kept in memory
#[derive(Default)]
pub struct FakeMounter {
    mounts: Mutex<Vec<MountEntry>>,
    calls: Mutex<Vec<MountCall>>,
    fail_mount: Mutex<HashSet<PathBuf>>,
    fail_unmount: Mutex<HashSet<PathBuf>>,
    fail_check: Mutex<HashSet<PathBuf>>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any mount onto `target` fails
    pub fn fail_mount_on(&self, target: impl Into<PathBuf>) -> &Self {
        lock(&self.fail_mount).insert(target.into());
        self
    }

    /// Any unmount of `target` fails
    pub fn fail_unmount_on(&self, target: impl Into<PathBuf>) -> &Self {
        lock(&self.fail_unmount).insert(target.into());
        self
    }

    /// Mount point checks of `target` fail
    pub fn fail_check_on(&self, target: impl Into<PathBuf>) -> &Self {
        lock(&self.fail_check).insert(target.into());
        self
    }

    /// Seeds the mount table as if `source` was already mounted
    pub fn add_mount(&self, source: &str, target: impl Into<PathBuf>, options: &[&str]) {
        lock(&self.mounts).push(MountEntry {
            source: source.to_string(),
            mount_point: target.into(),
            fs_type: "auto".to_string(),
            options: options.iter().map(|opt| opt.to_string()).collect(),
        });
    }

    pub fn calls(&self) -> Vec<MountCall> {
        lock(&self.calls).clone()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        lock(&self.mounts)
            .iter()
            .map(|entry| entry.mount_point.clone())
            .collect()
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        lock(&self.mounts)
            .iter()
            .any(|entry| entry.mount_point == target)
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    a == b
        || matches!(
            (fs::canonicalize(a), fs::canonicalize(b)),
            (Ok(a), Ok(b)) if a == b
        )
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Mounter for FakeMounter {
    fn mount(&self, source: &Path, target: &Path, fs_type: &str, options: &[&str]) -> Result<()> {
        let options: Vec<String> = options.iter().map(|opt| opt.to_string()).collect();
        lock(&self.calls).push(MountCall::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_string(),
            options: options.clone(),
        });

        if lock(&self.fail_mount).contains(target) {
            return Err(SysError::CommandFailed {
                command: format!("mount {} {}", source.display(), target.display()),
                output: "mount failed".to_string(),
            });
        }

        let mut mounts = lock(&self.mounts);
        // A remount changes options of the existing entry
        if options.iter().any(|opt| opt == "remount")
            && let Some(entry) = mounts.iter_mut().rev().find(|e| e.mount_point == target)
        {
            entry.options = options.into_iter().filter(|opt| opt != "remount").collect();
            return Ok(());
        }

        mounts.push(MountEntry {
            source: source.to_string_lossy().into_owned(),
            mount_point: target.to_path_buf(),
            fs_type: fs_type.to_string(),
            options,
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        lock(&self.calls).push(MountCall::Unmount(target.to_path_buf()));

        if lock(&self.fail_unmount).contains(target) {
            return Err(SysError::CommandFailed {
                command: format!("umount {}", target.display()),
                output: "target is busy".to_string(),
            });
        }

        let mut mounts = lock(&self.mounts);
        match mounts.iter().rposition(|entry| entry.mount_point == target) {
            Some(position) => {
                mounts.remove(position);
                Ok(())
            }
            None => Err(SysError::CommandFailed {
                command: format!("umount {}", target.display()),
                output: "not mounted".to_string(),
            }),
        }
    }

    fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool> {
        if lock(&self.fail_check).contains(path) {
            return Err(SysError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("stat {}", path.display()),
            )));
        }
        // Like a device comparison, symlinks resolve to their target
        Ok(!lock(&self.mounts)
            .iter()
            .any(|entry| same_path(&entry.mount_point, path)))
    }

    fn list(&self) -> Result<Vec<MountEntry>> {
        Ok(lock(&self.mounts).clone())
    }
}

/// Writes a fixed set of files into the target instead of pulling an image
pub struct FakeExtractor {
    files: Vec<(PathBuf, Vec<u8>)>,
    digest: String,
    fail: bool,
    calls: Mutex<Vec<(String, PathBuf, String, bool)>>,
}

impl Default for FakeExtractor {
    fn default() -> Self {
        Self {
            files: vec![(PathBuf::from("etc/os-release"), b"NAME=fake\n".to_vec())],
            digest: "sha256:fakedigest".to_string(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: &[u8]) -> Self {
        self.files.push((path.into(), contents.to_vec()));
        self
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// `(reference, target, platform, local)` of every call
    pub fn calls(&self) -> Vec<(String, PathBuf, String, bool)> {
        lock(&self.calls).clone()
    }
}

impl ImageExtractor for FakeExtractor {
    fn extract_image(
        &self,
        reference: &str,
        target: &Path,
        platform: &str,
        local: bool,
    ) -> Result<String> {
        lock(&self.calls).push((
            reference.to_string(),
            target.to_path_buf(),
            platform.to_string(),
            local,
        ));
        if self.fail {
            return Err(SysError::Image(format!("failed to pull {reference}")));
        }
        for (path, contents) in &self.files {
            let dest = target.join(path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(dest, contents)?;
        }
        Ok(self.digest.clone())
    }
}

/// Accepts or rejects every signature
#[derive(Default)]
pub struct FakeVerifier {
    reject: bool,
    calls: Mutex<Vec<(String, Option<String>, bool)>>,
}

impl FakeVerifier {
    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(reference, key, debug)` of every call
    pub fn calls(&self) -> Vec<(String, Option<String>, bool)> {
        lock(&self.calls).clone()
    }
}

impl SignatureVerifier for FakeVerifier {
    fn verify(&self, reference: &str, key: Option<&str>, debug: bool) -> Result<String> {
        lock(&self.calls).push((reference.to_string(), key.map(str::to_string), debug));
        if self.reject {
            return Err(SysError::Verification(format!(
                "no matching signatures for {reference}"
            )));
        }
        Ok(format!("Verification for {reference} -- OK"))
    }
}
