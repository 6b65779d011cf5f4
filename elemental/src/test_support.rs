// SPDX-License-Identifier: GPL-3.0-only

//! Fake host shared by the unit tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use elemental_sys::testing::{FakeExtractor, FakeMounter, FakeRunner, FakeVerifier};
use elemental_types::DeploySettings;
use tempfile::TempDir;

use crate::config::Config;

pub(crate) struct Fakes {
    pub runner: Arc<FakeRunner>,
    pub mounter: Arc<FakeMounter>,
    pub extractor: Arc<FakeExtractor>,
    pub verifier: Arc<FakeVerifier>,
    pub config: Config,
    /// Holds the temp and staging dirs of `config`
    pub scratch: TempDir,
}

impl Fakes {
    pub fn new() -> Self {
        Self::with(DeploySettings::default(), FakeExtractor::new(), FakeVerifier::accepting())
    }

    pub fn with(
        mut settings: DeploySettings,
        extractor: FakeExtractor,
        verifier: FakeVerifier,
    ) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        settings.tmp_dir = Some(scratch.path().join("tmp"));
        let runner = Arc::new(FakeRunner::new());
        let mounter = Arc::new(FakeMounter::new());
        let extractor = Arc::new(extractor);
        let verifier = Arc::new(verifier);
        let config = Config {
            runner: runner.clone(),
            mounter: mounter.clone(),
            extractor: extractor.clone(),
            verifier: verifier.clone(),
            settings,
            retry_interval: Duration::ZERO,
            image_source_dir: scratch.path().join("imgsrc"),
        };
        Self {
            runner,
            mounter,
            extractor,
            verifier,
            config,
            scratch,
        }
    }
}

/// Makes `parted` behave like a disk of `last_sector` 512 byte sectors that
/// remembers every `mklabel` and `mkpart`
pub(crate) fn simulate_parted(runner: &FakeRunner, last_sector: u64) {
    let table: Arc<Mutex<(String, Vec<String>)>> =
        Arc::new(Mutex::new(("gpt".to_string(), Vec::new())));

    runner.on("parted", move |_, args| {
        let mut table = table.lock().unwrap();
        if let Some(pos) = args.iter().position(|arg| *arg == "mklabel") {
            table.0 = args[pos + 1].to_string();
            table.1.clear();
        }
        if let Some(pos) = args.iter().position(|arg| *arg == "mkpart") {
            let name = args[pos + 1];
            let (fs, start, end) = if args[pos + 2].parse::<u64>().is_ok() {
                ("", args[pos + 2], args[pos + 3])
            } else {
                (args[pos + 2], args[pos + 3], args[pos + 4])
            };
            let start: u64 = start.parse().unwrap();
            let end: u64 = if end == "100%" {
                last_sector - 34
            } else {
                end.parse().unwrap()
            };
            let number = table.1.len() + 1;
            table.1.push(format!(
                "{number}:{start}s:{end}s:{}s:{fs}:{name}:;",
                end - start + 1
            ));
        }
        if args.last() == Some(&"print") {
            let mut out = format!(
                "BYT;\n/dev/vda:{last_sector}s:virtblk:512:512:{}:Virtio Block Device:;\n",
                table.0
            );
            for line in &table.1 {
                out.push_str(line);
                out.push('\n');
            }
            return Ok(out.into_bytes());
        }
        Ok(Vec::new())
    });
}
