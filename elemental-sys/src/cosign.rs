// SPDX-License-Identifier: GPL-3.0-only

//! Container image signature verification

use std::io;

use tracing::{debug, error};

use crate::error::{Result, SysError};
use crate::runner::render;

/// Checks the signature of an OCI image before it is used
pub trait SignatureVerifier: Send + Sync {
    /// Returns the verifier output on success. Without `key` the verification is keyless.
    fn verify(&self, reference: &str, key: Option<&str>, debug: bool) -> Result<String>;
}

/// Verifies through the `cosign` binary
#[derive(Debug, Clone, Default)]
pub struct CosignVerifier;

pub(crate) fn cosign_args<'a>(reference: &'a str, key: Option<&'a str>, debug: bool) -> Vec<&'a str> {
    let mut args = vec!["verify"];
    if debug {
        args.push("-d=true");
    }
    if let Some(key) = key {
        args.extend(["--key", key]);
    }
    args.push(reference);
    args
}

impl SignatureVerifier for CosignVerifier {
    fn verify(&self, reference: &str, key: Option<&str>, debug: bool) -> Result<String> {
        let args = cosign_args(reference, key, debug);
        let rendered = render("cosign", &args);
        debug!(command = %rendered, "verifying image signature");

        // Private TUF cache so concurrent or stale roots never interfere
        let tuf_root = tempfile::Builder::new().prefix("cosign-tuf-").tempdir()?;

        let mut expression = duct::cmd("cosign", &args)
            .env("TUF_ROOT", tuf_root.path())
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked();
        if key.is_none() {
            expression = expression.env("COSIGN_EXPERIMENTAL", "1");
        }

        let output = expression.run().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => SysError::CommandNotFound("cosign".to_string()),
            _ => SysError::Io(err),
        })?;
        let text = String::from_utf8_lossy(&output.stdout).to_string();

        if !output.status.success() {
            error!(reference, output = %text, "cosign verification failed");
            return Err(SysError::Verification(text));
        }
        Ok(text)
    }
}
