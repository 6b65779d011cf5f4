// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::runner::Runner;

/// Builds a squashfs image of `source` at `destination`
pub fn create_squashfs(
    runner: &dyn Runner,
    source: &Path,
    destination: &Path,
    options: &[String],
) -> Result<()> {
    let source = source.to_string_lossy().into_owned();
    let destination = destination.to_string_lossy().into_owned();
    info!(source, destination, "creating squashfs image");

    let mut args = vec![source.as_str(), destination.as_str()];
    args.extend(options.iter().map(String::as_str));
    runner.run("mksquashfs", &args)?;
    Ok(())
}
