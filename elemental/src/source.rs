// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::Path;

use elemental_sys::fsutil::{create_dir_structure, sync_data};
use elemental_types::ImageSource;
use elemental_types::constants::SYNC_EXCLUDES;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{DeployError, Result};

/// Materializes `source` as a root tree under `target`.
///
/// OCI images are verified first when cosign is enabled, then extracted and
/// their digest recorded in `source`. Directories are copied and file sources
/// loop mounted and copied. The essential directories always exist afterwards.
pub fn dump_source(cfg: &Config, target: &Path, source: &mut ImageSource) -> Result<()> {
    debug!("dumping {source} into {}", target.display());

    match source {
        ImageSource::Oci { reference, .. } => {
            if cfg.settings.cosign {
                info!("verifying signature of {reference}");
                if let Err(err) = cfg.verifier.verify(
                    reference,
                    cfg.settings.cosign_key.as_deref(),
                    cfg.settings.debug,
                ) {
                    error!("{err}");
                    return Err(DeployError::Verification {
                        reference: reference.clone(),
                        output: err.to_string(),
                    });
                }
            }

            info!("extracting {reference} to {}", target.display());
            let reference = reference.clone();
            let pulled = cfg.extractor.extract_image(
                &reference,
                target,
                &cfg.settings.platform,
                cfg.settings.local_images,
            )?;
            source.set_digest(pulled);
        }
        ImageSource::Dir(dir) => {
            info!("copying {} to {}", dir.display(), target.display());
            sync_data(dir, target, SYNC_EXCLUDES)?;
        }
        ImageSource::File(file) => {
            let staging = &cfg.image_source_dir;
            fs::create_dir_all(staging)?;
            cfg.mounter.mount(file, staging, "auto", &["loop", "ro"])?;

            let synced = sync_data(staging, target, SYNC_EXCLUDES);
            if let Err(err) = cfg.mounter.unmount(staging) {
                warn!("failed to unmount {}: {err}", staging.display());
            }
            synced?;
        }
        ImageSource::Empty => {
            return Err(DeployError::UnknownSourceType("empty".to_string()));
        }
    }

    create_dir_structure(target)?;
    Ok(())
}
