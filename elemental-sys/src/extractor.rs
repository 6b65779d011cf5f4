// SPDX-License-Identifier: GPL-3.0-only

//! OCI image extraction into a directory tree

use std::path::Path;

use oci_client::Reference;
use oci_client::manifest::{OciImageIndex, OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, SysError};
use crate::fsutil::temp_dir;
use crate::layer::apply_layer_file;

/// Unpacks a container image's root filesystem
pub trait ImageExtractor: Send + Sync {
    /// Extracts `reference` for `platform` (`os/arch[/variant]`) into `target`
    /// and returns the digest of the extracted image manifest. With `local`
    /// the image is looked up in the host's image store instead of a registry.
    fn extract_image(
        &self,
        reference: &str,
        target: &Path,
        platform: &str,
        local: bool,
    ) -> Result<String>;
}

/// Pulls images anonymously from their registry
pub struct OciImageExtractor {
    client: oci_client::Client,
}

impl Default for OciImageExtractor {
    fn default() -> Self {
        Self {
            client: oci_client::Client::new(Default::default()),
        }
    }
}

impl OciImageExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    async fn pull_manifest(&self, reference: &Reference) -> Result<(OciManifest, String)> {
        self.client
            .pull_manifest(reference, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| SysError::Image(format!("failed to pull manifest for {reference}: {e}")))
    }

    async fn resolve_image_manifest(
        &self,
        reference: &Reference,
        platform: &Platform<'_>,
    ) -> Result<(OciImageManifest, String)> {
        match self.pull_manifest(reference).await? {
            (OciManifest::Image(image), digest) => Ok((image, digest)),
            (OciManifest::ImageIndex(index), _) => {
                let digest = select_platform_manifest(&index, platform)?;
                let platform_ref: Reference = format!("{}@{}", reference.whole(), digest)
                    .parse()
                    .map_err(|e| SysError::Image(format!("invalid platform reference: {e}")))?;

                info!("pulling {} manifest {digest}", platform);
                match self.pull_manifest(&platform_ref).await? {
                    (OciManifest::Image(image), digest) => Ok((image, digest)),
                    _ => Err(SysError::Image(format!(
                        "platform manifest of {reference} is not an image"
                    ))),
                }
            }
        }
    }

    async fn pull_and_extract(
        &self,
        reference: &Reference,
        target: &Path,
        platform: &Platform<'_>,
    ) -> Result<String> {
        let (image, digest) = self.resolve_image_manifest(reference, platform).await?;
        let staging = temp_dir(None, "elemental-layers-")?;

        info!(
            "extracting {} layers of {reference} into {}",
            image.layers.len(),
            target.display()
        );
        for (index, layer) in image.layers.iter().enumerate() {
            let blob = staging.path().join(format!("layer-{index}"));
            debug!("downloading layer {}", layer.digest);
            {
                let mut file = tokio::fs::File::create(&blob).await?;
                self.client
                    .pull_blob(reference, layer, &mut file)
                    .await
                    .map_err(|e| {
                        SysError::Image(format!("failed to pull layer {}: {e}", layer.digest))
                    })?;
                file.flush().await?;
            }
            apply_layer_file(&blob, target)?;
            tokio::fs::remove_file(&blob).await?;
        }

        Ok(digest)
    }
}

impl ImageExtractor for OciImageExtractor {
    fn extract_image(
        &self,
        reference: &str,
        target: &Path,
        platform: &str,
        local: bool,
    ) -> Result<String> {
        if local {
            return Err(SysError::Image(format!(
                "cannot extract {reference}: local image stores are not supported, pull from a registry instead"
            )));
        }

        let reference: Reference = reference
            .parse()
            .map_err(|e| SysError::Image(format!("invalid image reference {reference}: {e}")))?;
        let platform = Platform::parse(platform)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.pull_and_extract(&reference, target, &platform))
    }
}

/// `os/arch[/variant]` selector for multi-platform images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform<'a> {
    pub os: &'a str,
    pub architecture: &'a str,
    pub variant: Option<&'a str>,
}

impl<'a> Platform<'a> {
    pub fn parse(value: &'a str) -> Result<Self> {
        let mut parts = value.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(os), Some(architecture), variant, None)
                if !os.is_empty() && !architecture.is_empty() =>
            {
                Ok(Self {
                    os,
                    architecture,
                    variant: variant.filter(|v| !v.is_empty()),
                })
            }
            _ => Err(SysError::parse("platform", value)),
        }
    }
}

impl std::fmt::Display for Platform<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

fn select_platform_manifest(index: &OciImageIndex, platform: &Platform<'_>) -> Result<String> {
    index
        .manifests
        .iter()
        .find(|m| {
            m.platform.as_ref().is_some_and(|p| {
                p.os == platform.os
                    && p.architecture == platform.architecture
                    && platform
                        .variant
                        .is_none_or(|variant| p.variant.as_deref() == Some(variant))
            })
        })
        .map(|m| m.digest.clone())
        .ok_or_else(|| {
            let available = index
                .manifests
                .iter()
                .filter_map(|m| {
                    m.platform
                        .as_ref()
                        .map(|p| format!("{}/{}", p.os, p.architecture))
                })
                .collect::<Vec<_>>()
                .join(", ");
            SysError::Image(format!(
                "no image found for platform {platform}. Available platforms: {available}"
            ))
        })
}
