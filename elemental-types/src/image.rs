// SPDX-License-Identifier: GPL-3.0-only

//! Images and the sources they are populated from

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::SQUASHFS;
use crate::error::LayoutError;

/// Where deployed content comes from.
///
/// Serialized as a URI: `oci://`, `docker://`, `dir://` or `file://`. A string
/// without scheme is taken as an OCI reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageSource {
    Oci {
        reference: String,
        /// Manifest digest, known once the image has been pulled
        digest: Option<String>,
    },
    Dir(PathBuf),
    File(PathBuf),
    #[default]
    Empty,
}

impl ImageSource {
    pub fn oci(reference: impl Into<String>) -> Self {
        ImageSource::Oci {
            reference: reference.into(),
            digest: None,
        }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        ImageSource::Dir(path.into())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        ImageSource::File(path.into())
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ImageSource::Oci { .. })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, ImageSource::Dir(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ImageSource::File(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ImageSource::Empty)
    }

    pub fn digest(&self) -> Option<&str> {
        match self {
            ImageSource::Oci { digest, .. } => digest.as_deref(),
            _ => None,
        }
    }

    /// Records the pulled digest. Only OCI sources carry one.
    pub fn set_digest(&mut self, value: impl Into<String>) {
        if let ImageSource::Oci { digest, .. } = self {
            *digest = Some(value.into());
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Oci { reference, .. } => write!(f, "oci://{reference}"),
            ImageSource::Dir(path) => write!(f, "dir://{}", path.display()),
            ImageSource::File(path) => write!(f, "file://{}", path.display()),
            ImageSource::Empty => Ok(()),
        }
    }
}

impl FromStr for ImageSource {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(ImageSource::Empty);
        }

        let Some((scheme, value)) = s.split_once("://") else {
            if s.contains(char::is_whitespace) {
                return Err(LayoutError::InvalidSource(s.to_string()));
            }
            return Ok(ImageSource::oci(s));
        };

        if value.is_empty() {
            return Err(LayoutError::InvalidSource(s.to_string()));
        }

        match scheme {
            "oci" | "docker" => Ok(ImageSource::oci(value)),
            "dir" => Ok(ImageSource::dir(value)),
            "file" => Ok(ImageSource::file(value)),
            other => Err(LayoutError::UnknownScheme(other.to_string())),
        }
    }
}

impl TryFrom<String> for ImageSource {
    type Error = LayoutError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageSource> for String {
    fn from(source: ImageSource) -> Self {
        source.to_string()
    }
}

/// A filesystem image file and how it gets mounted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Image {
    pub label: String,
    pub file: PathBuf,
    /// Filesystem type, `squashfs` builds a read-only image
    pub fs: String,
    /// Size in MiB, 0 sizes the image from its source tree
    pub size: u32,
    pub mount_point: PathBuf,
    pub source: ImageSource,
    /// Loop device backing the image while this process keeps it mounted
    #[serde(skip)]
    pub loop_device: Option<PathBuf>,
}

impl Image {
    pub fn is_squashfs(&self) -> bool {
        self.fs == SQUASHFS
    }
}
