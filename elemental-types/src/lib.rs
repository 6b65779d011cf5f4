// SPDX-License-Identifier: GPL-3.0-only

//! Domain models for the elemental deploy toolkit
//!
//! These types are shared by the system layer (`elemental-sys`) and the
//! deployment orchestrators (`elemental`):
//!
//! - `Partition`, `PartitionList` and `ElementalPartitions` describe the disk layout
//! - `Image` and `ImageSource` describe filesystem images and their content
//! - `DeploySettings` and `InstallSettings` mirror the TOML configuration file

pub mod constants;
pub mod error;
pub mod image;
pub mod install;
pub mod partition;
pub mod settings;

pub use error::LayoutError;
pub use image::{Image, ImageSource};
pub use install::{InstallSettings, InstallSpec};
pub use partition::{
    ElementalPartitions, Firmware, Partition, PartitionList, PartitionTable, sort_by_mount_point,
};
pub use settings::DeploySettings;
