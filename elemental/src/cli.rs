// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use elemental_types::ImageSource;
use elemental_types::constants::DEFAULT_CONFIG_PATH;

/// Partitions disks and deploys elemental OS images
#[derive(Parser, Debug)]
#[command(name = "elemental-deploy", version)]
#[command(about = "Partition disks and deploy elemental OS images", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log at debug level
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Wipe the target disk and create the elemental partition layout
    Partition {
        /// Target block device, overrides `install.target`
        #[arg(long)]
        target: Option<PathBuf>,
    },
    /// Partition the target disk and install the system images on it
    Deploy {
        /// Target block device, overrides `install.target`
        #[arg(long)]
        target: Option<PathBuf>,
        /// Image source: oci://, docker://, dir:// or file://
        #[arg(long, required_unless_present = "iso", conflicts_with = "iso")]
        source: Option<ImageSource>,
        /// Install the root filesystem of a live ISO
        #[arg(long)]
        iso: Option<PathBuf>,
        /// Cloud-config file copied to the OEM partition, may be repeated
        #[arg(long = "cloud-init")]
        cloud_init: Vec<PathBuf>,
        /// Size of the system images in MiB, 0 sizes them from the source
        #[arg(long, default_value_t = 0)]
        image_size: u32,
        /// Overwrite an already installed system
        #[arg(long)]
        force: bool,
    },
    /// Extract an image source into a directory
    Dump {
        source: ImageSource,
        target: PathBuf,
    },
    /// Mount the elemental partitions by filesystem label
    MountPartitions,
    /// Unmount the elemental partitions
    UnmountPartitions,
}
