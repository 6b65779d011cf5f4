// SPDX-License-Identifier: GPL-3.0-only

//! Disk partitioning and OS image deployment for elemental systems
//!
//! The orchestrators in this crate drive the primitives of `elemental-sys`:
//! - `partitions`: lay out a disk, format it, mount and unmount partitions
//! - `images`: create, loop mount and populate filesystem images
//! - `source`: turn an image source into a root tree
//! - `install`: the whole install sequence onto a target disk
//! - `system`: boot mode, ISO sources, cloud-config, SELinux labels
//!
//! Every operation takes a [`Config`] carrying the host collaborators, so the
//! same code runs against fakes in tests.

pub mod cleanstack;
pub mod config;
pub mod error;
pub mod images;
pub mod install;
pub mod partitions;
pub mod source;
pub mod system;

#[cfg(test)]
mod test_support;

pub use cleanstack::{CleanStack, Cleaner};
pub use config::{Config, load_settings};
pub use error::{DeployError, Result};
pub use images::{
    copy_file_image, create_filesystem_image, create_image_from_tree, deploy_image,
    mount_filesystem_image, unmount_filesystem_image,
};
pub use install::{InstallOptions, install};
pub use partitions::{
    create_and_format_partition, create_partitions, is_mounted, mount_partition, mount_partitions,
    mount_rw_partition, partition_and_format_device, unmount_partition, unmount_partitions,
};
pub use source::dump_source;
pub use system::{
    BootState, boot_state, copy_cloud_config, deactivate_devices, mount_iso_source,
    resolve_temp_dir, selinux_relabel,
};
