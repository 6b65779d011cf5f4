// SPDX-License-Identifier: GPL-3.0-only

//! Partition tables and filesystem creation

mod disk;
mod mkfs;
mod parted;

pub use disk::{Disk, PARTITION_TRIES, mib_to_sectors};
pub use mkfs::{format_device, mkfs_args};
pub use parted::{PartedCall, PartedHeader, PartedPartition, parse_header, parse_partitions};
