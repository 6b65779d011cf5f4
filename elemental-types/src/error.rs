// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

use crate::partition::{Firmware, PartitionTable};

/// Errors raised while building or validating deployment models
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("firmware {firmware} cannot boot from a {table} partition table")]
    UnsupportedFirmware {
        firmware: Firmware,
        table: PartitionTable,
    },

    #[error("a state partition is required to set firmware partitions")]
    MissingStatePartition,

    #[error("unknown firmware '{0}'")]
    UnknownFirmware(String),

    #[error("unknown partition table '{0}'")]
    UnknownPartitionTable(String),

    #[error("invalid image source '{0}'")]
    InvalidSource(String),

    #[error("unsupported image source scheme '{0}'")]
    UnknownScheme(String),
}
