// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;
use crate::partition::{ElementalPartitions, Firmware, Partition, PartitionList, PartitionTable};

/// `[install]` table of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSettings {
    pub target: Option<PathBuf>,
    pub firmware: Firmware,
    pub part_table: PartitionTable,
    /// Elemental partitions, matched to their slot by name. Empty uses the default layout.
    pub partitions: Vec<Partition>,
    pub extra_partitions: Vec<Partition>,
}

/// Everything needed to lay out a target disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSpec {
    pub target: PathBuf,
    pub firmware: Firmware,
    pub part_table: PartitionTable,
    pub partitions: ElementalPartitions,
    pub extra_partitions: PartitionList,
}

impl InstallSpec {
    /// Builds the layout for `target`, firmware partitions included
    pub fn new(
        target: impl Into<PathBuf>,
        settings: &InstallSettings,
    ) -> Result<Self, LayoutError> {
        let mut partitions = if settings.partitions.is_empty() {
            ElementalPartitions::default_layout()
        } else {
            ElementalPartitions::from_list(PartitionList(settings.partitions.clone()))
        };
        partitions.set_firmware_partitions(settings.firmware, settings.part_table)?;

        Ok(Self {
            target: target.into(),
            firmware: settings.firmware,
            part_table: settings.part_table,
            partitions,
            extra_partitions: PartitionList(settings.extra_partitions.clone()),
        })
    }
}
