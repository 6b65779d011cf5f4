// SPDX-License-Identifier: GPL-3.0-only

//! Partition models and the elemental disk layout

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{
    BIOS_FLAG, BIOS_PART_NAME, BIOS_SIZE, BOOT_FLAG, EFI_DIR, EFI_FS, EFI_LABEL, EFI_PART_NAME,
    EFI_SIZE, ESP_FLAG, LINUX_FS, OEM_DIR, OEM_LABEL, OEM_PART_NAME, OEM_SIZE, PERSISTENT_DIR,
    PERSISTENT_LABEL, PERSISTENT_PART_NAME, PERSISTENT_SIZE, RECOVERY_DIR, RECOVERY_LABEL,
    RECOVERY_PART_NAME, RECOVERY_SIZE, STATE_DIR, STATE_LABEL, STATE_PART_NAME, STATE_SIZE,
};
use crate::error::LayoutError;

/// A partition as declared in configuration, sizes in MiB
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Partition {
    /// Partition name (GPT partition label)
    pub name: String,

    /// Filesystem to create on the partition. `None` wipes any existing signature instead.
    pub fs: Option<String>,

    /// Filesystem label
    pub filesystem_label: String,

    /// Size in MiB, 0 takes the rest of the disk
    pub size: u32,

    /// Where to mount the partition, `None` means it is never mounted
    pub mount_point: Option<PathBuf>,

    /// Partition flags such as `esp` or `bios_grub`
    pub flags: Vec<String>,

    /// Options used when mounting, plain `rw` when empty
    pub mount_options: Vec<String>,

    /// Device node, known only once the partition exists on disk
    pub path: Option<PathBuf>,

    /// Disk device the partition belongs to
    pub disk: Option<PathBuf>,
}

impl Partition {
    /// Mount point if the partition is meant to be mounted
    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point
            .as_deref()
            .filter(|mount_point| !mount_point.as_os_str().is_empty())
    }

    /// Declared filesystem, ignoring empty strings coming from configuration
    pub fn filesystem(&self) -> Option<&str> {
        self.fs.as_deref().filter(|fs| !fs.is_empty())
    }
}

/// Ordered list of partitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionList(pub Vec<Partition>);

impl PartitionList {
    pub fn by_name(&self, name: &str) -> Option<&Partition> {
        self.0.iter().find(|part| part.name == name)
    }

    pub fn by_label(&self, label: &str) -> Option<&Partition> {
        self.0.iter().find(|part| part.filesystem_label == label)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Partition> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Partition> {
        self.0.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<Partition>> for PartitionList {
    fn from(parts: Vec<Partition>) -> Self {
        Self(parts)
    }
}

impl IntoIterator for PartitionList {
    type Item = Partition;
    type IntoIter = std::vec::IntoIter<Partition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Firmware the target machine boots with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Efi,
    Bios,
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Firmware::Efi => write!(f, "efi"),
            Firmware::Bios => write!(f, "bios"),
        }
    }
}

impl FromStr for Firmware {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "efi" => Ok(Firmware::Efi),
            "bios" => Ok(Firmware::Bios),
            other => Err(LayoutError::UnknownFirmware(other.to_string())),
        }
    }
}

/// Partition table style
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTable {
    #[default]
    Gpt,
    Msdos,
}

impl PartitionTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionTable::Gpt => "gpt",
            PartitionTable::Msdos => "msdos",
        }
    }
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionTable {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpt" => Ok(PartitionTable::Gpt),
            "msdos" | "dos" | "mbr" => Ok(PartitionTable::Msdos),
            other => Err(LayoutError::UnknownPartitionTable(other.to_string())),
        }
    }
}

/// Named partition slots of an elemental installation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementalPartitions {
    pub bios: Option<Partition>,
    pub efi: Option<Partition>,
    pub oem: Option<Partition>,
    pub recovery: Option<Partition>,
    pub state: Option<Partition>,
    pub persistent: Option<Partition>,
}

impl ElementalPartitions {
    /// Layout used when configuration does not declare any partition
    pub fn default_layout() -> Self {
        let linux = |name: &str, label: &str, size: u32, mount_point: &str| Partition {
            name: name.to_string(),
            fs: Some(LINUX_FS.to_string()),
            filesystem_label: label.to_string(),
            size,
            mount_point: Some(PathBuf::from(mount_point)),
            ..Default::default()
        };

        Self {
            bios: None,
            efi: None,
            oem: Some(linux(OEM_PART_NAME, OEM_LABEL, OEM_SIZE, OEM_DIR)),
            recovery: Some(linux(
                RECOVERY_PART_NAME,
                RECOVERY_LABEL,
                RECOVERY_SIZE,
                RECOVERY_DIR,
            )),
            state: Some(linux(STATE_PART_NAME, STATE_LABEL, STATE_SIZE, STATE_DIR)),
            persistent: Some(linux(
                PERSISTENT_PART_NAME,
                PERSISTENT_LABEL,
                PERSISTENT_SIZE,
                PERSISTENT_DIR,
            )),
        }
    }

    /// Assigns partitions to their slots by partition name. Unknown names are ignored.
    pub fn from_list(list: PartitionList) -> Self {
        let mut parts = Self::default();
        for part in list {
            let slot = match part.name.as_str() {
                BIOS_PART_NAME => &mut parts.bios,
                EFI_PART_NAME => &mut parts.efi,
                OEM_PART_NAME => &mut parts.oem,
                RECOVERY_PART_NAME => &mut parts.recovery,
                STATE_PART_NAME => &mut parts.state,
                PERSISTENT_PART_NAME => &mut parts.persistent,
                _ => continue,
            };
            *slot = Some(part);
        }
        parts
    }

    /// Adds the partitions the firmware needs to boot from the given table style
    pub fn set_firmware_partitions(
        &mut self,
        firmware: Firmware,
        table: PartitionTable,
    ) -> Result<(), LayoutError> {
        match (firmware, table) {
            (Firmware::Efi, PartitionTable::Gpt) => {
                self.bios = None;
                self.efi = Some(Partition {
                    name: EFI_PART_NAME.to_string(),
                    fs: Some(EFI_FS.to_string()),
                    filesystem_label: EFI_LABEL.to_string(),
                    size: EFI_SIZE,
                    mount_point: Some(PathBuf::from(EFI_DIR)),
                    flags: vec![ESP_FLAG.to_string()],
                    ..Default::default()
                });
            }
            (Firmware::Bios, PartitionTable::Gpt) => {
                self.efi = None;
                self.bios = Some(Partition {
                    name: BIOS_PART_NAME.to_string(),
                    size: BIOS_SIZE,
                    flags: vec![BIOS_FLAG.to_string()],
                    ..Default::default()
                });
            }
            (Firmware::Bios, PartitionTable::Msdos) => {
                let state = self
                    .state
                    .as_mut()
                    .ok_or(LayoutError::MissingStatePartition)?;
                if !state.flags.iter().any(|flag| flag == BOOT_FLAG) {
                    state.flags.push(BOOT_FLAG.to_string());
                }
                self.efi = None;
                self.bios = None;
            }
            (Firmware::Efi, PartitionTable::Msdos) => {
                return Err(LayoutError::UnsupportedFirmware { firmware, table });
            }
        }
        Ok(())
    }

    /// All declared partitions, firmware partitions first
    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        [
            &self.bios,
            &self.efi,
            &self.oem,
            &self.recovery,
            &self.state,
            &self.persistent,
        ]
        .into_iter()
        .filter_map(Option::as_ref)
    }

    /// Partitions in the order they must be created on disk.
    ///
    /// Firmware partitions go first since some firmware only boots from the
    /// first partition. Extra partitions with a fixed size go before
    /// persistent. A single extra partition with size 0 may follow persistent
    /// when persistent has a fixed size; any other size 0 extra is dropped.
    pub fn partitions_by_install_order<'a>(
        &'a mut self,
        extra: &'a mut [Partition],
    ) -> Vec<&'a mut Partition> {
        let Self {
            bios,
            efi,
            oem,
            recovery,
            state,
            persistent,
        } = self;

        let mut ordered: Vec<&'a mut Partition> = [bios, efi, oem, recovery, state]
            .into_iter()
            .filter_map(Option::as_mut)
            .collect();

        let mut last = None;
        for part in extra.iter_mut() {
            if part.size == 0 {
                if last.is_none() {
                    last = Some(part);
                }
                continue;
            }
            ordered.push(part);
        }

        match persistent.as_mut() {
            Some(persistent) if persistent.size == 0 => ordered.push(persistent),
            Some(persistent) => {
                ordered.push(persistent);
                ordered.extend(last);
            }
            None => ordered.extend(last),
        }

        ordered
    }

    /// Mountable partitions sorted by mount point, descending order is the unmount order
    pub fn partitions_by_mount_point(&self, descending: bool) -> Vec<&Partition> {
        sort_by_mount_point(self.iter().collect(), descending)
    }
}

/// Keeps partitions with a mount point, sorted so parents come before nested mounts
pub fn sort_by_mount_point(parts: Vec<&Partition>, descending: bool) -> Vec<&Partition> {
    let mut parts: Vec<&Partition> = parts
        .into_iter()
        .filter(|part| part.mount_point().is_some())
        .collect();
    parts.sort_by(|a, b| a.mount_point().cmp(&b.mount_point()));
    if descending {
        parts.reverse();
    }
    parts
}
