// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use elemental_types::PartitionTable;
use tracing::{debug, error, info, warn};

use super::parted::{PartedCall, PartedPartition, parse_header, parse_partitions};
use crate::error::{Result, SysError};
use crate::runner::Runner;

/// Attempts made to find a freshly created partition device node
pub const PARTITION_TRIES: u32 = 10;

/// Parted warning printed when GPT backup headers do not sit at the end of the disk
const UNALLOCATED_WARNING: &str = "Not all of the space available";

const MIB: u64 = 1024 * 1024;

pub fn mib_to_sectors(size: u64, sector_size: u64) -> u64 {
    size * MIB / sector_size
}

/// A block device and its partition table
pub struct Disk<'a> {
    device: PathBuf,
    runner: &'a dyn Runner,
    sector_size: u64,
    last_sector: u64,
    label: String,
    parts: Vec<PartedPartition>,
    retry_interval: Duration,
}

impl<'a> Disk<'a> {
    pub fn new(device: impl Into<PathBuf>, runner: &'a dyn Runner) -> Self {
        Self {
            device: device.into(),
            runner,
            sector_size: 0,
            last_sector: 0,
            label: String::new(),
            parts: Vec::new(),
            retry_interval: Duration::from_secs(1),
        }
    }

    /// Pause between device lookups in [`Disk::find_partition_device`]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    pub fn last_sector(&self) -> u64 {
        self.last_sector
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn partitions(&self) -> &[PartedPartition] {
        &self.parts
    }

    fn device_str(&self) -> String {
        self.device.to_string_lossy().into_owned()
    }

    /// Whether the device node exists. A symlinked device is resolved to its target.
    pub fn exists(&mut self) -> bool {
        let Ok(metadata) = self.device.symlink_metadata() else {
            return false;
        };
        if metadata.file_type().is_symlink() {
            match fs::canonicalize(&self.device) {
                Ok(resolved) => self.device = resolved,
                Err(_) => return false,
            }
        }
        true
    }

    /// Re-reads geometry and partitions, repairing misplaced GPT headers first
    pub fn reload(&mut self) -> Result<()> {
        let pc = PartedCall::new(self.device_str(), self.runner);
        let mut print_out = pc.print()?;

        if print_out.contains(UNALLOCATED_WARNING) {
            info!(device = %self.device.display(), "relocating GPT backup header to the end of the disk");
            let device = self.device_str();
            self.runner.run("sgdisk", &["-e", device.as_str()])?;
            print_out = pc.print()?;
        }

        let header = parse_header(&print_out)?;
        if header.sector_size == 0 {
            return Err(SysError::InvalidPartitionTable {
                disk: self.device_str(),
                reason: "sector size reported as 0".to_string(),
            });
        }
        self.sector_size = header.sector_size;
        self.last_sector = header.last_sector;
        self.label = header.label;
        self.parts = parse_partitions(&print_out);
        Ok(())
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if self.sector_size == 0 {
            self.reload().inspect_err(|err| error!("failed analyzing disk: {err}"))?;
        }
        Ok(())
    }

    fn first_usable_sector(&self) -> u64 {
        // First partition is aligned at 1MiB
        MIB / self.sector_size
    }

    fn compute_free_space(&self) -> u64 {
        match self.parts.last() {
            Some(last) => self
                .last_sector
                .saturating_sub(last.start + last.size - 1),
            None => self
                .last_sector
                .saturating_sub(self.first_usable_sector() - 1),
        }
    }

    /// Free sectors after the last partition
    pub fn free_space(&mut self) -> Result<u64> {
        self.ensure_loaded()?;
        Ok(self.compute_free_space())
    }

    /// Writes an empty partition table. Destroys every existing partition.
    pub fn new_partition_table(&mut self, table: PartitionTable) -> Result<String> {
        let mut pc = PartedCall::new(self.device_str(), self.runner);
        pc.set_label(table);
        pc.wipe_table(true);
        let out = pc.write_changes()?;
        self.reload()
            .inspect_err(|err| error!("failed analyzing disk: {err}"))?;
        Ok(out)
    }

    /// Appends a partition after the last one and returns its number.
    /// A size of 0 MiB takes the rest of the disk.
    pub fn add_partition(
        &mut self,
        size_mb: u32,
        fs: Option<&str>,
        name: &str,
        flags: &[String],
    ) -> Result<u32> {
        self.ensure_loaded()?;

        let table: PartitionTable = self.label.parse().map_err(|_| SysError::InvalidPartitionTable {
            disk: self.device_str(),
            reason: format!("unsupported label '{}'", self.label),
        })?;

        let (number, start) = match self.parts.last() {
            Some(last) => (last.number + 1, last.start + last.size),
            None => (1, self.first_usable_sector()),
        };

        let size = mib_to_sectors(u64::from(size_mb), self.sector_size);
        let free = self.compute_free_space();
        if size > free {
            return Err(SysError::NotEnoughSpace {
                disk: self.device_str(),
                requested: size,
                available: free,
            });
        }

        let mut pc = PartedCall::new(self.device_str(), self.runner);
        pc.set_label(table);
        pc.create_partition(PartedPartition {
            number,
            start,
            size,
            name: name.to_string(),
            fs: fs.unwrap_or_default().to_string(),
        });
        for flag in flags {
            pc.set_partition_flag(number, flag, true);
        }

        let out = pc
            .write_changes()
            .inspect_err(|err| error!("failed creating partition: {err}"))?;
        debug!("partitioner output: {out}");

        self.reload()
            .inspect_err(|err| error!("failed analyzing disk: {err}"))?;
        Ok(number)
    }

    /// Device node name of partition `number`, following the kernel's naming
    /// (`/dev/sda1`, `/dev/nvme0n1p1`, `/dev/loop0p1`)
    pub fn partition_device_name(&self, number: u32) -> PathBuf {
        let device = self.device_str();
        if device.ends_with(|c: char| c.is_ascii_digit()) {
            PathBuf::from(format!("{device}p{number}"))
        } else {
            PathBuf::from(format!("{device}{number}"))
        }
    }

    /// Waits for udev to create the device node of partition `number`
    pub fn find_partition_device(&self, number: u32) -> Result<PathBuf> {
        let device = self.partition_device_name(number);

        for attempt in 1..=PARTITION_TRIES {
            debug!(
                "looking for partition device {} of {} (attempt {attempt})",
                number,
                self.device.display()
            );
            if let Err(err) = self.runner.run("udevadm", &["settle"]) {
                warn!("udevadm settle failed: {err}");
            }
            if device.exists() {
                return Ok(device);
            }
            if attempt < PARTITION_TRIES {
                thread::sleep(self.retry_interval);
            }
        }

        Err(SysError::DeviceNotFound(format!(
            "partition {number} of {} ({})",
            self.device.display(),
            device.display()
        )))
    }

    /// Removes every filesystem signature from `device`
    pub fn wipe_fs_on_partition(&self, device: &Path) -> Result<()> {
        let device = device.to_string_lossy().into_owned();
        self.runner.run("wipefs", &["--all", device.as_str()])?;
        Ok(())
    }
}
