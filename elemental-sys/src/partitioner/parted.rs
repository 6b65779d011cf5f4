// SPDX-License-Identifier: GPL-3.0-only

//! `parted --machine` backend

use elemental_types::PartitionTable;
use tracing::debug;

use crate::error::{Result, SysError};
use crate::runner::Runner;

/// Partition as reported by (or about to be written to) the partition table.
/// Positions are in sectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartedPartition {
    pub number: u32,
    pub start: u64,
    /// 0 extends the partition to the end of the disk
    pub size: u64,
    pub name: String,
    pub fs: String,
}

/// Disk geometry from the header line of `parted --machine print`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartedHeader {
    pub last_sector: u64,
    pub sector_size: u64,
    pub label: String,
}

/// Batch of parted operations applied with a single invocation
pub struct PartedCall<'a> {
    device: String,
    runner: &'a dyn Runner,
    wipe: bool,
    label: PartitionTable,
    parts: Vec<PartedPartition>,
    flags: Vec<(u32, String, bool)>,
}

impl<'a> PartedCall<'a> {
    pub fn new(device: impl Into<String>, runner: &'a dyn Runner) -> Self {
        Self {
            device: device.into(),
            runner,
            wipe: false,
            label: PartitionTable::Gpt,
            parts: Vec::new(),
            flags: Vec::new(),
        }
    }

    /// Table label for new partitions, and the one written by `mklabel` when wiping
    pub fn set_label(&mut self, label: PartitionTable) {
        self.label = label;
    }

    pub fn wipe_table(&mut self, wipe: bool) {
        self.wipe = wipe;
    }

    pub fn create_partition(&mut self, part: PartedPartition) {
        self.parts.push(part);
    }

    pub fn set_partition_flag(&mut self, number: u32, flag: &str, active: bool) {
        self.flags.push((number, flag.to_string(), active));
    }

    pub(crate) fn build_args(&self) -> Vec<String> {
        let mut opts: Vec<String> = Vec::new();

        if self.wipe {
            opts.extend(["mklabel".into(), self.label.to_string()]);
        }

        for part in &self.parts {
            let name = match self.label {
                PartitionTable::Gpt if !part.name.is_empty() => part.name.clone(),
                PartitionTable::Gpt => format!("part{}", part.number),
                PartitionTable::Msdos => "primary".to_string(),
            };
            opts.extend(["mkpart".into(), name]);

            if part.fs.contains("fat") {
                opts.push("fat32".into());
            } else if !part.fs.is_empty() {
                opts.push(part.fs.clone());
            }

            opts.push(part.start.to_string());
            if part.size == 0 {
                opts.push("100%".into());
            } else {
                opts.push((part.start + part.size - 1).to_string());
            }
        }

        for (number, flag, active) in &self.flags {
            opts.extend([
                "set".into(),
                number.to_string(),
                flag.clone(),
                if *active { "on" } else { "off" }.into(),
            ]);
        }

        if opts.is_empty() {
            return opts;
        }

        let mut args: Vec<String> = ["--script", "--machine", "--"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend([self.device.clone(), "unit".into(), "s".into()]);
        args.extend(opts);
        args
    }

    /// Runs the queued operations and asks the kernel to re-read the table
    pub fn write_changes(&mut self) -> Result<String> {
        let args = self.build_args();
        if args.is_empty() {
            return Ok(String::new());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.runner.run("parted", &arg_refs);

        // Best effort, a stale kernel view is fixed later by udev
        if let Err(err) = self.runner.run("partx", &["-u", self.device.as_str()]) {
            debug!("partx update failed on {}: {err}", self.device);
        }

        self.wipe = false;
        self.parts.clear();
        self.flags.clear();

        let out = result?;
        Ok(String::from_utf8_lossy(&out).to_string())
    }

    pub fn print(&self) -> Result<String> {
        let out = self.runner.run(
            "parted",
            &["--script", "--machine", "--", self.device.as_str(), "unit", "s", "print"],
        )?;
        Ok(String::from_utf8_lossy(&out).to_string())
    }
}

fn sectors(field: &str) -> Option<u64> {
    field.strip_suffix('s')?.parse().ok()
}

fn machine_fields(line: &str) -> Option<Vec<&str>> {
    let line = line.trim().strip_suffix(';')?;
    Some(line.split(':').collect())
}

pub fn parse_header(print_out: &str) -> Result<PartedHeader> {
    for line in print_out.lines() {
        let Some(fields) = machine_fields(line) else {
            continue;
        };
        if fields.len() < 8 {
            continue;
        }
        let (Some(last_sector), Ok(sector_size)) = (sectors(fields[1]), fields[3].parse::<u64>()) else {
            continue;
        };
        if fields[4].parse::<u64>().is_err() {
            continue;
        }
        return Ok(PartedHeader {
            last_sector,
            sector_size,
            label: fields[5].to_string(),
        });
    }

    Err(SysError::parse("parted header", print_out.trim()))
}

pub fn parse_partitions(print_out: &str) -> Vec<PartedPartition> {
    print_out
        .lines()
        .filter_map(machine_fields)
        .filter(|fields| fields.len() >= 7)
        .filter_map(|fields| {
            let number = fields[0].parse().ok()?;
            let start = sectors(fields[1])?;
            let end = sectors(fields[2])?;
            sectors(fields[3])?;
            Some(PartedPartition {
                number,
                start,
                size: end.checked_sub(start)? + 1,
                name: fields[5].to_string(),
                fs: String::new(),
            })
        })
        .collect()
}
