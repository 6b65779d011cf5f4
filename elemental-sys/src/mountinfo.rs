// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SysError};

/// One line of `/proc/self/mountinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
    /// Per-mount options (`rw`, `ro`, `nosuid`, ...)
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|opt| opt == "ro")
    }
}

pub fn read_mount_table() -> Result<Vec<MountEntry>> {
    let mount_info = fs::read_to_string("/proc/self/mountinfo")?;
    parse_mountinfo(&mount_info)
}

/// Last entry mounted on `mount_point`, the one currently visible
pub fn find_mount<'a>(entries: &'a [MountEntry], mount_point: &Path) -> Option<&'a MountEntry> {
    entries
        .iter()
        .rev()
        .find(|entry| entry.mount_point == mount_point)
}

pub fn parse_mountinfo(input: &str) -> Result<Vec<MountEntry>> {
    let mut entries = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let invalid = || SysError::parse("mountinfo line", line);

        let (left, right) = line.split_once(" - ").ok_or_else(invalid)?;

        let mut left_fields = left.split_whitespace();
        let mount_point = left_fields.nth(4).ok_or_else(invalid)?;
        let options = left_fields.next().ok_or_else(invalid)?;

        let mut right_fields = right.split_whitespace();
        let fs_type = right_fields.next().ok_or_else(invalid)?;
        let source = right_fields.next().unwrap_or_default();

        entries.push(MountEntry {
            source: unescape_mount_field(source),
            mount_point: PathBuf::from(unescape_mount_field(mount_point)),
            fs_type: fs_type.to_string(),
            options: options.split(',').map(str::to_string).collect(),
        });
    }

    Ok(entries)
}

fn unescape_mount_field(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..index + 4].iter().all(u8::is_ascii_digit)
            && let Ok(num) = u8::from_str_radix(&value[index + 1..index + 4], 8)
        {
            output.push(num as char);
            index += 4;
            continue;
        }

        output.push(bytes[index] as char);
        index += 1;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "36 25 8:2 / / rw,relatime - ext4 /dev/nvme0n1p2 rw\n\
        37 25 0:5 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw\n\
        90 36 7:0 / /run/cos/imgsrc ro,relatime - ext2 /dev/loop0 ro\n\
        91 36 8:3 / /mnt/with\\040space rw - vfat /dev/sda3 rw\n";

    #[test]
    fn parses_mount_points_and_options() {
        let entries = parse_mountinfo(SAMPLE).expect("parse should succeed");
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].mount_point, PathBuf::from("/"));
        assert_eq!(entries[0].source, "/dev/nvme0n1p2");
        assert_eq!(entries[2].fs_type, "ext2");
        assert!(entries[2].is_read_only());
        assert!(!entries[0].is_read_only());
    }

    #[test]
    fn unescapes_octal_sequences() {
        let entries = parse_mountinfo(SAMPLE).expect("parse should succeed");
        assert_eq!(entries[3].mount_point, PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn finds_topmost_mount() {
        let input = "1 0 8:1 / /mnt rw - ext4 /dev/sda1 rw\n2 1 8:2 / /mnt ro - ext4 /dev/sda2 ro\n";
        let entries = parse_mountinfo(input).expect("parse should succeed");
        let found = find_mount(&entries, Path::new("/mnt")).expect("mount present");
        assert_eq!(found.source, "/dev/sda2");
        assert!(find_mount(&entries, Path::new("/other")).is_none());
    }

    #[test]
    fn rejects_lines_without_separator() {
        assert!(parse_mountinfo("36 25 8:2 / / rw,relatime ext4").is_err());
    }
}
