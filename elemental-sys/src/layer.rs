// SPDX-License-Identifier: GPL-3.0-only

//! OCI layer unpacking with whiteout handling

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::{Result, SysError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// Applies a layer blob stored at `blob` onto `dest`, detecting gzip and zstd
/// compression from the file header
pub fn apply_layer_file(blob: &Path, dest: &Path) -> Result<()> {
    let mut magic = [0u8; 4];
    let read = fs::File::open(blob)?.read(&mut magic)?;
    let magic = &magic[..read];

    let file = BufReader::new(fs::File::open(blob)?);
    if magic.starts_with(&GZIP_MAGIC) {
        debug!("applying gzip layer {}", blob.display());
        apply_layer(GzDecoder::new(file), dest)
    } else if magic.starts_with(&ZSTD_MAGIC) {
        debug!("applying zstd layer {}", blob.display());
        apply_layer(zstd::stream::read::Decoder::new(file)?, dest)
    } else {
        debug!("applying uncompressed layer {}", blob.display());
        apply_layer(file, dest)
    }
}

/// Unpacks a tar stream onto `dest`, honouring `.wh.` whiteouts and opaque
/// directory markers against what earlier layers left behind
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;

    let is_root = unsafe { libc::geteuid() } == 0;
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(is_root);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let mut unpacked: HashSet<PathBuf> = HashSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let Some(normalized) = normalize_entry_path(&raw_path) else {
            debug!("skipping path outside root: {}", raw_path.display());
            continue;
        };
        if normalized.as_os_str().is_empty() {
            continue;
        }

        let full_path = dest.join(&normalized);
        let entry_type = entry.header().entry_type();

        if handle_whiteout(&full_path, entry_type, &unpacked)? {
            continue;
        }

        remove_conflicting(&full_path, entry_type)?;
        trace!("unpacking {}", normalized.display());
        entry.unpack_in(dest)?;
        unpacked.insert(full_path);
    }

    Ok(())
}

fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(c) => components.push(c.to_os_string()),
        }
    }
    Some(components.into_iter().collect())
}

fn handle_whiteout(
    path: &Path,
    entry_type: EntryType,
    unpacked: &HashSet<PathBuf>,
) -> Result<bool> {
    if entry_type != EntryType::Regular {
        return Ok(false);
    }
    let Some(base) = path.file_name().and_then(|name| name.to_str()) else {
        return Ok(false);
    };
    let parent = path
        .parent()
        .ok_or_else(|| SysError::Image(format!("whiteout without parent: {}", path.display())))?;

    if base == OPAQUE_WHITEOUT {
        apply_opaque_whiteout(parent, unpacked)?;
        return Ok(true);
    }

    if let Some(target_name) = base.strip_prefix(WHITEOUT_PREFIX) {
        let target = parent.join(target_name);
        remove_path(&target)?;
        debug!("whiteout removed {}", target.display());
        return Ok(true);
    }

    Ok(false)
}

/// Clears everything below `dir` that this layer did not unpack itself
fn apply_opaque_whiteout(dir: &Path, unpacked: &HashSet<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if unpacked.contains(&path) {
            // Keep the entry, drop lower-layer leftovers inside it
            if path.is_dir() && !path.is_symlink() {
                clear_not_unpacked(&path, unpacked)?;
            }
            continue;
        }
        remove_path(&path)?;
        debug!("opaque whiteout removed {}", path.display());
    }
    Ok(())
}

fn clear_not_unpacked(dir: &Path, unpacked: &HashSet<PathBuf>) -> Result<()> {
    let stale: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| !unpacked.contains(path))
        .collect();
    for path in stale {
        remove_path(&path)?;
    }
    Ok(())
}

fn remove_conflicting(path: &Path, entry_type: EntryType) -> Result<()> {
    let Ok(metadata) = path.symlink_metadata() else {
        return Ok(());
    };
    match (metadata.is_dir(), entry_type == EntryType::Directory) {
        (true, true) => Ok(()),
        (true, false) => Ok(fs::remove_dir_all(path)?),
        (false, _) => Ok(fs::remove_file(path)?),
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    enum TestEntry<'a> {
        Dir(&'a str),
        File(&'a str, &'a [u8]),
        Symlink(&'a str, &'a str),
    }

    fn create_test_tar(entries: &[TestEntry]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for entry in entries {
            let mut header = tar::Header::new_gnu();
            match entry {
                TestEntry::Dir(path) => {
                    header.set_path(path).unwrap();
                    header.set_mode(0o755);
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::File(path, content) => {
                    header.set_path(path).unwrap();
                    header.set_mode(0o644);
                    header.set_size(content.len() as u64);
                    header.set_cksum();
                    builder.append(&header, *content).unwrap();
                }
                TestEntry::Symlink(path, target) => {
                    header.set_path(path).unwrap();
                    header.set_link_name(target).unwrap();
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn stacks_layers_with_whiteouts() {
        let dest = tempfile::tempdir().unwrap();
        let base = create_test_tar(&[
            TestEntry::Dir("etc"),
            TestEntry::File("etc/hostname", b"base"),
            TestEntry::File("etc/obsolete", b"gone soon"),
            TestEntry::Symlink("etc/link", "hostname"),
        ]);
        apply_layer(&base[..], dest.path()).unwrap();

        let upper = create_test_tar(&[
            TestEntry::File("etc/.wh.obsolete", b""),
            TestEntry::File("etc/hostname", b"upper"),
        ]);
        apply_layer(&upper[..], dest.path()).unwrap();

        assert_eq!(fs::read(dest.path().join("etc/hostname")).unwrap(), b"upper");
        assert!(!dest.path().join("etc/obsolete").exists());
        assert!(!dest.path().join("etc/.wh.obsolete").exists());
        assert_eq!(
            fs::read_link(dest.path().join("etc/link")).unwrap(),
            PathBuf::from("hostname")
        );
    }

    #[test]
    fn opaque_marker_hides_lower_layer_content() {
        let dest = tempfile::tempdir().unwrap();
        let base = create_test_tar(&[
            TestEntry::Dir("opt"),
            TestEntry::File("opt/old", b"lower"),
        ]);
        apply_layer(&base[..], dest.path()).unwrap();

        let upper = create_test_tar(&[
            TestEntry::Dir("opt"),
            TestEntry::File("opt/new", b"upper"),
            TestEntry::File("opt/.wh..wh..opq", b""),
        ]);
        apply_layer(&upper[..], dest.path()).unwrap();

        assert!(!dest.path().join("opt/old").exists());
        assert!(dest.path().join("opt/new").exists());
    }

    #[test]
    fn file_replaces_directory_from_lower_layer() {
        let dest = tempfile::tempdir().unwrap();
        apply_layer(
            &create_test_tar(&[TestEntry::Dir("data"), TestEntry::File("data/x", b"x")])[..],
            dest.path(),
        )
        .unwrap();
        apply_layer(
            &create_test_tar(&[TestEntry::File("data", b"now a file")])[..],
            dest.path(),
        )
        .unwrap();
        assert_eq!(fs::read(dest.path().join("data")).unwrap(), b"now a file");
    }

    #[test]
    fn detects_gzip_compressed_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let tar = create_test_tar(&[TestEntry::File("hello", b"world")]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        let blob = dir.path().join("layer.tar.gz");
        fs::write(&blob, encoder.finish().unwrap()).unwrap();

        let dest = dir.path().join("rootfs");
        apply_layer_file(&blob, &dest).unwrap();
        assert_eq!(fs::read(dest.join("hello")).unwrap(), b"world");
    }

    #[test]
    fn detects_zstd_compressed_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let tar = create_test_tar(&[TestEntry::File("hello", b"zstd")]);
        let blob = dir.path().join("layer.tar.zst");
        fs::write(&blob, zstd::stream::encode_all(&tar[..], 0).unwrap()).unwrap();

        let dest = dir.path().join("rootfs");
        apply_layer_file(&blob, &dest).unwrap();
        assert_eq!(fs::read(dest.join("hello")).unwrap(), b"zstd");
    }

    #[test]
    fn normalizes_escaping_paths() {
        assert_eq!(
            normalize_entry_path(Path::new("./etc/../usr/bin")),
            Some(PathBuf::from("usr/bin"))
        );
        assert_eq!(normalize_entry_path(Path::new("../outside")), None);
    }
}
