//! Streaming directory archive.
//!
//! A directory is turned into a flat byte stream that can be produced and
//! consumed incrementally, so arbitrarily large trees never need a temporary
//! file or an in-memory buffer on either side.
//!
//! Layout:
//!
//! ```text
//! MAGIC
//! ( 0x01 | u32 header_len | bincode(EntryHeader) | file bytes )*
//! 0x00                                              end-of-archive
//! ```
//!
//! Entries come in depth-first order with siblings sorted by name, so a
//! directory record always precedes the records of its children.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{Result, TransferError};

pub const ARCHIVE_MAGIC: &[u8; 8] = b"BEAMARC1";
const TAG_END: u8 = 0x00;
const TAG_ENTRY: u8 = 0x01;
const MAX_HEADER_LEN: u32 = 64 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// Per-entry header. `path` is relative to the archived root and always
/// uses `/` as separator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
}

/// What [`deserialize`] created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub directories: u64,
    pub files: u64,
    pub bytes: u64,
}

// ============================================================================
// Serialization
// ============================================================================

/// Lazy archive producer. Implements [`Read`]; each call walks just far
/// enough into the tree to fill the caller's buffer. Restartable only by
/// building a new one.
pub struct ArchiveReader {
    root: PathBuf,
    entries: walkdir::IntoIter,
    pending: Vec<u8>,
    pending_pos: usize,
    current: Option<(File, u64)>,
    finished: bool,
}

/// Starts archiving `root`. Symlinks and special files are skipped.
pub fn serialize(root: &Path) -> Result<ArchiveReader> {
    if !fs::metadata(root)?.is_dir() {
        return Err(TransferError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        )));
    }
    Ok(ArchiveReader {
        root: root.to_path_buf(),
        entries: WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter(),
        pending: ARCHIVE_MAGIC.to_vec(),
        pending_pos: 0,
        current: None,
        finished: false,
    })
}

impl ArchiveReader {
    fn next_record(&mut self) -> io::Result<()> {
        loop {
            let Some(entry) = self.entries.next() else {
                self.pending = vec![TAG_END];
                self.pending_pos = 0;
                self.finished = true;
                return Ok(());
            };
            let entry = entry?;
            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                debug!("Skipping non-regular entry: {:?}", entry.path());
                continue;
            };

            let metadata = entry.metadata()?;
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let header = EntryHeader {
                path: archive_path(relative)?,
                kind,
                size: if kind == EntryKind::File { metadata.len() } else { 0 },
                mode: entry_mode(&metadata, kind),
            };
            debug!("Archiving {:?} {} ({} bytes)", header.kind, header.path, header.size);

            let encoded = bincode::serialize(&header)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.pending.clear();
            self.pending.push(TAG_ENTRY);
            self.pending.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            self.pending.extend_from_slice(&encoded);
            self.pending_pos = 0;

            if kind == EntryKind::File && header.size > 0 {
                self.current = Some((File::open(entry.path())?, header.size));
            }
            return Ok(());
        }
    }
}

impl Read for ArchiveReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pending_pos < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.pending_pos);
                buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                return Ok(n);
            }

            if let Some((file, remaining)) = self.current.as_mut() {
                let limit = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let n = file.read(&mut buf[..limit])?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shrank while being archived",
                    ));
                }
                *remaining -= n as u64;
                if *remaining == 0 {
                    self.current = None;
                }
                return Ok(n);
            }

            if self.finished {
                return Ok(0);
            }
            self.next_record()?;
        }
    }
}

fn archive_path(relative: &Path) -> io::Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("non UTF-8 file name: {part:?}"),
                )
            })?),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected path component in {relative:?}"),
                ))
            }
        }
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn entry_mode(metadata: &fs::Metadata, _kind: EntryKind) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(metadata: &fs::Metadata, kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Directory => 0o755,
        EntryKind::File if metadata.permissions().readonly() => 0o444,
        EntryKind::File => 0o644,
    }
}

// ============================================================================
// Deserialization
// ============================================================================

/// Resolves an archive path under `root`, refusing anything that could land
/// outside it (absolute paths, `..`, drive prefixes).
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut target = root.to_path_buf();
    let mut depth = 0;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::PathEscape(relative.to_string()));
            }
        }
    }
    if depth == 0 {
        return Err(TransferError::ArchiveFormat(format!(
            "entry with empty path {relative:?}"
        )));
    }
    Ok(target)
}

/// Rebuilds a tree under `destination_root` from an archive stream.
///
/// Fails with `ArchiveFormat` on malformed or truncated input and with
/// `PathEscape` if an entry points outside the root; entries after the bad
/// one are never written.
pub fn deserialize<R: Read>(mut reader: R, destination_root: &Path) -> Result<ArchiveSummary> {
    let mut magic = [0u8; 8];
    read_exact_or_format(&mut reader, &mut magic, "archive header")?;
    if &magic != ARCHIVE_MAGIC {
        return Err(TransferError::ArchiveFormat("bad magic".into()));
    }

    fs::create_dir_all(destination_root)?;
    let mut summary = ArchiveSummary::default();
    let mut directory_modes = Vec::new();

    loop {
        let mut tag = [0u8; 1];
        read_exact_or_format(&mut reader, &mut tag, "record tag")?;
        match tag[0] {
            TAG_END => break,
            TAG_ENTRY => {}
            other => {
                return Err(TransferError::ArchiveFormat(format!(
                    "unknown record tag {other:#04x}"
                )))
            }
        }

        let mut len = [0u8; 4];
        read_exact_or_format(&mut reader, &mut len, "header length")?;
        let len = u32::from_be_bytes(len);
        if len == 0 || len > MAX_HEADER_LEN {
            return Err(TransferError::ArchiveFormat(format!(
                "header length {len} out of range"
            )));
        }
        let mut encoded = vec![0u8; len as usize];
        read_exact_or_format(&mut reader, &mut encoded, "entry header")?;
        let header: EntryHeader = bincode::deserialize(&encoded)
            .map_err(|e| TransferError::ArchiveFormat(format!("undecodable header: {e}")))?;

        let target = safe_join(destination_root, &header.path)?;
        match header.kind {
            EntryKind::Directory => {
                debug!("Creating directory: {:?}", target);
                fs::create_dir_all(&target)?;
                directory_modes.push((target, header.mode));
                summary.directories += 1;
            }
            EntryKind::File => {
                debug!("Extracting file: {:?} ({} bytes)", target, header.size);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target)?;
                let copied = io::copy(&mut (&mut reader).take(header.size), &mut out)?;
                if copied != header.size {
                    return Err(TransferError::ArchiveFormat(format!(
                        "{} truncated at {copied} of {} bytes",
                        header.path, header.size
                    )));
                }
                out.sync_all()?;
                set_mode(&target, header.mode)?;
                summary.files += 1;
                summary.bytes += header.size;
            }
        }
    }

    // Applied last so a read-only directory does not block its own children.
    for (dir, mode) in directory_modes.into_iter().rev() {
        set_mode(&dir, mode)?;
    }
    debug!("Extraction complete: {:?}", summary);
    Ok(summary)
}

fn read_exact_or_format<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            TransferError::ArchiveFormat(format!("archive truncated in {what}"))
        }
        _ => TransferError::Io(e),
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("data/nested")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("readme.txt"), b"This is the readme file").unwrap();
        fs::write(root.join("data/data.bin"), vec![0xAA; 10_000]).unwrap();
        fs::write(root.join("data/nested/nested.txt"), b"Nested file content").unwrap();
        fs::write(root.join("data/zero.txt"), b"").unwrap();
    }

    fn archive_bytes(root: &Path) -> Vec<u8> {
        let mut out = Vec::new();
        serialize(root).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    fn raw_entry(path: &str, kind: EntryKind, data: &[u8]) -> Vec<u8> {
        let header = EntryHeader {
            path: path.to_string(),
            kind,
            size: data.len() as u64,
            mode: 0o644,
        };
        let encoded = bincode::serialize(&header).unwrap();
        let mut out = vec![TAG_ENTRY];
        out.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        out.extend_from_slice(&encoded);
        out.extend_from_slice(data);
        out
    }

    // ============================================================================
    // Round Trip Tests
    // ============================================================================

    #[test]
    fn test_round_trip_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        build_tree(src.path());

        let summary = deserialize(Cursor::new(archive_bytes(src.path())), dst.path()).unwrap();
        assert_eq!(summary.files, 4);
        assert_eq!(summary.directories, 3);

        assert_eq!(
            fs::read_to_string(dst.path().join("readme.txt")).unwrap(),
            "This is the readme file"
        );
        assert_eq!(fs::read(dst.path().join("data/data.bin")).unwrap(), vec![0xAA; 10_000]);
        assert_eq!(
            fs::read_to_string(dst.path().join("data/nested/nested.txt")).unwrap(),
            "Nested file content"
        );
        assert!(dst.path().join("empty").is_dir());
        assert_eq!(fs::read(dst.path().join("data/zero.txt")).unwrap().len(), 0);
    }

    #[test]
    fn test_empty_directory_round_trip() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let bytes = archive_bytes(src.path());
        assert_eq!(bytes.len(), ARCHIVE_MAGIC.len() + 1);
        assert_eq!(
            deserialize(Cursor::new(bytes), dst.path()).unwrap(),
            ArchiveSummary::default()
        );
    }

    #[test]
    fn test_output_is_deterministic_and_sorted() {
        let src = tempfile::tempdir().unwrap();
        for name in ["b.txt", "a.txt", "c.txt"] {
            fs::write(src.path().join(name), name).unwrap();
        }
        let first = archive_bytes(src.path());
        assert_eq!(first, archive_bytes(src.path()));

        let a = first.windows(5).position(|w| w == b"a.txt").unwrap();
        let b = first.windows(5).position(|w| w == b"b.txt").unwrap();
        let c = first.windows(5).position(|w| w == b"c.txt").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_serialize_reads_incrementally() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("big.bin"), vec![1u8; 64 * 1024]).unwrap();

        let mut reader = serialize(src.path()).unwrap();
        let mut buf = [0u8; 100];
        let n = reader.read(&mut buf).unwrap();
        assert!(n <= 100);
        assert_eq!(&buf[..8], ARCHIVE_MAGIC);
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_preserved() {
        use std::os::unix::fs::PermissionsExt;
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let script = src.path().join("run.sh");
        fs::write(&script, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();

        deserialize(Cursor::new(archive_bytes(src.path())), dst.path()).unwrap();
        let mode = fs::metadata(dst.path().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    // ============================================================================
    // Malformed Input Tests
    // ============================================================================

    #[test]
    fn test_bad_magic() {
        let dst = tempfile::tempdir().unwrap();
        let err = deserialize(Cursor::new(b"NOTANARCHIVE".to_vec()), dst.path()).unwrap_err();
        assert!(matches!(err, TransferError::ArchiveFormat(_)));
    }

    #[test]
    fn test_missing_end_marker() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"abc").unwrap();
        let mut bytes = archive_bytes(src.path());
        bytes.pop();
        let err = deserialize(Cursor::new(bytes), dst.path()).unwrap_err();
        assert!(matches!(err, TransferError::ArchiveFormat(_)));
    }

    #[test]
    fn test_truncated_file_data() {
        let dst = tempfile::tempdir().unwrap();
        let mut bytes = ARCHIVE_MAGIC.to_vec();
        let mut entry = raw_entry("a.txt", EntryKind::File, b"0123456789");
        entry.truncate(entry.len() - 4);
        bytes.extend(entry);
        let err = deserialize(Cursor::new(bytes), dst.path()).unwrap_err();
        assert!(matches!(err, TransferError::ArchiveFormat(_)));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let dst = tempfile::tempdir().unwrap();
        let mut bytes = ARCHIVE_MAGIC.to_vec();
        bytes.push(TAG_ENTRY);
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = deserialize(Cursor::new(bytes), dst.path()).unwrap_err();
        assert!(matches!(err, TransferError::ArchiveFormat(_)));
    }

    #[test]
    fn test_path_escape_rejected_and_nothing_written_outside() {
        let outer = tempfile::tempdir().unwrap();
        let dst = outer.path().join("dest");

        let mut bytes = ARCHIVE_MAGIC.to_vec();
        bytes.extend(raw_entry("ok.txt", EntryKind::File, b"fine"));
        bytes.extend(raw_entry("../evil.txt", EntryKind::File, b"pwned"));
        bytes.extend(raw_entry("after.txt", EntryKind::File, b"never"));
        bytes.push(TAG_END);

        let err = deserialize(Cursor::new(bytes), &dst).unwrap_err();
        assert!(matches!(err, TransferError::PathEscape(_)));
        assert!(dst.join("ok.txt").exists());
        assert!(!outer.path().join("evil.txt").exists());
        assert!(!dst.join("after.txt").exists());
    }

    #[test]
    fn test_safe_join_variants() {
        let root = Path::new("/srv/dest");
        assert_eq!(safe_join(root, "a/b.txt").unwrap(), root.join("a/b.txt"));
        assert_eq!(safe_join(root, "./a").unwrap(), root.join("a"));
        assert!(matches!(
            safe_join(root, "/etc/passwd"),
            Err(TransferError::PathEscape(_))
        ));
        assert!(matches!(
            safe_join(root, "a/../../b"),
            Err(TransferError::PathEscape(_))
        ));
        assert!(matches!(safe_join(root, ""), Err(TransferError::ArchiveFormat(_))));
    }

    #[test]
    fn test_serialize_rejects_plain_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"x").unwrap();
        assert!(serialize(file.path()).is_err());
    }
}
