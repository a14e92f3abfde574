//! Polling filesystem watcher
//!
//! The tree under the client root is walked with `walkdir`, every regular file
//! is described by its [`FileMetadata`], and two snapshots are diffed to
//! produce change events. Checksums are recomputed only for files whose size
//! or mtime moved since the previous snapshot.

use crate::checksum::file_checksum;
use crate::error::Result;
use crate::messages::{FileMap, FileMetadata};
use crate::protocol_core::key_for;
use filetime::FileTime;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

/// Relative key -> metadata for every regular file under a root.
pub type Snapshot = BTreeMap<String, FileMetadata>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: String,
    pub metadata: FileMetadata,
    pub status: FileStatus,
}

impl FileEvent {
    fn new(path: &str, metadata: FileMetadata, status: FileStatus) -> Self {
        Self {
            path: path.to_string(),
            metadata,
            status,
        }
    }
}

/// Size and mtime of `md`; the checksum is left at zero.
fn stat_of(md: &std::fs::Metadata) -> FileMetadata {
    let mtime = FileTime::from_last_modification_time(md);
    FileMetadata {
        checksum: 0,
        size: md.len(),
        last_write_time: mtime.unix_seconds(),
        mtime_nanos: mtime.nanoseconds(),
    }
}

/// Stat a file and checksum its content.
pub fn file_metadata(path: &Path) -> Result<FileMetadata> {
    let md = std::fs::metadata(path)?;
    Ok(FileMetadata {
        checksum: file_checksum(path)?,
        ..stat_of(&md)
    })
}

/// Walk `root` and describe every regular file.
///
/// Entries of `previous` whose size and mtime (to the nanosecond) are
/// unchanged keep their checksum. Files that vanish or cannot be read mid-walk are left out.
pub fn scan(root: &Path, previous: &Snapshot) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(key) = key_for(root, entry.path()) else {
            continue;
        };
        let Ok(md) = entry.metadata() else {
            continue;
        };
        let stat = stat_of(&md);

        let checksum = match previous.get(&key) {
            Some(prev) if prev.same_stat(&stat) => prev.checksum,
            _ => match file_checksum(entry.path()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(
                        path = %entry.path().display(),
                        error = %e,
                        "skipping unreadable file"
                    );
                    continue;
                }
            },
        };

        snapshot.insert(key, FileMetadata { checksum, ..stat });
    }

    Ok(snapshot)
}

/// Changes between two local snapshots.
///
/// A file only counts as modified when its content checksum changed; an
/// mtime bump alone is ignored.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<FileEvent> {
    let mut events = Vec::new();

    for (path, meta) in old {
        if !new.contains_key(path) {
            events.push(FileEvent::new(path, *meta, FileStatus::Removed));
        }
    }
    for (path, meta) in new {
        match old.get(path) {
            None => events.push(FileEvent::new(path, *meta, FileStatus::Created)),
            Some(prev) if prev.checksum != meta.checksum || prev.size != meta.size => {
                events.push(FileEvent::new(path, *meta, FileStatus::Modified))
            }
            Some(_) => {}
        }
    }

    events
}

/// Events that bring the server's view in line with the local one.
///
/// Server-only files are removed, client-only files are created, and files on
/// both sides are re-sent when both the mtime and the checksum differ.
pub fn reconcile(local: &Snapshot, server: &FileMap) -> Vec<FileEvent> {
    let mut events = Vec::new();

    for (path, remote) in server {
        match local.get(path) {
            None => events.push(FileEvent::new(path, FileMetadata::default(), FileStatus::Removed)),
            Some(meta)
                if meta.last_write_time != remote.last_write_time
                    && meta.checksum != remote.checksum =>
            {
                events.push(FileEvent::new(path, *meta, FileStatus::Modified))
            }
            Some(_) => {}
        }
    }
    for (path, meta) in local {
        if !server.contains_key(path) {
            events.push(FileEvent::new(path, *meta, FileStatus::Created));
        }
    }

    events
}
