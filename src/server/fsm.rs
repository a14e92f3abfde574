//! Server-side file storage.
//!
//! Each user owns `<root>/<user>/`. Uploads arrive as numbered segments and
//! must come in order: segment 0 (re)starts a file, every later segment must
//! be exactly one past the last one written. The last segment carries the
//! file metadata; the file is committed only if the checksum recomputed from
//! disk matches.

use super::store::{FileRecord, MetadataStore};
use crate::checksum::file_checksum;
use crate::error::{RbError, Result};
use crate::messages::{FileMap, FileSegment};
use crate::protocol::{num_segments, SEGMENT_SIZE};
use crate::protocol_core::{ensure_parent_exists, normalize_rel, resolve_under_root};
use filetime::FileTime;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct FileSystemManager {
    root: PathBuf,
    store: Arc<dyn MetadataStore>,
}

impl FileSystemManager {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user_root(&self, user: &str) -> PathBuf {
        self.root.join(user)
    }

    /// Normalized key and on-disk location of `path` for `user`.
    pub fn resolve(&self, user: &str, path: &str) -> Result<(String, PathBuf)> {
        let key = normalize_rel(path)?;
        let full = resolve_under_root(&self.user_root(user), &key);
        Ok((key, full))
    }

    pub fn write_segment(&self, user: &str, segment: &FileSegment) -> Result<()> {
        let (key, full) = self.resolve(user, &segment.path)?;
        let id = segment.segment_id;
        let mut record = self.store.get(user, &key)?.unwrap_or_default();

        if id != 0 {
            match record.last_segment {
                Some(last) if id == last + 1 => {}
                Some(last) => {
                    return Err(RbError::WrongSegment(format!(
                        "{key}: expected segment {}, got {id}",
                        last + 1
                    )))
                }
                None => {
                    return Err(RbError::WrongSegment(format!(
                        "{key}: no transfer in progress, got segment {id}"
                    )))
                }
            }
        }
        if let Some(meta) = &segment.metadata {
            let expected = num_segments(meta.size);
            if id + 1 != expected {
                return Err(RbError::WrongSegment(format!(
                    "{key}: metadata on segment {id} of {expected}"
                )));
            }
        }
        if segment.data.len() as u64 > SEGMENT_SIZE {
            return Err(RbError::InvalidRequest(format!(
                "{key}: segment of {} bytes exceeds {SEGMENT_SIZE}",
                segment.data.len()
            )));
        }

        ensure_parent_exists(&full)?;
        let mut file = if id == 0 {
            File::create(&full)?
        } else {
            OpenOptions::new().append(true).open(&full)?
        };
        file.write_all(&segment.data)?;
        file.sync_data()?;
        drop(file);

        if id == 0 {
            // whatever was committed before is gone now
            record.metadata = None;
        }

        let Some(meta) = segment.metadata else {
            record.last_segment = Some(id);
            self.store.set(user, &key, record)?;
            tracing::debug!(user, path = %key, segment = id, "segment stored");
            return Ok(());
        };

        let checksum = file_checksum(&full)?;
        let size = std::fs::metadata(&full)?.len();
        if checksum != meta.checksum || size != meta.size {
            remove_if_exists(&full)?;
            self.store.delete(user, &key)?;
            return Err(RbError::InvalidChecksum(format!(
                "{key}: expected {:08x}/{} bytes, stored {:08x}/{} bytes",
                meta.checksum, meta.size, checksum, size
            )));
        }

        let mtime = FileTime::from_unix_time(meta.last_write_time, meta.mtime_nanos);
        filetime::set_file_mtime(&full, mtime)?;
        self.store.set(
            user,
            &key,
            FileRecord {
                metadata: Some(meta),
                last_segment: None,
            },
        )?;
        tracing::info!(user, path = %key, size, "file committed");
        Ok(())
    }

    /// Delete the stored file and its record. Missing files are fine.
    pub fn remove(&self, user: &str, path: &str) -> Result<()> {
        let (key, full) = self.resolve(user, path)?;
        remove_if_exists(&full)?;
        self.store.delete(user, &key)?;
        Ok(())
    }

    /// Drop a partial transfer, including its resume state.
    pub fn abort(&self, user: &str, path: &str) -> Result<()> {
        self.remove(user, path)
    }

    /// Segment `segment_id` of a stored file; empty at exactly end-of-file.
    pub fn read_segment(&self, user: &str, path: &str, segment_id: u64) -> Result<FileSegment> {
        let (key, full) = self.resolve(user, path)?;
        let mut file = match File::open(&full) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RbError::InvalidRequest(format!("{key} is not stored")))
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        let offset = segment_id
            .checked_mul(SEGMENT_SIZE)
            .filter(|off| *off <= len)
            .ok_or_else(|| {
                RbError::SegmentOutOfRange(format!("{key}: segment {segment_id} past {len} bytes"))
            })?;

        file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity((len - offset).min(SEGMENT_SIZE) as usize);
        file.take(SEGMENT_SIZE).read_to_end(&mut data)?;
        Ok(FileSegment {
            path: key,
            segment_id,
            data,
            metadata: None,
        })
    }

    /// Committed files of `user`.
    pub fn list(&self, user: &str) -> Result<FileMap> {
        Ok(self
            .store
            .list(user)?
            .into_iter()
            .filter_map(|(path, record)| record.metadata.map(|m| (path, m)))
            .collect())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_bytes;
    use crate::messages::FileMetadata;
    use crate::server::store::MemoryStore;
    use tempfile::TempDir;

    fn fsm() -> (TempDir, FileSystemManager) {
        let dir = TempDir::new().unwrap();
        let fsm = FileSystemManager::new(dir.path(), Arc::new(MemoryStore::new()));
        (dir, fsm)
    }

    fn seg(path: &str, id: u64, data: &[u8], meta: Option<FileMetadata>) -> FileSegment {
        FileSegment {
            path: path.into(),
            segment_id: id,
            data: data.to_vec(),
            metadata: meta,
        }
    }

    fn meta_for(content: &[u8]) -> FileMetadata {
        FileMetadata {
            checksum: checksum_bytes(content),
            size: content.len() as u64,
            last_write_time: 1_650_000_000,
            mtime_nanos: 0,
        }
    }

    fn three_segment_content() -> Vec<u8> {
        (0..(2 * SEGMENT_SIZE + SEGMENT_SIZE / 2))
            .map(|i| (i % 253) as u8)
            .collect()
    }

    #[test]
    fn single_segment_commit() {
        let (dir, fsm) = fsm();
        fsm.write_segment("alice", &seg("/docs/a.txt", 0, b"hello", Some(meta_for(b"hello"))))
            .unwrap();

        let on_disk = dir.path().join("alice/docs/a.txt");
        assert_eq!(std::fs::read(&on_disk).unwrap(), b"hello");
        let md = std::fs::metadata(&on_disk).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&md).unix_seconds(), 1_650_000_000);

        let files = fsm.list("alice").unwrap();
        assert_eq!(files["docs/a.txt"], meta_for(b"hello"));
        assert!(fsm.list("bob").unwrap().is_empty());
    }

    #[test]
    fn zero_length_file_commits_with_zero_checksum() {
        let (_dir, fsm) = fsm();
        let meta = meta_for(b"");
        assert_eq!(meta.checksum, 0);
        fsm.write_segment("alice", &seg("empty", 0, b"", Some(meta))).unwrap();
        assert_eq!(fsm.list("alice").unwrap()["empty"].size, 0);
    }

    #[test]
    fn resume_requires_exact_next_segment() {
        let (_dir, fsm) = fsm();
        let content = three_segment_content();
        let s = SEGMENT_SIZE as usize;

        fsm.write_segment("u", &seg("big", 0, &content[..s], None)).unwrap();
        assert!(matches!(
            fsm.write_segment("u", &seg("big", 2, &content[2 * s..], Some(meta_for(&content)))),
            Err(RbError::WrongSegment(_))
        ));
        fsm.write_segment("u", &seg("big", 1, &content[s..2 * s], None)).unwrap();
        // repeating an index is not "next" either
        assert!(matches!(
            fsm.write_segment("u", &seg("big", 1, &content[s..2 * s], None)),
            Err(RbError::WrongSegment(_))
        ));
        fsm.write_segment("u", &seg("big", 2, &content[2 * s..], Some(meta_for(&content))))
            .unwrap();

        let (_, full) = fsm.resolve("u", "big").unwrap();
        assert_eq!(std::fs::read(full).unwrap(), content);
    }

    #[test]
    fn segment_zero_restarts_cleanly() {
        let (_dir, fsm) = fsm();
        let content = three_segment_content();
        let s = SEGMENT_SIZE as usize;
        fsm.write_segment("u", &seg("f", 0, &content[..s], None)).unwrap();
        fsm.write_segment("u", &seg("f", 1, &content[s..2 * s], None)).unwrap();

        fsm.write_segment("u", &seg("f", 0, b"fresh", Some(meta_for(b"fresh"))))
            .unwrap();
        let (_, full) = fsm.resolve("u", "f").unwrap();
        assert_eq!(std::fs::read(full).unwrap(), b"fresh");
    }

    #[test]
    fn non_zero_segment_without_transfer_is_wrong() {
        let (_dir, fsm) = fsm();
        fsm.write_segment("u", &seg("f", 0, b"x", Some(meta_for(b"x")))).unwrap();
        assert!(matches!(
            fsm.write_segment("u", &seg("f", 1, b"y", None)),
            Err(RbError::WrongSegment(_))
        ));
    }

    #[test]
    fn metadata_on_non_final_segment_is_wrong() {
        let (_dir, fsm) = fsm();
        let content = three_segment_content();
        let s = SEGMENT_SIZE as usize;
        assert!(matches!(
            fsm.write_segment("u", &seg("f", 0, &content[..s], Some(meta_for(&content)))),
            Err(RbError::WrongSegment(_))
        ));
    }

    #[test]
    fn checksum_mismatch_discards_everything() {
        let (_dir, fsm) = fsm();
        let mut bad = meta_for(b"hello");
        bad.checksum ^= 1;
        assert!(matches!(
            fsm.write_segment("u", &seg("a", 0, b"hello", Some(bad))),
            Err(RbError::InvalidChecksum(_))
        ));
        let (_, full) = fsm.resolve("u", "a").unwrap();
        assert!(!full.exists());
        assert!(fsm.list("u").unwrap().is_empty());
    }

    #[test]
    fn bad_paths_are_rejected_before_writing() {
        let (dir, fsm) = fsm();
        assert!(matches!(
            fsm.write_segment("u", &seg("../escape", 0, b"x", Some(meta_for(b"x")))),
            Err(RbError::ForbiddenPath(_))
        ));
        assert!(matches!(
            fsm.write_segment("u", &seg("dir/", 0, b"x", Some(meta_for(b"x")))),
            Err(RbError::MalformedPath(_))
        ));
        assert!(!dir.path().join("escape").exists());
        assert!(!dir.path().join("u").exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, fsm) = fsm();
        fsm.write_segment("u", &seg("a", 0, b"x", Some(meta_for(b"x")))).unwrap();
        fsm.remove("u", "a").unwrap();
        fsm.remove("u", "a").unwrap();
        assert!(fsm.list("u").unwrap().is_empty());
    }

    #[test]
    fn abort_clears_resume_state() {
        let (_dir, fsm) = fsm();
        let content = three_segment_content();
        let s = SEGMENT_SIZE as usize;
        fsm.write_segment("u", &seg("f", 0, &content[..s], None)).unwrap();
        fsm.abort("u", "f").unwrap();
        assert!(matches!(
            fsm.write_segment("u", &seg("f", 1, &content[s..2 * s], None)),
            Err(RbError::WrongSegment(_))
        ));
    }

    #[test]
    fn read_segments_and_range_check() {
        let (_dir, fsm) = fsm();
        let content = three_segment_content();
        let s = SEGMENT_SIZE as usize;
        for (i, chunk) in content.chunks(s).enumerate() {
            let meta = (i == 2).then(|| meta_for(&content));
            fsm.write_segment("u", &seg("f", i as u64, chunk, meta)).unwrap();
        }

        assert_eq!(fsm.read_segment("u", "f", 0).unwrap().data, &content[..s]);
        assert_eq!(fsm.read_segment("u", "f", 2).unwrap().data, &content[2 * s..]);
        assert!(matches!(
            fsm.read_segment("u", "f", 3),
            Err(RbError::SegmentOutOfRange(_))
        ));
        assert!(matches!(
            fsm.read_segment("u", "f", u64::MAX),
            Err(RbError::SegmentOutOfRange(_))
        ));
    }
}
