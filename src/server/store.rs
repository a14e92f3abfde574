//! Server-side metadata records, keyed by user and normalized path.

use crate::error::{RbError, Result};
use crate::messages::FileMetadata;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

/// Per-file server state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Set once a transfer has committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
    /// Highest segment written by the transfer in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_segment: Option<u64>,
}

pub trait MetadataStore: Send + Sync {
    fn get(&self, user: &str, path: &str) -> Result<Option<FileRecord>>;
    fn set(&self, user: &str, path: &str, record: FileRecord) -> Result<()>;
    /// Deleting a missing record is not an error.
    fn delete(&self, user: &str, path: &str) -> Result<()>;
    fn list(&self, user: &str) -> Result<Vec<(String, FileRecord)>>;
}

type Records = BTreeMap<String, BTreeMap<String, FileRecord>>;

fn get_in(records: &Records, user: &str, path: &str) -> Option<FileRecord> {
    records.get(user).and_then(|files| files.get(path)).cloned()
}

fn delete_in(records: &mut Records, user: &str, path: &str) -> bool {
    let Some(files) = records.get_mut(user) else {
        return false;
    };
    let removed = files.remove(path).is_some();
    if files.is_empty() {
        records.remove(user);
    }
    removed
}

fn list_in(records: &Records, user: &str) -> Vec<(String, FileRecord)> {
    records
        .get(user)
        .map(|files| files.iter().map(|(p, r)| (p.clone(), r.clone())).collect())
        .unwrap_or_default()
}

/// Volatile store, used by tests and throwaway servers.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn get(&self, user: &str, path: &str) -> Result<Option<FileRecord>> {
        Ok(get_in(&self.records.read(), user, path))
    }

    fn set(&self, user: &str, path: &str, record: FileRecord) -> Result<()> {
        self.records
            .write()
            .entry(user.to_string())
            .or_default()
            .insert(path.to_string(), record);
        Ok(())
    }

    fn delete(&self, user: &str, path: &str) -> Result<()> {
        delete_in(&mut self.records.write(), user, path);
        Ok(())
    }

    fn list(&self, user: &str) -> Result<Vec<(String, FileRecord)>> {
        Ok(list_in(&self.records.read(), user))
    }
}

type Committed = BTreeMap<String, BTreeMap<String, FileMetadata>>;

/// Resume state of one transfer in progress, as stored on disk.
#[derive(Debug, Serialize, Deserialize)]
struct PartialRecord {
    user: String,
    path: String,
    last_segment: u64,
}

/// JSON-backed store.
///
/// Committed metadata lives in one database file that is rewritten only when
/// a commit, a delete or a restarted transfer changes it. The resume state of
/// transfers in progress goes to one small sidecar file per path, so a
/// non-final segment touches nothing shared. Memory is updated only after the
/// matching write reached disk.
pub struct FileStore {
    path: PathBuf,
    partial_dir: PathBuf,
    committed: RwLock<Committed>,
    partial: RwLock<BTreeMap<(String, String), u64>>,
}

impl FileStore {
    /// Open the database at `path`; sidecars live next to it in
    /// `<path>.partial/`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let committed = read_json(&path)?.unwrap_or_default();
        let partial_dir = path.with_extension("partial");
        let partial = load_partials(&partial_dir)?;
        Ok(Self {
            path,
            partial_dir,
            committed: RwLock::new(committed),
            partial: RwLock::new(partial),
        })
    }

    fn sidecar(&self, user: &str, path: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(user.as_bytes());
        hasher.update([0u8]);
        hasher.update(path.as_bytes());
        self.partial_dir.join(format!("{}.json", hex::encode(hasher.finalize())))
    }

    fn set_partial(&self, user: &str, path: &str, last_segment: Option<u64>) -> Result<()> {
        let key = (user.to_string(), path.to_string());
        if self.partial.read().get(&key).copied() == last_segment {
            return Ok(());
        }
        let sidecar = self.sidecar(user, path);
        match last_segment {
            Some(last_segment) => {
                let record = PartialRecord {
                    user: key.0.clone(),
                    path: key.1.clone(),
                    last_segment,
                };
                write_json_atomic(&sidecar, &record)?;
                self.partial.write().insert(key, last_segment);
            }
            None => {
                match std::fs::remove_file(&sidecar) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.partial.write().remove(&key);
            }
        }
        Ok(())
    }

    fn set_committed(&self, user: &str, path: &str, metadata: Option<FileMetadata>) -> Result<()> {
        let mut committed = self.committed.write();
        let current = committed.get(user).and_then(|files| files.get(path)).copied();
        if current == metadata {
            return Ok(());
        }

        let mut next = committed.clone();
        match metadata {
            Some(meta) => {
                next.entry(user.to_string())
                    .or_default()
                    .insert(path.to_string(), meta);
            }
            None => {
                if let Some(files) = next.get_mut(user) {
                    files.remove(path);
                    if files.is_empty() {
                        next.remove(user);
                    }
                }
            }
        }
        write_json_atomic(&self.path, &next)?;
        *committed = next;
        Ok(())
    }
}

fn load_partials(dir: &Path) -> Result<BTreeMap<(String, String), u64>> {
    let mut partial = BTreeMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(partial),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(record) = read_json::<PartialRecord>(&path)? {
            partial.insert((record.user, record.path), record.last_segment);
        }
    }
    Ok(partial)
}

impl MetadataStore for FileStore {
    fn get(&self, user: &str, path: &str) -> Result<Option<FileRecord>> {
        let metadata = self
            .committed
            .read()
            .get(user)
            .and_then(|files| files.get(path))
            .copied();
        let last_segment = self
            .partial
            .read()
            .get(&(user.to_string(), path.to_string()))
            .copied();
        if metadata.is_none() && last_segment.is_none() {
            return Ok(None);
        }
        Ok(Some(FileRecord {
            metadata,
            last_segment,
        }))
    }

    fn set(&self, user: &str, path: &str, record: FileRecord) -> Result<()> {
        // a commit lands before its resume state is dropped
        self.set_committed(user, path, record.metadata)?;
        self.set_partial(user, path, record.last_segment)
    }

    fn delete(&self, user: &str, path: &str) -> Result<()> {
        self.set_partial(user, path, None)?;
        self.set_committed(user, path, None)
    }

    fn list(&self, user: &str) -> Result<Vec<(String, FileRecord)>> {
        let mut records: BTreeMap<String, FileRecord> = self
            .committed
            .read()
            .get(user)
            .map(|files| {
                files
                    .iter()
                    .map(|(p, m)| {
                        let record = FileRecord {
                            metadata: Some(*m),
                            last_segment: None,
                        };
                        (p.clone(), record)
                    })
                    .collect()
            })
            .unwrap_or_default();
        for ((owner, path), last) in self.partial.read().iter() {
            if owner == user {
                records.entry(path.clone()).or_default().last_segment = Some(*last);
            }
        }
        Ok(records.into_iter().collect())
    }
}

/// Parse a JSON file; `None` if it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| RbError::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write JSON through a temp file in the same directory, then rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let data = serde_json::to_vec_pretty(value).map_err(|e| RbError::Internal(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(&data)?;
    tmp.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
    }
    tmp.persist(path).map_err(|e| RbError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn committed(size: u64) -> FileRecord {
        FileRecord {
            metadata: Some(FileMetadata {
                checksum: 1,
                size,
                last_write_time: 2,
                mtime_nanos: 0,
            }),
            last_segment: None,
        }
    }

    #[test]
    fn memory_store_is_scoped_per_user() {
        let store = MemoryStore::new();
        store.set("alice", "a.txt", committed(5)).unwrap();
        store.set("bob", "a.txt", committed(7)).unwrap();

        assert_eq!(store.get("alice", "a.txt").unwrap(), Some(committed(5)));
        assert_eq!(store.list("bob").unwrap().len(), 1);
        store.delete("alice", "a.txt").unwrap();
        store.delete("alice", "a.txt").unwrap();
        assert!(store.list("alice").unwrap().is_empty());
        assert!(store.get("bob", "a.txt").unwrap().is_some());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("files.json");
        {
            let store = FileStore::open(&path).unwrap();
            store.set("alice", "docs/a.txt", committed(5)).unwrap();
            store
                .set(
                    "alice",
                    "partial.bin",
                    FileRecord {
                        metadata: None,
                        last_segment: Some(3),
                    },
                )
                .unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("alice", "docs/a.txt").unwrap(), Some(committed(5)));
        assert_eq!(
            store.get("alice", "partial.bin").unwrap().and_then(|r| r.last_segment),
            Some(3)
        );
    }

    #[test]
    fn resume_state_stays_out_of_the_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("files.json");
        let store = FileStore::open(&path).unwrap();
        let partial = |last| FileRecord {
            metadata: None,
            last_segment: Some(last),
        };

        store.set("alice", "big.bin", partial(0)).unwrap();
        store.set("alice", "big.bin", partial(1)).unwrap();
        assert!(!path.exists());
        let sidecars = || std::fs::read_dir(dir.path().join("files.partial")).unwrap().count();
        assert_eq!(sidecars(), 1);
        assert_eq!(store.list("alice").unwrap(), vec![("big.bin".to_string(), partial(1))]);

        store.set("alice", "big.bin", committed(9)).unwrap();
        assert!(path.exists());
        assert_eq!(sidecars(), 0);
        assert_eq!(store.get("alice", "big.bin").unwrap(), Some(committed(9)));

        store.delete("alice", "big.bin").unwrap();
        assert_eq!(store.get("alice", "big.bin").unwrap(), None);
        let reopened = FileStore::open(&path).unwrap();
        assert!(reopened.list("alice").unwrap().is_empty());
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("files.json");
        let store = FileStore::open(&path).unwrap();
        // the database directory cannot be created over a regular file
        std::fs::write(dir.path().join("db"), b"in the way").unwrap();

        assert!(store.set("alice", "a.txt", committed(5)).is_err());
        let partial = FileRecord {
            metadata: None,
            last_segment: Some(0),
        };
        assert!(store.set("alice", "b.txt", partial).is_err());
        assert_eq!(store.get("alice", "a.txt").unwrap(), None);
        assert_eq!(store.get("alice", "b.txt").unwrap(), None);
        assert!(store.list("alice").unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("files.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(RbError::Config(_))));
    }
}
