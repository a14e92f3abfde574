//! Client side of the transfer protocol.

use super::pool::ConnectionPool;
use super::queue::FileOperation;
use crate::checksum::Crc32;
use crate::error::{RbError, Result};
use crate::messages::{FileMap, FileMetadata, FileSegment, Request, Response};
use crate::protocol::{num_segments, segment_len, MsgType, READ_CHUNK_SIZE};
use crate::protocol_core::{ensure_parent_exists, resolve_under_root};
use filetime::FileTime;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How an upload ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    /// The file is gone; the watcher reports the removal.
    Skipped,
    /// Superseded mid-transfer; the server discarded the partial copy.
    Aborted,
    /// The file no longer matches the queued metadata. Nothing was
    /// committed and the caller should queue the current state.
    Changed,
}

/// Outcome of streaming the segments of one file.
enum Sent {
    Done,
    /// Stopped early after this many segments went out.
    Stopped(UploadOutcome, u64),
}

pub struct Transfer {
    pool: Arc<ConnectionPool>,
    root: PathBuf,
    credentials: RwLock<Option<(String, String)>>,
}

impl Transfer {
    pub fn new(pool: Arc<ConnectionPool>, root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            root: root.into(),
            credentials: RwLock::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Log in and keep the session token for every later request.
    ///
    /// The credentials are remembered so an expired token can be renewed.
    pub fn authenticate(&self, user: &str, pass: &str) -> Result<()> {
        self.login(user, pass)?;
        *self.credentials.write() = Some((user.to_string(), pass.to_string()));
        Ok(())
    }

    fn login(&self, user: &str, pass: &str) -> Result<()> {
        let resp = self.pool.run(Request::auth(user, pass))?.check(MsgType::Auth)?;
        let token = resp
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RbError::Unauthenticated("server issued no token".into()))?;
        self.pool.set_token(token);
        tracing::info!(user, "authenticated");
        Ok(())
    }

    /// Run one request, logging in again once if the server no longer
    /// accepts the session token.
    fn call(&self, request: Request) -> Result<Response> {
        let kind = request.kind;
        let Some((user, pass)) = self.credentials.read().clone() else {
            return self.pool.run(request)?.check(kind);
        };
        match self.pool.run(request.clone())?.check(kind) {
            Err(RbError::Unauthenticated(reason)) => {
                tracing::info!(%reason, "session token rejected, logging in again");
                self.login(&user, &pass)?;
                self.pool.run(request)?.check(kind)
            }
            other => other,
        }
    }

    /// Upload the file behind `op` segment by segment.
    ///
    /// The file is re-checked against the queued size and mtime first, and
    /// its content against the queued checksum while reading. A failed or
    /// interrupted transfer that already sent segments triggers a best-effort
    /// ABORT so the server drops its partial copy.
    pub fn upload(&self, op: &FileOperation) -> Result<UploadOutcome> {
        let full = resolve_under_root(&self.root, &op.path);
        let md = match std::fs::metadata(&full) {
            Ok(md) => md,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %op.path, "file vanished before upload");
                return Ok(UploadOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        let mtime = FileTime::from_last_modification_time(&md);
        let live = FileMetadata {
            checksum: op.metadata.checksum,
            size: md.len(),
            last_write_time: mtime.unix_seconds(),
            mtime_nanos: mtime.nanoseconds(),
        };
        if !op.metadata.same_stat(&live) {
            tracing::debug!(path = %op.path, "stale metadata");
            return Ok(UploadOutcome::Changed);
        }

        let file = File::open(&full)?;
        let result = self.send_segments(op, file);
        let partial = match &result {
            Ok(Sent::Done) => false,
            Ok(Sent::Stopped(_, sent)) => *sent > 0,
            Err(_) => true,
        };
        if partial {
            if let Err(abort_err) = self.abort(&op.path) {
                tracing::warn!(
                    path = %op.path,
                    error = %abort_err,
                    "ABORT after interrupted upload also failed"
                );
            }
        }
        match result? {
            Sent::Done => Ok(UploadOutcome::Uploaded),
            Sent::Stopped(outcome, _) => Ok(outcome),
        }
    }

    fn send_segments(&self, op: &FileOperation, mut file: File) -> Result<Sent> {
        let size = op.metadata.size;
        let total = num_segments(size);
        let mut crc = Crc32::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        tracing::debug!(path = %op.path, size, segments = total, "upload started");
        for index in 0..total {
            let len = segment_len(size, index) as usize;
            let mut data = Vec::with_capacity(len);

            if op.is_aborted() {
                return Ok(Sent::Stopped(UploadOutcome::Aborted, index));
            }
            while data.len() < len {
                if op.is_aborted() {
                    return Ok(Sent::Stopped(UploadOutcome::Aborted, index));
                }
                let want = (len - data.len()).min(READ_CHUNK_SIZE);
                match file.read_exact(&mut chunk[..want]) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                        tracing::debug!(path = %op.path, "file shrank while reading");
                        return Ok(Sent::Stopped(UploadOutcome::Changed, index));
                    }
                    Err(e) => return Err(e.into()),
                }
                crc.update(&chunk[..want]);
                data.extend_from_slice(&chunk[..want]);
            }

            let last = index + 1 == total;
            let metadata = if last {
                if crc.value() != op.metadata.checksum {
                    tracing::debug!(path = %op.path, "content changed while reading");
                    return Ok(Sent::Stopped(UploadOutcome::Changed, index));
                }
                Some(op.metadata)
            } else {
                None
            };

            let segment = FileSegment {
                path: op.path.clone(),
                segment_id: index,
                data,
                metadata,
            };
            self.call(Request::upload(segment))?;
            tracing::trace!(path = %op.path, segment = index, "segment sent");
        }
        Ok(Sent::Done)
    }

    /// Delete `path` on the server. Missing files are fine.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.call(Request::remove(path))?;
        Ok(())
    }

    pub fn abort(&self, path: &str) -> Result<()> {
        self.call(Request::abort(path))?;
        Ok(())
    }

    /// The server's committed view of this user's files.
    pub fn probe(&self) -> Result<FileMap> {
        let resp = self.call(Request::probe())?;
        Ok(resp.files.unwrap_or_default())
    }

    /// Pull every file in `files` into the local root. Stops at the first error.
    pub fn restore(&self, files: &FileMap) -> Result<usize> {
        for (path, meta) in files {
            self.restore_file(path, meta)?;
        }
        tracing::info!(files = files.len(), "restore finished");
        Ok(files.len())
    }

    pub fn restore_file(&self, path: &str, meta: &FileMetadata) -> Result<()> {
        let full = resolve_under_root(&self.root, path);
        ensure_parent_exists(&full)?;

        let total = num_segments(meta.size);
        let mut crc = Crc32::new();
        for index in 0..total {
            let resp = self.call(Request::restore(path, index))?;
            let segment = resp.segment.ok_or_else(|| {
                RbError::InvalidRequest(format!("RESTORE of {path} returned no segment"))
            })?;

            let mut out = if index == 0 {
                File::create(&full)?
            } else {
                OpenOptions::new().append(true).open(&full)?
            };
            out.write_all(&segment.data)?;
            crc.update(&segment.data);
        }

        if crc.value() != meta.checksum {
            return Err(RbError::InvalidChecksum(format!(
                "restored {path}: expected {:08x}, got {:08x}",
                meta.checksum,
                crc.value()
            )));
        }
        let mtime = FileTime::from_unix_time(meta.last_write_time, meta.mtime_nanos);
        filetime::set_file_mtime(&full, mtime)?;
        tracing::debug!(path, size = meta.size, "restored");
        Ok(())
    }
}
