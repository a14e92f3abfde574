//! Request handling: authentication, write-guarding and file operations.

use super::auth::CredentialStore;
use super::dispatch::Handler;
use super::fsm::FileSystemManager;
use super::guard::{GuardError, GuardPermit, WriteGuard};
use super::store::MetadataStore;
use crate::error::{RbError, Result};
use crate::messages::{Request, Response};
use crate::protocol::MsgType;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// (user, normalized path)
pub type GuardKey = (String, String);

pub struct RequestHandler {
    credentials: Arc<dyn CredentialStore>,
    fsm: FileSystemManager,
    guard: WriteGuard<GuardKey, usize>,
    running: AtomicBool,
}

impl RequestHandler {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        store: Arc<dyn MetadataStore>,
        root: impl Into<PathBuf>,
        guard_capacity: usize,
    ) -> Self {
        Self {
            credentials,
            fsm: FileSystemManager::new(root, store),
            guard: WriteGuard::new(guard_capacity),
            running: AtomicBool::new(true),
        }
    }

    /// Refuse all further requests.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn guard(&self) -> &WriteGuard<GuardKey, usize> {
        &self.guard
    }

    pub fn fsm(&self) -> &FileSystemManager {
        &self.fsm
    }

    fn lock_path(
        &self,
        user: &str,
        path: &str,
        worker: usize,
    ) -> Result<GuardPermit<'_, GuardKey, usize>> {
        let (key, _) = self.fsm.resolve(user, path)?;
        self.guard
            .try_insert((user.to_string(), key.clone()), worker)
            .map_err(|e| match e {
                GuardError::Occupied(holder) => {
                    RbError::ConcurrentWrite(format!("{user}>{key} is busy on worker {holder}"))
                }
                GuardError::Full => RbError::ConcurrentWrite("too many files in flight".into()),
            })
    }

    fn dispatch(&self, req: &Request, worker: usize) -> Result<Response> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RbError::Stopped);
        }

        let kind = req.kind;
        match kind {
            MsgType::Nop => return Ok(Response::ok(kind)),
            MsgType::Auth => {
                let auth = req
                    .auth
                    .as_ref()
                    .ok_or_else(|| RbError::InvalidRequest("AUTH without credentials".into()))?;
                self.credentials.auth_by_credentials(&auth.user, &auth.pass)?;
                let token = self.credentials.issue_token(&auth.user)?;
                tracing::info!(user = %auth.user, worker, "user authenticated");
                return Ok(Response {
                    token: Some(token),
                    ..Response::ok(kind)
                });
            }
            _ => {}
        }

        let user = self.credentials.user_by_token(&req.token)?;
        tracing::debug!(user = %user, worker, kind = %kind, "request");

        if kind == MsgType::Probe {
            return Ok(Response {
                files: Some(self.fsm.list(&user)?),
                ..Response::ok(kind)
            });
        }

        let segment = req.require_segment()?;
        let _permit = self.lock_path(&user, &segment.path, worker)?;
        match kind {
            MsgType::Upload => self.fsm.write_segment(&user, segment)?,
            MsgType::Remove => {
                self.fsm.remove(&user, &segment.path)?;
                tracing::info!(user = %user, path = %segment.path, "file removed");
            }
            MsgType::Abort => {
                self.fsm.abort(&user, &segment.path)?;
                tracing::info!(user = %user, path = %segment.path, "transfer aborted");
            }
            MsgType::Restore => {
                let data = self.fsm.read_segment(&user, &segment.path, segment.segment_id)?;
                return Ok(Response {
                    segment: Some(data),
                    ..Response::ok(kind)
                });
            }
            MsgType::Auth | MsgType::Nop | MsgType::Probe => {}
        }
        Ok(Response::ok(kind))
    }
}

impl Handler for RequestHandler {
    fn handle(&self, request: Request, worker: usize) -> Response {
        let mut response = match self.dispatch(&request, worker) {
            Ok(response) => response,
            Err(e) => {
                if e.code().is_some() {
                    tracing::warn!(worker, kind = %request.kind, error = %e, "request rejected");
                } else {
                    tracing::error!(worker, kind = %request.kind, error = %e, "request failed");
                }
                Response::failure(request.kind, &e)
            }
        };
        response.is_final = request.is_final;
        response
    }
}
