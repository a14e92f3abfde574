//! Credential store: password hashes and session tokens.

use super::store::{read_json, write_json_atomic};
use crate::error::{RbError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Tokens kept per user; older ones stop working.
pub const MAX_TOKENS_PER_USER: usize = 16;

pub trait CredentialStore: Send + Sync {
    /// Fails with `Unauthenticated` on an unknown user or a wrong password.
    fn auth_by_credentials(&self, user: &str, pass: &str) -> Result<()>;
    fn issue_token(&self, user: &str) -> Result<String>;
    /// Fails with `Unauthenticated` if the token is not known.
    fn user_by_token(&self, token: &str) -> Result<String>;
    fn add_user(&self, user: &str, pass: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UserRecord {
    password_sha256: String,
    #[serde(default)]
    tokens: Vec<String>,
}

/// Users persisted as JSON; `in_memory` skips persistence.
pub struct UserStore {
    path: Option<PathBuf>,
    users: RwLock<BTreeMap<String, UserRecord>>,
}

pub fn hash_password(pass: &str) -> String {
    hex::encode(Sha256::digest(pass.as_bytes()))
}

impl UserStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let users = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path: Some(path),
            users: RwLock::new(users),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            users: RwLock::new(BTreeMap::new()),
        }
    }

    /// Store `record` for `user`, in memory only once it is on disk.
    fn commit(
        &self,
        users: &mut BTreeMap<String, UserRecord>,
        user: &str,
        record: UserRecord,
    ) -> Result<()> {
        if let Some(path) = &self.path {
            let mut next = users.clone();
            next.insert(user.to_string(), record.clone());
            write_json_atomic(path, &next)?;
        }
        users.insert(user.to_string(), record);
        Ok(())
    }
}

impl CredentialStore for UserStore {
    fn auth_by_credentials(&self, user: &str, pass: &str) -> Result<()> {
        let users = self.users.read();
        match users.get(user) {
            Some(record) if record.password_sha256 == hash_password(pass) => Ok(()),
            _ => Err(RbError::Unauthenticated(format!("bad credentials for {user}"))),
        }
    }

    fn issue_token(&self, user: &str) -> Result<String> {
        let mut users = self.users.write();
        let mut record = users
            .get(user)
            .cloned()
            .ok_or_else(|| RbError::Unauthenticated(format!("unknown user {user}")))?;
        let token = uuid::Uuid::new_v4().to_string();
        record.tokens.push(token.clone());
        if record.tokens.len() > MAX_TOKENS_PER_USER {
            let excess = record.tokens.len() - MAX_TOKENS_PER_USER;
            record.tokens.drain(..excess);
        }
        self.commit(&mut users, user, record)?;
        Ok(token)
    }

    fn user_by_token(&self, token: &str) -> Result<String> {
        if token.is_empty() {
            return Err(RbError::Unauthenticated("missing token".into()));
        }
        self.users
            .read()
            .iter()
            .find(|(_, record)| record.tokens.iter().any(|t| t == token))
            .map(|(user, _)| user.clone())
            .ok_or_else(|| RbError::Unauthenticated("invalid token".into()))
    }

    fn add_user(&self, user: &str, pass: &str) -> Result<()> {
        let unusable = user.is_empty()
            || user.contains(|c| matches!(c, '/' | '\\' | '\0'))
            || user == "."
            || user == "..";
        if unusable {
            return Err(RbError::InvalidRequest(format!("unusable user name {user:?}")));
        }
        let mut users = self.users.write();
        if users.contains_key(user) {
            return Err(RbError::InvalidRequest(format!("user {user} already exists")));
        }
        let record = UserRecord {
            password_sha256: hash_password(pass),
            tokens: Vec::new(),
        };
        self.commit(&mut users, user, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn credentials_and_tokens() {
        let store = UserStore::in_memory();
        store.add_user("alice", "secret").unwrap();

        assert!(store.auth_by_credentials("alice", "secret").is_ok());
        assert!(matches!(
            store.auth_by_credentials("alice", "nope"),
            Err(RbError::Unauthenticated(_))
        ));
        assert!(store.auth_by_credentials("mallory", "secret").is_err());

        let t1 = store.issue_token("alice").unwrap();
        let t2 = store.issue_token("alice").unwrap();
        assert_ne!(t1, t2);
        assert_eq!(store.user_by_token(&t1).unwrap(), "alice");
        assert_eq!(store.user_by_token(&t2).unwrap(), "alice");
        assert!(store.user_by_token("").is_err());
        assert!(store.user_by_token("bogus").is_err());
    }

    #[test]
    fn duplicate_and_bad_names_are_refused() {
        let store = UserStore::in_memory();
        store.add_user("bob", "x").unwrap();
        assert!(store.add_user("bob", "y").is_err());
        assert!(store.add_user("../evil", "y").is_err());
        assert!(store.add_user("", "y").is_err());
    }

    #[test]
    fn oldest_tokens_expire() {
        let store = UserStore::in_memory();
        store.add_user("carol", "pw").unwrap();
        let first = store.issue_token("carol").unwrap();
        for _ in 0..MAX_TOKENS_PER_USER {
            store.issue_token("carol").unwrap();
        }
        assert!(store.user_by_token(&first).is_err());
    }

    #[test]
    fn users_and_tokens_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.json");
        let token = {
            let store = UserStore::open(&path).unwrap();
            store.add_user("dave", "pw").unwrap();
            store.issue_token("dave").unwrap()
        };
        let store = UserStore::open(&path).unwrap();
        assert!(store.auth_by_credentials("dave", "pw").is_ok());
        assert_eq!(store.user_by_token(&token).unwrap(), "dave");
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("\"pw\""));
    }

    #[test]
    fn unsaved_user_is_not_kept() {
        let dir = TempDir::new().unwrap();
        let store = UserStore::open(dir.path().join("db").join("users.json")).unwrap();
        std::fs::write(dir.path().join("db"), b"not a directory").unwrap();

        assert!(store.add_user("erin", "pw").is_err());
        assert!(store.auth_by_credentials("erin", "pw").is_err());
    }

    #[test]
    fn hash_is_hex_sha256() {
        assert_eq!(
            hash_password("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
