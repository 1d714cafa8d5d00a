//! Session store adapters
//!
//! `InMemorySessionStore` for tests and single-process runs, and
//! `FileSessionStore` which keeps one pretty-printed JSON file per session
//! so a stopped process leaves an inspectable record behind.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::domain::Session;
use crate::ports::{SessionStore, StoreError};

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn put(&self, session: Session) -> Result<(), StoreError> {
        self.sessions.write().await.insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }
}

/// JSON file per session under a directory
#[derive(Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
    /// Serializes writers; readers go straight to disk
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Unavailable(format!("invalid session id '{}'", session_id)));
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }

    fn read(path: &Path) -> Result<Option<Session>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Self::read(&self.path_for(session_id)?)
    }

    async fn put(&self, session: Session) -> Result<(), StoreError> {
        let path = self.path_for(&session.id)?;
        let content = serde_json::to_string_pretty(&session)?;

        let _held = self.write_lock.lock().await;
        // Write-then-rename so readers never see a partial file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!("Session {} saved to {}", session.id, path.display());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(session_id)?;
        let _held = self.write_lock.lock().await;
        if path.exists() {
            fs::remove_file(&path)?;
            tracing::info!("Session file deleted: {}", path.display());
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable session file {}: {}", path.display(), e),
            }
        }
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }
}
