//! Session repository and notification sink ports

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Notification, Session};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Get/put/delete sessions by id.
///
/// The orchestrator treats the store as the source of truth and never
/// caches sessions outside it.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    async fn put(&self, session: Session) -> Result<(), StoreError>;

    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<Session>, StoreError>;

    async fn list_active(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.list().await?.into_iter().filter(|s| s.is_active).collect())
    }
}

/// Append-only delivery of notification records
pub trait NotificationSink: Send + Sync {
    fn publish(&self, session_id: &str, notification: &Notification);
}
