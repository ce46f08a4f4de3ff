//! Session registry and build task records.
//!
//! Both stores are data-only: expiry is decided by the sweeper, not here. Session
//! status changes go through [`SessionStore::finish`], a compare-and-set from
//! `running` that reports whether this caller performed the transition, so concurrent
//! stop/expire requests for one id agree on a single winner.

mod redis_store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::model::{BuildTask, Session, SessionStatus};

pub use redis_store::{RedisSessionStore, RedisTaskStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::SessionNotFound,
            StoreError::Backend(_) | StoreError::Codec(_) => ErrorKind::Internal,
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Session, StoreError>;

    async fn list(&self) -> Result<Vec<Session>, StoreError>;

    /// Moves a `running` session to `to`. `Ok(false)` when it is absent or already
    /// finished; only one caller ever sees `Ok(true)` for a given session.
    async fn finish(&self, session_id: &str, to: SessionStatus) -> Result<bool, StoreError>;

    /// Removes the record. Absent ids are not an error.
    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn mark_stopped(&self, session_id: &str) -> Result<bool, StoreError> {
        self.finish(session_id, SessionStatus::Stopped).await
    }

    async fn mark_expired(&self, session_id: &str) -> Result<bool, StoreError> {
        self.finish(session_id, SessionStatus::Expired).await
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &BuildTask) -> Result<(), StoreError>;

    async fn save(&self, task: &BuildTask) -> Result<(), StoreError>;

    async fn get(&self, task_id: &str) -> Result<Option<BuildTask>, StoreError>;
}

pub type SessionStoreHandle = Arc<dyn SessionStore>;
pub type TaskStoreHandle = Arc<dyn TaskStore>;

#[derive(Clone)]
pub struct Stores {
    pub sessions: SessionStoreHandle,
    pub tasks: TaskStoreHandle,
    pub backend: &'static str,
}

impl Stores {
    pub fn in_memory(task_retention: Duration) -> Self {
        Self {
            sessions: Arc::new(InMemorySessionStore::new()),
            tasks: Arc::new(InMemoryTaskStore::new(task_retention)),
            backend: "memory",
        }
    }
}

/// Redis when `REDIS_URL` is set and reachable, otherwise in-memory with a warning.
pub async fn build_stores(redis_url: Option<&str>, task_retention: Duration) -> Stores {
    let Some(url) = redis_url else {
        warn!("REDIS_URL not set; sessions and tasks are kept in memory and lost on restart");
        return Stores::in_memory(task_retention);
    };
    match RedisSessionStore::connect(url).await {
        Ok(sessions) => {
            let tasks = RedisTaskStore::new(sessions.connection(), task_retention);
            info!("using redis session store");
            Stores {
                sessions: Arc::new(sessions),
                tasks: Arc::new(tasks),
                backend: "redis",
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to init redis store; falling back to memory");
            Stores::in_memory(task_retention)
        }
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .await
            .insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self.sessions.lock().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn finish(&self, session_id: &str, to: SessionStatus) -> Result<bool, StoreError> {
        let mut guard = self.sessions.lock().await;
        match guard.get_mut(session_id) {
            Some(session) if session.status == SessionStatus::Running => {
                session.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.sessions.lock().await.remove(session_id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Task records kept for `retention` after their last update.
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<String, BuildTask>>,
    retention: Duration,
}

impl InMemoryTaskStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            retention,
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &BuildTask) -> Result<(), StoreError> {
        let retention = chrono::Duration::seconds(self.retention.as_secs() as i64);
        let cutoff = Utc::now() - retention;
        let mut guard = self.tasks.lock().await;
        guard.retain(|_, existing| !existing.status.is_terminal() || existing.updated_at > cutoff);
        guard.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn save(&self, task: &BuildTask) -> Result<(), StoreError> {
        self.tasks
            .lock()
            .await
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<BuildTask>, StoreError> {
        Ok(self.tasks.lock().await.get(task_id).cloned())
    }
}
