use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::{SessionStore, StoreError, TaskStore};
use crate::model::{BuildTask, Session, SessionStatus};

const SESSIONS_INDEX: &str = "sandcastle:sessions";

// Status lives in its own hash field so the CAS never rewrites the JSON record.
const FINISH_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if current == ARGV[1] then
  redis.call('HSET', KEYS[1], 'status', ARGV[2])
  return 1
end
return 0
"#;

fn session_key(session_id: &str) -> String {
    format!("sandcastle:session:{session_id}")
}

fn task_key(task_id: &str) -> String {
    format!("sandcastle:task:{task_id}")
}

pub struct RedisSessionStore {
    redis: ConnectionManager,
    finish: Script,
}

impl RedisSessionStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            finish: Script::new(FINISH_SCRIPT),
        })
    }

    /// Shared multiplexed connection; clones are cheap handles to the same socket.
    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }

    async fn load(
        &self,
        conn: &mut ConnectionManager,
        session_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let fields: HashMap<String, String> = conn.hgetall(session_key(session_id)).await?;
        let Some(record) = fields.get("record") else {
            return Ok(None);
        };
        let mut session: Session = serde_json::from_str(record)?;
        if let Some(status) = fields.get("status").and_then(|raw| SessionStatus::parse(raw)) {
            session.status = status;
        }
        Ok(Some(session))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let key = session_key(&session.session_id);
        let record = serde_json::to_string(&session)?;
        let _: () = redis::pipe()
            .atomic()
            .hset(&key, "record", record)
            .ignore()
            .hset(&key, "status", session.status.as_str())
            .ignore()
            .sadd(SESSIONS_INDEX, &session.session_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        let mut conn = self.redis.clone();
        self.load(&mut conn, session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(SESSIONS_INDEX).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&mut conn, &id).await? {
                Some(session) => out.push(session),
                None => {
                    // Index entry outlived its record (delete raced the SADD).
                    let _: () = conn.srem(SESSIONS_INDEX, &id).await?;
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn finish(&self, session_id: &str, to: SessionStatus) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let won: i64 = self
            .finish
            .key(session_key(session_id))
            .arg(SessionStatus::Running.as_str())
            .arg(to.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(won == 1)
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(session_key(session_id))
            .ignore()
            .srem(SESSIONS_INDEX, session_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Task records as JSON strings that expire `retention` after their last save.
pub struct RedisTaskStore {
    redis: ConnectionManager,
    retention_secs: u64,
}

impl RedisTaskStore {
    pub fn new(redis: ConnectionManager, retention: Duration) -> Self {
        Self {
            redis,
            retention_secs: retention.as_secs().max(1),
        }
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn insert(&self, task: &BuildTask) -> Result<(), StoreError> {
        self.save(task).await
    }

    async fn save(&self, task: &BuildTask) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(task)?;
        conn.set_ex::<_, _, ()>(task_key(&task.task_id), value, self.retention_secs)
            .await?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<BuildTask>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(task_key(task_id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
