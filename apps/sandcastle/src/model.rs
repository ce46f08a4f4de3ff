use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Image tag a session's sandbox is built under. Teardown removes it again.
pub fn image_tag(session_id: &str) -> String {
    format!("sandcastle/{session_id}:latest")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Cloning,
    Detecting,
    Building,
    Running,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Cloning => "cloning",
            BuildStatus::Detecting => "detecting",
            BuildStatus::Building => "building",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }

    fn next(&self) -> Option<BuildStatus> {
        match self {
            BuildStatus::Pending => Some(BuildStatus::Cloning),
            BuildStatus::Cloning => Some(BuildStatus::Detecting),
            BuildStatus::Detecting => Some(BuildStatus::Building),
            BuildStatus::Building => Some(BuildStatus::Running),
            BuildStatus::Running => Some(BuildStatus::Success),
            BuildStatus::Success | BuildStatus::Failed => None,
        }
    }

    pub fn can_transition_to(&self, to: BuildStatus) -> bool {
        if to == BuildStatus::Failed {
            return matches!(
                self,
                BuildStatus::Pending
                    | BuildStatus::Cloning
                    | BuildStatus::Detecting
                    | BuildStatus::Building
                    | BuildStatus::Running
            );
        }
        self.next() == Some(to)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal task transition {from} -> {to}")]
    Illegal { from: BuildStatus, to: BuildStatus },
    #[error("task cannot succeed without a session")]
    MissingSession,
}

/// One pipeline execution and its append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    pub task_id: String,
    pub repo_url: String,
    pub status: BuildStatus,
    #[serde(default)]
    pub detected_language: Option<String>,
    #[serde(default)]
    pub dependencies: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuildTask {
    pub fn new(repo_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: new_id(),
            repo_url: repo_url.into(),
            status: BuildStatus::Pending,
            detected_language: None,
            dependencies: None,
            logs: vec!["Task queued".to_string()],
            session_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the task one step through its state machine, logging `note`.
    pub fn advance(&mut self, to: BuildStatus, note: impl Into<String>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to,
            });
        }
        if to == BuildStatus::Success && self.session_id.is_none() {
            return Err(TransitionError::MissingSession);
        }
        self.status = to;
        self.log(note);
        Ok(())
    }

    pub fn log(&mut self, chunk: impl Into<String>) {
        self.logs.push(chunk.into());
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(SessionStatus::Running),
            "stopped" => Some(SessionStatus::Stopped),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_count: f64,
    pub memory_bytes: u64,
}

impl ResourceLimits {
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_count * 1_000_000_000.0).round() as i64
    }
}

/// One live sandbox. `expires_at` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub resource_limits: ResourceLimits,
}

impl Session {
    pub fn start(
        session_id: impl Into<String>,
        container_id: impl Into<String>,
        resource_limits: ResourceLimits,
        lifetime: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let lifetime = chrono::Duration::milliseconds(lifetime.as_millis() as i64);
        Self {
            session_id: session_id.into(),
            container_id: container_id.into(),
            created_at: now,
            expires_at: now + lifetime,
            status: SessionStatus::Running,
            resource_limits,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_stage() {
        let mut task = BuildTask::new("https://github.com/a/b");
        for status in [
            BuildStatus::Cloning,
            BuildStatus::Detecting,
            BuildStatus::Building,
            BuildStatus::Running,
        ] {
            task.advance(status, status.as_str()).unwrap();
        }
        assert_eq!(
            task.advance(BuildStatus::Success, "done"),
            Err(TransitionError::MissingSession)
        );
        task.session_id = Some("s-1".into());
        task.advance(BuildStatus::Success, "done").unwrap();
        assert!(task.status.is_terminal());
        assert_eq!(task.logs.len(), 6);
    }

    #[test]
    fn stages_cannot_be_skipped_or_reopened() {
        let mut task = BuildTask::new("https://github.com/a/b");
        assert!(task.advance(BuildStatus::Building, "skip").is_err());
        assert!(task.advance(BuildStatus::Success, "skip").is_err());

        task.advance(BuildStatus::Cloning, "clone").unwrap();
        task.advance(BuildStatus::Failed, "boom").unwrap();
        assert_eq!(
            task.advance(BuildStatus::Cloning, "again"),
            Err(TransitionError::Illegal {
                from: BuildStatus::Failed,
                to: BuildStatus::Cloning
            })
        );
        assert!(task.advance(BuildStatus::Failed, "twice").is_err());
    }

    #[test]
    fn any_unfinished_stage_may_fail() {
        // A worker whose first save was lost still has to end the task.
        assert!(BuildStatus::Pending.can_transition_to(BuildStatus::Failed));
        assert!(BuildStatus::Running.can_transition_to(BuildStatus::Failed));
        assert!(!BuildStatus::Success.can_transition_to(BuildStatus::Failed));
        assert!(!BuildStatus::Failed.can_transition_to(BuildStatus::Failed));
    }

    #[test]
    fn session_expiry_is_exactly_lifetime_after_creation() {
        let now = Utc::now();
        let limits = ResourceLimits {
            cpu_count: 2.0,
            memory_bytes: 2 * 1024 * 1024 * 1024,
        };
        let session = Session::start("s", "c", limits, Duration::from_secs(3600), now);
        assert_eq!(session.expires_at - session.created_at, chrono::Duration::hours(1));
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + chrono::Duration::hours(1)));
        assert_eq!(limits.nano_cpus(), 2_000_000_000);
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::Detecting).unwrap(),
            "\"detecting\""
        );
        assert_eq!(SessionStatus::parse("expired"), Some(SessionStatus::Expired));
        assert_eq!(SessionStatus::parse("gone"), None);
    }
}
