use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::BridgeRegistry;
use crate::error::ErrorKind;
use crate::metrics;
use crate::model::{self, SessionStatus};
use crate::runtime::{RuntimeError, RuntimeHandle};
use crate::store::{SessionStoreHandle, StoreError};

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TeardownError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TeardownError::Runtime(err) => err.kind(),
            TeardownError::Store(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownReason {
    Stopped,
    Expired,
}

impl TeardownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeardownReason::Stopped => "stopped",
            TeardownReason::Expired => "expired",
        }
    }

    fn status(&self) -> SessionStatus {
        match self {
            TeardownReason::Stopped => SessionStatus::Stopped,
            TeardownReason::Expired => SessionStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownOutcome {
    /// This call moved the session out of RUNNING.
    Terminated,
    /// Someone else finished the session while this call was cleaning up.
    AlreadyFinished,
    /// No record for the id.
    AlreadyGone,
}

/// Shared termination path for explicit stops and the sweeper. Safe to run
/// concurrently for the same session: every step is idempotent and only one
/// caller wins the status transition.
#[derive(Clone)]
pub struct Teardown {
    sessions: SessionStoreHandle,
    runtime: Arc<RuntimeHandle>,
    bridges: BridgeRegistry,
}

impl Teardown {
    pub fn new(
        sessions: SessionStoreHandle,
        runtime: Arc<RuntimeHandle>,
        bridges: BridgeRegistry,
    ) -> Self {
        Self {
            sessions,
            runtime,
            bridges,
        }
    }

    /// On a runtime error the record is left RUNNING so a later call can retry.
    pub async fn terminate(
        &self,
        session_id: &str,
        reason: TeardownReason,
    ) -> Result<TeardownOutcome, TeardownError> {
        let session = match self.sessions.get(session_id).await {
            Ok(session) => session,
            Err(StoreError::NotFound(_)) => {
                debug!(session_id = %session_id, "teardown of unknown session");
                self.bridges.cancel(session_id);
                return Ok(TeardownOutcome::AlreadyGone);
            }
            Err(err) => return Err(err.into()),
        };

        if self.bridges.cancel(session_id) {
            debug!(session_id = %session_id, "terminal bridges cancelled");
        }

        let runtime = self.runtime.get().await?;
        runtime.stop_and_remove(&session.container_id).await?;
        if let Err(err) = runtime.remove_image(&model::image_tag(session_id)).await {
            warn!(session_id = %session_id, error = %err, "image removal failed");
        }

        let won = self.sessions.finish(session_id, reason.status()).await?;
        self.sessions.delete(session_id).await?;

        if won {
            metrics::SESSIONS_REAPED
                .with_label_values(&[reason.as_str()])
                .inc();
            info!(
                session_id = %session_id,
                container_id = %session.container_id,
                reason = reason.as_str(),
                "session terminated"
            );
            Ok(TeardownOutcome::Terminated)
        } else {
            debug!(session_id = %session_id, "session already finished by another caller");
            Ok(TeardownOutcome::AlreadyFinished)
        }
    }
}
