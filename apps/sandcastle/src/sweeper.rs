//! Expiry sweeper: periodically tears down sessions whose lifetime has elapsed,
//! then removes managed containers that no running session accounts for.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::runtime::{RuntimeHandle, LABEL_MANAGED};
use crate::store::SessionStoreHandle;
use crate::teardown::{Teardown, TeardownOutcome, TeardownReason};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Session records looked at.
    pub examined: usize,
    /// Running sessions past `expires_at`.
    pub expired: usize,
    /// Expired sessions this pass moved to `expired`.
    pub reaped: usize,
    pub failures: usize,
    pub orphans_reaped: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    sessions: SessionStoreHandle,
    runtime: Arc<RuntimeHandle>,
    teardown: Teardown,
    interval: Duration,
    orphan_grace: Duration,
}

impl Sweeper {
    pub fn new(
        sessions: SessionStoreHandle,
        runtime: Arc<RuntimeHandle>,
        teardown: Teardown,
        interval: Duration,
        orphan_grace: Duration,
    ) -> Self {
        Self {
            sessions,
            runtime,
            teardown,
            interval,
            orphan_grace,
        }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let sessions = match self.sessions.list().await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(error = %err, "sweep could not list sessions");
                metrics::SWEEP_FAILURES.inc();
                report.failures += 1;
                return report;
            }
        };
        report.examined = sessions.len();

        for session in &sessions {
            // Finished records only linger when a previous teardown failed to delete them.
            let lingering = !session.is_running();
            if !lingering && !session.is_expired(now) {
                continue;
            }
            if !lingering {
                report.expired += 1;
            }
            match self
                .teardown
                .terminate(&session.session_id, TeardownReason::Expired)
                .await
            {
                Ok(TeardownOutcome::Terminated) => report.reaped += 1,
                Ok(outcome) => {
                    debug!(session_id = %session.session_id, ?outcome, "sweep found session already handled")
                }
                Err(err) => {
                    warn!(session_id = %session.session_id, error = %err, "sweep teardown failed");
                    metrics::SWEEP_FAILURES.inc();
                    report.failures += 1;
                }
            }
        }

        self.reconcile(now, &mut report).await;

        if report.reaped > 0 || report.failures > 0 || report.orphans_reaped > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                reaped = report.reaped,
                failures = report.failures,
                orphans_reaped = report.orphans_reaped,
                "sweep finished"
            );
        } else {
            debug!(examined = report.examined, "sweep finished; nothing to reclaim");
        }
        report
    }

    /// Removes managed containers older than the grace period that no running
    /// session references. Younger containers may belong to a build in flight.
    async fn reconcile(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let runtime = match self.runtime.get().await {
            Ok(runtime) => runtime,
            Err(err) => {
                debug!(error = %err, "skipping reconciliation; runtime unavailable");
                return;
            }
        };
        let containers = match runtime.list_by_label(LABEL_MANAGED, "true").await {
            Ok(containers) => containers,
            Err(err) => {
                warn!(error = %err, "reconciliation could not list containers");
                metrics::SWEEP_FAILURES.inc();
                report.failures += 1;
                return;
            }
        };
        if containers.is_empty() {
            return;
        }

        let referenced: HashSet<String> = match self.sessions.list().await {
            Ok(sessions) => sessions
                .into_iter()
                .filter(|session| session.is_running())
                .map(|session| session.container_id)
                .collect(),
            Err(err) => {
                warn!(error = %err, "reconciliation could not list sessions");
                metrics::SWEEP_FAILURES.inc();
                report.failures += 1;
                return;
            }
        };

        let grace = chrono::Duration::milliseconds(self.orphan_grace.as_millis() as i64);
        for container in containers {
            if referenced.contains(&container.id) {
                continue;
            }
            let Some(created_at) = container.created_at else {
                continue;
            };
            if now - created_at < grace {
                continue;
            }
            match runtime.stop_and_remove(&container.id).await {
                Ok(()) => {
                    metrics::ORPHANS_REAPED.inc();
                    report.orphans_reaped += 1;
                    info!(
                        container_id = %container.id,
                        session_id = container.session_id.as_deref().unwrap_or("unknown"),
                        "orphaned container removed"
                    );
                }
                Err(err) => {
                    warn!(container_id = %container.id, error = %err, "orphan removal failed");
                    metrics::SWEEP_FAILURES.inc();
                    report.failures += 1;
                }
            }
        }
    }

    /// Runs a pass every interval until `shutdown` fires. Each pass is its own task,
    /// so a slow pass never delays the next tick.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let pass = sweeper.clone();
                        tokio::spawn(async move {
                            pass.sweep_once(Utc::now()).await;
                        });
                    }
                }
            }
        })
    }
}
