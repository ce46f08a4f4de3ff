//! Terminal bridge: relays bytes between a client connection and an interactive
//! shell inside a session's container.
//!
//! The network side is transport-neutral: a [`Stream`] of input chunks (ending when
//! the client goes away) and a [`Sink`] of [`Outbound`] frames. Two pumps run per
//! bridge, one per direction. Whichever side closes first ends the bridge; the
//! other pump is torn down and the client receives a close frame with the reason.
//!
//! Each bridge holds a child of its session's [`CancellationToken`]; teardown
//! cancels the session token, which ends every bridge attached to it.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::metrics;
use crate::model::Session;
use crate::runtime::{ExecStream, RuntimeHandle};
use crate::store::{SessionStoreHandle, StoreError};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no running session {0}")]
    SessionNotFound(String),
    #[error("cannot attach to sandbox: {0}")]
    RuntimeUnavailable(String),
    #[error("terminal relay failed: {0}")]
    Relay(String),
    #[error(transparent)]
    Store(StoreError),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            BridgeError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            BridgeError::Relay(_) => ErrorKind::BridgeError,
            BridgeError::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Frames the bridge sends toward the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Data(Bytes),
    Close(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Exec,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReport {
    pub closed_by: ClosedBy,
    pub reason: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

struct Slot {
    root: CancellationToken,
    generation: u64,
    leases: usize,
}

/// Per-session cancellation roots for attached bridges. An entry lives while at
/// least one [`BridgeLease`] for it does, or until the session is cancelled.
#[derive(Clone, Default)]
pub struct BridgeRegistry {
    sessions: Arc<DashMap<String, Slot>>,
    generations: Arc<AtomicU64>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease(&self, session_id: &str) -> BridgeLease {
        let mut slot = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Slot {
                root: CancellationToken::new(),
                generation: self.generations.fetch_add(1, Ordering::Relaxed),
                leases: 0,
            });
        slot.leases += 1;
        BridgeLease {
            token: slot.root.child_token(),
            session_id: session_id.to_string(),
            generation: slot.generation,
            sessions: self.sessions.clone(),
        }
    }

    /// Ends every bridge on `session_id`. Returns whether any bridge was tracked.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, slot)) => {
                slot.root.cancel();
                true
            }
            None => false,
        }
    }

    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// One bridge's hold on its session's cancellation root.
pub struct BridgeLease {
    token: CancellationToken,
    session_id: String,
    generation: u64,
    sessions: Arc<DashMap<String, Slot>>,
}

impl BridgeLease {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for BridgeLease {
    fn drop(&mut self) {
        let generation = self.generation;
        // A cancelled session may have been re-leased since; only our slot counts.
        self.sessions.remove_if_mut(&self.session_id, |_, slot| {
            if slot.generation != generation {
                return false;
            }
            slot.leases -= 1;
            slot.leases == 0
        });
    }
}

#[derive(Clone)]
pub struct TerminalBridge {
    sessions: SessionStoreHandle,
    runtime: Arc<RuntimeHandle>,
    registry: BridgeRegistry,
}

impl TerminalBridge {
    pub fn new(
        sessions: SessionStoreHandle,
        runtime: Arc<RuntimeHandle>,
        registry: BridgeRegistry,
    ) -> Self {
        Self {
            sessions,
            runtime,
            registry,
        }
    }

    /// The running session behind `session_id`, without touching the container.
    pub async fn check(&self, session_id: &str) -> Result<Session, BridgeError> {
        let session = match self.sessions.get(session_id).await {
            Ok(session) => session,
            Err(StoreError::NotFound(_)) => {
                return Err(BridgeError::SessionNotFound(session_id.to_string()))
            }
            Err(err) => return Err(BridgeError::Store(err)),
        };
        if !session.is_running() {
            return Err(BridgeError::SessionNotFound(session_id.to_string()));
        }
        Ok(session)
    }

    /// Checks the session is running and opens a fresh exec stream into it.
    /// Done before any transport upgrade so refusals reach the client as errors.
    pub async fn prepare(&self, session_id: &str) -> Result<PreparedBridge, BridgeError> {
        let session = self.check(session_id).await?;
        let lease = self.registry.lease(session_id);
        let runtime = self
            .runtime
            .get()
            .await
            .map_err(|err| BridgeError::RuntimeUnavailable(err.to_string()))?;
        let exec = runtime
            .attach_exec(&session.container_id)
            .await
            .map_err(|err| BridgeError::RuntimeUnavailable(err.to_string()))?;
        debug!(session_id = %session_id, container_id = %session.container_id, "exec attached");

        Ok(PreparedBridge {
            session_id: session_id.to_string(),
            exec,
            lease,
        })
    }

    pub async fn attach<I, O>(
        &self,
        session_id: &str,
        inbound: I,
        outbound: O,
    ) -> Result<BridgeReport, BridgeError>
    where
        I: Stream<Item = Bytes> + Send + 'static,
        O: Sink<Outbound> + Send,
        O::Error: Display,
    {
        self.prepare(session_id).await?.run(inbound, outbound).await
    }
}

/// A session check that passed and an exec stream ready to relay.
pub struct PreparedBridge {
    session_id: String,
    exec: ExecStream,
    lease: BridgeLease,
}

struct ActiveGuard;

impl ActiveGuard {
    fn enter() -> Self {
        metrics::BRIDGES_ACTIVE.inc();
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        metrics::BRIDGES_ACTIVE.dec();
    }
}

enum InputEnd {
    ClientClosed,
    Cancelled,
    WriteFailed(std::io::Error),
}

impl PreparedBridge {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Relays until either side closes or the session is torn down. An `Err` means
    /// the shell side failed mid-stream; the client has already been sent a close
    /// frame carrying the reason.
    pub async fn run<I, O>(self, inbound: I, outbound: O) -> Result<BridgeReport, BridgeError>
    where
        I: Stream<Item = Bytes> + Send + 'static,
        O: Sink<Outbound> + Send,
        O::Error: Display,
    {
        let _active = ActiveGuard::enter();
        let PreparedBridge {
            session_id,
            exec,
            lease,
        } = self;
        let cancel = lease.token().clone();
        let ExecStream {
            mut output,
            mut input,
        } = exec;
        let mut outbound = Box::pin(outbound);
        let bytes_in = Arc::new(AtomicU64::new(0));

        let input_cancel = cancel.clone();
        let input_count = bytes_in.clone();
        let mut input_pump = tokio::spawn(async move {
            let mut inbound = Box::pin(inbound);
            loop {
                tokio::select! {
                    biased;
                    _ = input_cancel.cancelled() => return InputEnd::Cancelled,
                    chunk = inbound.next() => {
                        let Some(chunk) = chunk else {
                            let _ = input.shutdown().await;
                            return InputEnd::ClientClosed;
                        };
                        if let Err(err) = input.write_all(&chunk).await {
                            return InputEnd::WriteFailed(err);
                        }
                        if let Err(err) = input.flush().await {
                            return InputEnd::WriteFailed(err);
                        }
                        input_count.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                        metrics::BRIDGE_BYTES
                            .with_label_values(&["in"])
                            .inc_by(chunk.len() as u64);
                    }
                }
            }
        });

        let mut bytes_out = 0u64;
        let mut input_done = false;
        let (closed_by, reason, failure) = loop {
            // Cancellation wins over a shell that ended because teardown stopped it.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break (ClosedBy::Cancelled, Some("session terminated".to_string()), None);
                }
                ended = &mut input_pump => {
                    input_done = true;
                    match ended {
                        Ok(InputEnd::ClientClosed) => break (ClosedBy::Client, None, None),
                        Ok(InputEnd::Cancelled) => {
                            break (ClosedBy::Cancelled, Some("session terminated".to_string()), None)
                        }
                        Ok(InputEnd::WriteFailed(err)) => {
                            let reason = format!("shell input closed: {err}");
                            break (ClosedBy::Exec, Some(reason.clone()), Some(reason));
                        }
                        Err(join) => {
                            let reason = format!("input relay stopped: {join}");
                            break (ClosedBy::Exec, Some(reason.clone()), Some(reason));
                        }
                    }
                }
                chunk = output.next() => match chunk {
                    Some(Ok(data)) => {
                        let len = data.len() as u64;
                        if let Err(err) = outbound.send(Outbound::Data(data)).await {
                            debug!(session_id = %session_id, error = %err, "client sink closed");
                            break (ClosedBy::Client, None, None);
                        }
                        bytes_out += len;
                        metrics::BRIDGE_BYTES.with_label_values(&["out"]).inc_by(len);
                    }
                    Some(Err(err)) => {
                        let reason = format!("shell stream error: {err}");
                        break (ClosedBy::Exec, Some(reason.clone()), Some(reason));
                    }
                    None => break (ClosedBy::Exec, Some("shell exited".to_string()), None),
                },
            }
        };

        if !input_done {
            input_pump.abort();
        }
        drop(output);

        if closed_by != ClosedBy::Client {
            if let Err(err) = outbound.send(Outbound::Close(reason.clone())).await {
                debug!(session_id = %session_id, error = %err, "close frame not delivered");
            }
        }
        let _ = outbound.close().await;

        let report = BridgeReport {
            closed_by,
            reason,
            bytes_in: bytes_in.load(Ordering::Relaxed),
            bytes_out,
        };
        match failure {
            Some(reason) => {
                warn!(session_id = %session_id, reason = %reason, "terminal bridge failed");
                Err(BridgeError::Relay(reason))
            }
            None => {
                info!(
                    session_id = %session_id,
                    closed_by = ?report.closed_by,
                    bytes_in = report.bytes_in,
                    bytes_out = report.bytes_out,
                    "terminal bridge closed"
                );
                Ok(report)
            }
        }
    }
}
