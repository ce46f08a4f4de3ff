use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{ContainerRuntime, DockerRuntime, RuntimeError};

pub type RuntimeFactory = Arc<
    dyn Fn() -> BoxFuture<'static, Result<Arc<dyn ContainerRuntime>, RuntimeError>> + Send + Sync,
>;

type Outcome = Result<Arc<dyn ContainerRuntime>, String>;

/// Process-wide container runtime client, built on first use.
///
/// Concurrent first callers wait on the same construction and share its outcome.
/// A failed construction is cached too: every caller gets the same error until
/// [`RuntimeHandle::reset`] arms a fresh attempt.
pub struct RuntimeHandle {
    factory: RuntimeFactory,
    cell: Mutex<Arc<OnceCell<Outcome>>>,
    constructions: AtomicUsize,
}

impl RuntimeHandle {
    pub fn new(factory: RuntimeFactory) -> Self {
        Self {
            factory,
            cell: Mutex::new(Arc::new(OnceCell::new())),
            constructions: AtomicUsize::new(0),
        }
    }

    pub fn docker(docker_host: Option<String>) -> Self {
        Self::new(Arc::new(move || {
            let docker_host = docker_host.clone();
            async move {
                let runtime = DockerRuntime::connect(docker_host.as_deref()).await?;
                Ok(Arc::new(runtime) as Arc<dyn ContainerRuntime>)
            }
            .boxed()
        }))
    }

    /// Handle around an already constructed runtime.
    pub fn ready(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let handle = Self::new(Arc::new(|| {
            async { Err(RuntimeError::Unavailable("runtime was reset".into())) }.boxed()
        }));
        let cell = OnceCell::new_with(Some(Ok(runtime)));
        *handle.cell.lock() = Arc::new(cell);
        handle
    }

    pub async fn get(&self) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        let cell = self.cell.lock().clone();
        let outcome = cell
            .get_or_init(|| async {
                self.constructions.fetch_add(1, Ordering::SeqCst);
                match (self.factory)().await {
                    Ok(runtime) => {
                        info!("container runtime client ready");
                        Ok(runtime)
                    }
                    Err(err) => {
                        warn!(error = %err, "container runtime client construction failed");
                        Err(err.to_string())
                    }
                }
            })
            .await;
        outcome.clone().map_err(RuntimeError::Unavailable)
    }

    /// Cached construction failure, if the last attempt failed.
    pub fn failure(&self) -> Option<String> {
        let cell = self.cell.lock().clone();
        match cell.get() {
            Some(Err(reason)) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Drops the cached outcome so the next `get` constructs again.
    pub fn reset(&self) {
        *self.cell.lock() = Arc::new(OnceCell::new());
    }

    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceLimits;
    use crate::runtime::{BuildRequest, ExecStream, LogSink, ManagedContainer};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct Inert;

    #[async_trait]
    impl ContainerRuntime for Inert {
        async fn ping(&self) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn build_image(&self, _: BuildRequest, _: LogSink) -> Result<String, RuntimeError> {
            Ok("img".into())
        }
        async fn remove_image(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn run_container(
            &self,
            _: &str,
            _: &str,
            _: ResourceLimits,
            _: HashMap<String, String>,
        ) -> Result<String, RuntimeError> {
            Ok("c".into())
        }
        async fn attach_exec(&self, _: &str) -> Result<ExecStream, RuntimeError> {
            Err(RuntimeError::Engine("inert".into()))
        }
        async fn stop_and_remove(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn list_by_label(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Vec<ManagedContainer>, RuntimeError> {
            Ok(Vec::new())
        }
    }

    fn slow_factory(fail: Arc<AtomicBool>) -> RuntimeFactory {
        Arc::new(move || {
            let fail = fail.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if fail.load(Ordering::SeqCst) {
                    Err(RuntimeError::Unavailable("engine down".into()))
                } else {
                    Ok(Arc::new(Inert) as Arc<dyn ContainerRuntime>)
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn concurrent_first_use_constructs_once_and_shares() {
        let handle = Arc::new(RuntimeHandle::new(slow_factory(Arc::new(AtomicBool::new(false)))));
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.get().await }));
        }
        let mut clients = Vec::new();
        for task in tasks {
            clients.push(task.await.unwrap().unwrap());
        }
        assert_eq!(handle.constructions(), 1);
        assert!(clients.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[tokio::test]
    async fn failure_is_cached_until_reset() {
        let fail = Arc::new(AtomicBool::new(true));
        let handle = Arc::new(RuntimeHandle::new(slow_factory(fail.clone())));

        let (a, b) = tokio::join!(handle.get(), handle.get());
        assert!(matches!(a, Err(RuntimeError::Unavailable(ref m)) if m.contains("engine down")));
        assert!(b.is_err());
        assert!(handle.get().await.is_err());
        assert_eq!(handle.constructions(), 1);
        assert!(handle.failure().is_some());

        fail.store(false, Ordering::SeqCst);
        assert!(handle.get().await.is_err(), "no silent retry without reset");

        handle.reset();
        assert!(handle.get().await.is_ok());
        assert_eq!(handle.constructions(), 2);
        assert!(handle.failure().is_none());
    }

    #[tokio::test]
    async fn ready_handle_never_constructs() {
        let handle = RuntimeHandle::ready(Arc::new(Inert));
        handle.get().await.unwrap().ping().await.unwrap();
        assert_eq!(handle.constructions(), 0);
    }
}
