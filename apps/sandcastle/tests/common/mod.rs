#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use sandcastle::config::AppConfig;
use sandcastle::model::{BuildTask, ResourceLimits, Session};
use sandcastle::pipeline::{DefaultResolver, FetchError, RepoFetcher};
use sandcastle::runtime::{
    BuildRequest, ContainerRuntime, ExecStream, LogSink, ManagedContainer, RuntimeError,
    RuntimeHandle, LABEL_MANAGED, LABEL_SESSION,
};
use sandcastle::state::AppState;
use sandcastle::store::Stores;

pub struct FakeContainer {
    pub image: String,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub limits: ResourceLimits,
    stopped: CancellationToken,
}

#[derive(Default)]
pub struct FakeState {
    pub built: Vec<String>,
    pub dockerfiles: Vec<String>,
    pub removed_images: Vec<String>,
    pub containers: HashMap<String, FakeContainer>,
    pub removed_containers: Vec<String>,
    pub execs: usize,
    pub fail_build: Option<String>,
    pub fail_run: Option<String>,
    pub fail_stop: Option<String>,
    /// Containers whose stop fails while the rest succeed.
    pub fail_stop_for: HashSet<String>,
    pub build_delay: Option<Duration>,
}

/// In-process container engine. Exec streams are a tiny line shell: `echo ARGS`
/// prints ARGS, `exit` ends the shell, anything else prints a not-found error.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut *self.state.lock())
    }

    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.with(|s| s.containers.keys().cloned().collect());
        ids.sort();
        ids
    }

    /// Places a managed container directly, as if left behind by a crashed process.
    pub fn insert_container(&self, id: &str, session_id: &str, created_at: DateTime<Utc>) {
        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_SESSION.to_string(), session_id.to_string()),
        ]);
        self.with(|s| {
            s.containers.insert(
                id.to_string(),
                FakeContainer {
                    image: format!("sandcastle/{session_id}:latest"),
                    labels,
                    created_at,
                    limits: AppConfig::default().resource_limits(),
                    stopped: CancellationToken::new(),
                },
            )
        });
    }
}

async fn fake_shell(
    input: tokio::io::DuplexStream,
    mut output: tokio::io::DuplexStream,
    stopped: CancellationToken,
) {
    let mut lines = BufReader::new(input).lines();
    loop {
        let line = tokio::select! {
            _ = stopped.cancelled() => return,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else { return };
        let command = line.trim();
        let reply = if command == "exit" {
            return;
        } else if let Some(args) = command.strip_prefix("echo ") {
            format!("{args}\n")
        } else if command == "echo" {
            "\n".to_string()
        } else {
            format!("sh: {command}: not found\n")
        };
        if output.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn build_image(
        &self,
        request: BuildRequest,
        logs: LogSink,
    ) -> Result<String, RuntimeError> {
        let (delay, failure) = self.with(|s| (s.build_delay, s.fail_build.clone()));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let _ = logs.send("Step 1/2 : FROM base\n".to_string());
        if let Some(message) = failure {
            let _ = logs.send(format!("ERROR: {message}\n"));
            return Err(RuntimeError::Build(message));
        }
        let _ = logs.send(format!("Successfully tagged {}\n", request.tag));
        self.with(|s| {
            s.built.push(request.tag.clone());
            s.dockerfiles.push(request.dockerfile.clone());
        });
        Ok(format!("sha256:{}", request.tag))
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.with(|s| s.removed_images.push(image.to_string()));
        Ok(())
    }

    async fn run_container(
        &self,
        image: &str,
        _name: &str,
        limits: ResourceLimits,
        labels: HashMap<String, String>,
    ) -> Result<String, RuntimeError> {
        if let Some(message) = self.with(|s| s.fail_run.clone()) {
            return Err(RuntimeError::Engine(message));
        }
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.with(|s| {
            s.containers.insert(
                id.clone(),
                FakeContainer {
                    image: image.to_string(),
                    labels,
                    created_at: Utc::now(),
                    limits,
                    stopped: CancellationToken::new(),
                },
            )
        });
        Ok(id)
    }

    async fn attach_exec(&self, container_id: &str) -> Result<ExecStream, RuntimeError> {
        let stopped = self.with(|s| {
            s.execs += 1;
            s.containers
                .get(container_id)
                .map(|container| container.stopped.clone())
        });
        let stopped = stopped.ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;

        let (client_in, shell_in) = tokio::io::duplex(4096);
        let (shell_out, client_out) = tokio::io::duplex(4096);
        tokio::spawn(fake_shell(shell_in, shell_out, stopped));

        let output = futures::stream::unfold(client_out, |mut reader| async move {
            let mut buf = vec![0u8; 1024];
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok::<Bytes, RuntimeError>(Bytes::from(buf)), reader))
                }
            }
        })
        .boxed();
        Ok(ExecStream {
            output,
            input: Box::pin(client_in),
        })
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let failure = self.with(|s| {
            s.fail_stop.clone().or_else(|| {
                s.fail_stop_for
                    .contains(container_id)
                    .then(|| format!("container {container_id} is wedged"))
            })
        });
        if let Some(message) = failure {
            return Err(RuntimeError::Unavailable(message));
        }
        self.with(|s| {
            if let Some(container) = s.containers.remove(container_id) {
                container.stopped.cancel();
                s.removed_containers.push(container_id.to_string());
            }
        });
        Ok(())
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ManagedContainer>, RuntimeError> {
        Ok(self.with(|s| {
            s.containers
                .iter()
                .filter(|(_, c)| c.labels.get(key).map(String::as_str) == Some(value))
                .map(|(id, c)| ManagedContainer {
                    id: id.clone(),
                    session_id: c.labels.get(LABEL_SESSION).cloned(),
                    created_at: Some(c.created_at),
                })
                .collect()
        }))
    }
}

/// Writes a fixed file tree instead of cloning.
#[derive(Clone, Default)]
pub struct FakeFetcher {
    files: BTreeMap<String, String>,
    failure: Option<String>,
}

impl FakeFetcher {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(path, body)| (path.to_string(), body.to_string()))
                .collect(),
            failure: None,
        }
    }

    pub fn python() -> Self {
        Self::with_files(&[
            ("requirements.txt", "flask==3.0.0\nrequests\n"),
            ("app.py", "print('hello')\n"),
        ])
    }

    pub fn failing(message: &str) -> Self {
        Self {
            files: BTreeMap::new(),
            failure: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl RepoFetcher for FakeFetcher {
    async fn fetch(&self, _repo_url: &str, dest: &Path, _timeout: Duration) -> Result<(), FetchError> {
        if let Some(message) = &self.failure {
            return Err(FetchError(message.clone()));
        }
        for (path, body) in &self.files {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| FetchError(err.to_string()))?;
            }
            tokio::fs::write(&target, body)
                .await
                .map_err(|err| FetchError(err.to_string()))?;
        }
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|err| FetchError(err.to_string()))?;
        Ok(())
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        session_ttl: Duration::from_secs(3600),
        build_workers: 4,
        ..AppConfig::default()
    }
}

pub struct Harness {
    pub state: AppState,
    pub runtime: Arc<FakeRuntime>,
    pub stores: Stores,
    pub cfg: AppConfig,
}

pub fn harness(fetcher: FakeFetcher) -> Harness {
    harness_with(test_config(), fetcher)
}

pub fn harness_with(cfg: AppConfig, fetcher: FakeFetcher) -> Harness {
    let runtime = FakeRuntime::new();
    let handle = Arc::new(RuntimeHandle::ready(runtime.clone()));
    harness_on(cfg, fetcher, runtime, handle)
}

pub fn harness_on(
    cfg: AppConfig,
    fetcher: FakeFetcher,
    runtime: Arc<FakeRuntime>,
    handle: Arc<RuntimeHandle>,
) -> Harness {
    let stores = Stores::in_memory(cfg.task_retention);
    let state = AppState::new(
        &cfg,
        stores.clone(),
        handle,
        Arc::new(fetcher),
        Arc::new(DefaultResolver),
    );
    Harness {
        state,
        runtime,
        stores,
        cfg,
    }
}

/// Runtime handle whose construction fails while `down` is set.
pub fn switchable_handle(runtime: Arc<FakeRuntime>, down: Arc<AtomicBool>) -> Arc<RuntimeHandle> {
    Arc::new(RuntimeHandle::new(Arc::new(move || {
        let runtime = runtime.clone();
        let down = down.clone();
        async move {
            if down.load(Ordering::SeqCst) {
                Err(RuntimeError::Unavailable("docker socket refused connection".into()))
            } else {
                Ok(runtime as Arc<dyn ContainerRuntime>)
            }
        }
        .boxed()
    })))
}

impl Harness {
    /// A running session backed by a fresh fake container.
    pub async fn running_session(&self, created_at: DateTime<Utc>, ttl: Duration) -> Session {
        let session_id = sandcastle::model::new_id();
        let labels = sandcastle::runtime::managed_labels(&session_id, "task-under-test");
        let container_id = self
            .runtime
            .run_container(
                &sandcastle::model::image_tag(&session_id),
                "fixture",
                self.cfg.resource_limits(),
                labels,
            )
            .await
            .unwrap();
        let session = Session::start(
            session_id,
            container_id,
            self.cfg.resource_limits(),
            ttl,
            created_at,
        );
        self.stores.sessions.create(session.clone()).await.unwrap();
        session
    }

    pub async fn wait_for_terminal(&self, task_id: &str) -> BuildTask {
        for _ in 0..500 {
            let task = self.state.coordinator().status(task_id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never finished");
    }
}
