//! Build pipeline: repository URL in, running sandbox session out.
//!
//! Every submission becomes a [`BuildTask`] that a worker drives through
//! `pending → cloning → detecting → building → running → success`. Each step is
//! saved before the next begins, so a poller never sees a stage that has not been
//! recorded. Any failure ends the task as `failed` with the cause in its logs, after
//! whatever image or container the run had created is removed again.

mod fetch;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ErrorKind;
use crate::metrics;
use crate::model::{self, BuildStatus, BuildTask, ResourceLimits, Session, TransitionError};
use crate::runtime::{managed_labels, BuildRequest, ContainerRuntime, RuntimeError, RuntimeHandle};
use crate::store::{SessionStoreHandle, StoreError, TaskStoreHandle};

pub use fetch::{DefaultResolver, FetchError, GitFetcher, RecipeResolver, RepoFetcher};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid repository url: {0}")]
    InvalidInput(String),
    #[error("unsupported repository: {0}")]
    UnsupportedRepository(String),
    #[error("build failed: {0}")]
    BuildFailure(String),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("clone failed: {0}")]
    Clone(#[from] FetchError),
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("pipeline worker failed: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidInput(_) => ErrorKind::InvalidInput,
            PipelineError::UnsupportedRepository(_) => ErrorKind::UnsupportedRepository,
            PipelineError::BuildFailure(_) | PipelineError::Clone(_) => ErrorKind::BuildFailure,
            PipelineError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            PipelineError::TaskNotFound(_) => ErrorKind::TaskNotFound,
            PipelineError::Store(_) | PipelineError::Transition(_) | PipelineError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<RuntimeError> for PipelineError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Build(msg) => PipelineError::BuildFailure(msg),
            other => PipelineError::RuntimeUnavailable(other.to_string()),
        }
    }
}

/// Accepts `http(s)://`, `ssh://` and `git://` URLs with a host and a path, or
/// scp-style `user@host:owner/repo`. Returns the trimmed URL.
pub fn validate_repo_url(raw: &str) -> Result<String, PipelineError> {
    let candidate = raw.trim();
    if candidate.is_empty() {
        return Err(PipelineError::InvalidInput("repository url is empty".into()));
    }
    if candidate.starts_with('-') || candidate.chars().any(char::is_whitespace) {
        return Err(PipelineError::InvalidInput(candidate.to_string()));
    }

    if !candidate.contains("://") {
        return scp_style(candidate)
            .then(|| candidate.to_string())
            .ok_or_else(|| PipelineError::InvalidInput(candidate.to_string()));
    }

    let url = Url::parse(candidate)
        .map_err(|err| PipelineError::InvalidInput(format!("{candidate}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https" | "ssh" | "git") {
        return Err(PipelineError::InvalidInput(format!(
            "{candidate}: unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(PipelineError::InvalidInput(format!("{candidate}: missing host")));
    }
    if url.path().trim_matches('/').is_empty() {
        return Err(PipelineError::InvalidInput(format!(
            "{candidate}: missing repository path"
        )));
    }
    Ok(candidate.to_string())
}

fn scp_style(candidate: &str) -> bool {
    let Some((user_host, path)) = candidate.split_once(':') else {
        return false;
    };
    let Some((user, host)) = user_host.split_once('@') else {
        return false;
    };
    !user.is_empty()
        && !host.is_empty()
        && !host.contains('/')
        && !path.trim_matches('/').is_empty()
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub limits: ResourceLimits,
    pub session_ttl: Duration,
    pub build_timeout: Duration,
    pub clone_timeout: Duration,
    pub workers: usize,
}

/// What a run has created so far; removed again if the run fails.
#[derive(Default)]
struct Leftovers {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    image: Option<String>,
    container: Option<String>,
    session: Option<String>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    tasks: TaskStoreHandle,
    sessions: SessionStoreHandle,
    runtime: Arc<RuntimeHandle>,
    fetcher: Arc<dyn RepoFetcher>,
    resolver: Arc<dyn RecipeResolver>,
    settings: PipelineSettings,
    workers: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(
        tasks: TaskStoreHandle,
        sessions: SessionStoreHandle,
        runtime: Arc<RuntimeHandle>,
        fetcher: Arc<dyn RepoFetcher>,
        resolver: Arc<dyn RecipeResolver>,
        settings: PipelineSettings,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                tasks,
                sessions,
                runtime,
                fetcher,
                resolver,
                settings,
                workers,
            }),
        }
    }

    /// Records a pending task and queues it on the worker pool. Only URL validation
    /// and the initial store write can fail here; everything later lands in the
    /// task's logs.
    pub async fn submit(&self, repo_url: &str) -> Result<BuildTask, PipelineError> {
        let repo_url = validate_repo_url(repo_url)?;
        let task = BuildTask::new(repo_url);
        self.inner.tasks.insert(&task).await?;
        info!(task_id = %task.task_id, repo_url = %task.repo_url, "build task submitted");

        let inner = self.inner.clone();
        let queued = task.clone();
        tokio::spawn(async move {
            let Ok(_permit) = inner.workers.clone().acquire_owned().await else {
                warn!(task_id = %queued.task_id, "worker pool closed; task abandoned");
                return;
            };
            inner.run(queued).await;
        });
        Ok(task)
    }

    pub async fn status(&self, task_id: &str) -> Result<BuildTask, PipelineError> {
        self.inner
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| PipelineError::TaskNotFound(task_id.to_string()))
    }
}

impl Inner {
    async fn run(&self, mut task: BuildTask) {
        let mut leftovers = Leftovers::default();
        match self.execute(&mut task, &mut leftovers).await {
            Ok(()) => {
                metrics::BUILDS.with_label_values(&["success"]).inc();
                info!(
                    task_id = %task.task_id,
                    session_id = task.session_id.as_deref().unwrap_or_default(),
                    "build task succeeded"
                );
            }
            Err(err) => {
                metrics::BUILDS.with_label_values(&["failed"]).inc();
                warn!(task_id = %task.task_id, error = %err, "build task failed");
                self.discard(&task.task_id, leftovers).await;
                task.session_id = None;
                if let Err(transition) = task.advance(BuildStatus::Failed, format!("FAILED: {err}")) {
                    warn!(task_id = %task.task_id, error = %transition, "could not mark task failed");
                    return;
                }
                if let Err(save) = self.tasks.save(&task).await {
                    warn!(task_id = %task.task_id, error = %save, "could not persist failed task");
                }
            }
        }
    }

    async fn transition(
        &self,
        task: &mut BuildTask,
        to: BuildStatus,
        note: impl Into<String>,
    ) -> Result<(), PipelineError> {
        let previous = task.status;
        task.advance(to, note)?;
        if let Err(err) = self.tasks.save(task).await {
            task.status = previous;
            return Err(err.into());
        }
        debug!(task_id = %task.task_id, status = %to, "task advanced");
        Ok(())
    }

    async fn execute(
        &self,
        task: &mut BuildTask,
        leftovers: &mut Leftovers,
    ) -> Result<(), PipelineError> {
        self.transition(task, BuildStatus::Cloning, format!("Cloning {}", task.repo_url))
            .await?;
        let workdir = tempfile::Builder::new()
            .prefix("sandcastle-")
            .tempdir()
            .map_err(|err| PipelineError::Internal(format!("creating work directory: {err}")))?;
        let checkout = workdir.path().join("repo");
        self.fetcher
            .fetch(&task.repo_url, &checkout, self.settings.clone_timeout)
            .await?;
        task.log("Repository cloned");

        self.transition(task, BuildStatus::Detecting, "Detecting language and dependencies")
            .await?;
        let recipe = self.resolve(&checkout).await?;
        task.detected_language = Some(recipe.language.to_string());
        task.dependencies = Some(recipe.dependencies.clone());
        task.log(match recipe.dockerfile_source {
            sandcastle_recipe::DockerfileSource::Repository => {
                format!("Detected language: {}; using repository Dockerfile", recipe.language)
            }
            sandcastle_recipe::DockerfileSource::Generated => {
                format!("Detected language: {}; generated Dockerfile", recipe.language)
            }
        });

        self.transition(task, BuildStatus::Building, "Building image").await?;
        let runtime = self.runtime.get().await?;
        leftovers.runtime = Some(runtime.clone());

        let session_id = model::new_id();
        let tag = model::image_tag(&session_id);
        let labels = managed_labels(&session_id, &task.task_id);
        leftovers.image = Some(tag.clone());

        let (log_tx, mut log_rx) = mpsc::unbounded_channel();
        let request = BuildRequest {
            context_dir: checkout.clone(),
            dockerfile: recipe.dockerfile,
            tag: tag.clone(),
            labels: labels.clone(),
        };
        let build = tokio::time::timeout(
            self.settings.build_timeout,
            runtime.build_image(request, log_tx),
        )
        .await;
        let mut build_log = String::new();
        while let Ok(line) = log_rx.try_recv() {
            build_log.push_str(&line);
        }
        if !build_log.is_empty() {
            task.log(build_log);
        }
        let image_id = match build {
            Ok(result) => result?,
            Err(_) => {
                return Err(PipelineError::BuildFailure(format!(
                    "image build exceeded {}s",
                    self.settings.build_timeout.as_secs()
                )))
            }
        };
        task.log(format!("Image built: {image_id}"));
        drop(workdir);

        self.transition(task, BuildStatus::Running, "Starting container").await?;
        let container_id = runtime
            .run_container(
                &tag,
                &format!("sandcastle-{session_id}"),
                self.settings.limits,
                labels,
            )
            .await?;
        leftovers.container = Some(container_id.clone());

        let session = Session::start(
            session_id.clone(),
            container_id,
            self.settings.limits,
            self.settings.session_ttl,
            Utc::now(),
        );
        self.sessions.create(session).await?;
        leftovers.session = Some(session_id.clone());
        metrics::SESSIONS_CREATED.inc();

        task.session_id = Some(session_id.clone());
        self.transition(task, BuildStatus::Success, format!("Sandbox ready: session {session_id}"))
            .await?;
        Ok(())
    }

    async fn resolve(&self, checkout: &Path) -> Result<sandcastle_recipe::Recipe, PipelineError> {
        let resolver = self.resolver.clone();
        let root = checkout.to_path_buf();
        let resolved = tokio::task::spawn_blocking(move || resolver.resolve(&root))
            .await
            .map_err(|err| PipelineError::Internal(format!("recipe resolution panicked: {err}")))?;
        resolved.map_err(|err| match err {
            sandcastle_recipe::ResolveError::Unsupported(reason) => {
                PipelineError::UnsupportedRepository(reason)
            }
            other => PipelineError::BuildFailure(other.to_string()),
        })
    }

    /// Container first, then image, then the session record that pointed at them.
    async fn discard(&self, task_id: &str, leftovers: Leftovers) {
        let Some(runtime) = leftovers.runtime else {
            return;
        };
        if let Some(container_id) = &leftovers.container {
            if let Err(err) = runtime.stop_and_remove(container_id).await {
                warn!(task_id = %task_id, container_id = %container_id, error = %err, "failed to remove container of failed build");
            }
        }
        if let Some(image) = &leftovers.image {
            if let Err(err) = runtime.remove_image(image).await {
                warn!(task_id = %task_id, image = %image, error = %err, "failed to remove image of failed build");
            }
        }
        if let Some(session_id) = &leftovers.session {
            if let Err(err) = self.sessions.delete(session_id).await {
                warn!(task_id = %task_id, session_id = %session_id, error = %err, "failed to delete session of failed build");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_repository_references() {
        for url in [
            "https://github.com/octocat/Hello-World",
            "https://github.com/octocat/Hello-World.git",
            "http://git.example.com:8080/team/repo",
            "ssh://git@github.com/octocat/Hello-World.git",
            "git://example.org/project.git",
            "git@github.com:octocat/Hello-World.git",
            "  https://github.com/a/b  ",
        ] {
            assert!(validate_repo_url(url).is_ok(), "{url} should be accepted");
        }
        assert_eq!(
            validate_repo_url("  https://github.com/a/b ").unwrap(),
            "https://github.com/a/b"
        );
    }

    #[test]
    fn rejects_malformed_references() {
        for url in [
            "",
            "   ",
            "not a url",
            "github.com/octocat",
            "ftp://example.com/repo",
            "file:///etc/passwd",
            "https://github.com",
            "https://github.com/",
            "--upload-pack=touch /tmp/x",
            "git@github.com:",
            "@host:repo",
        ] {
            let err = validate_repo_url(url).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{url} should be rejected");
        }
    }

    #[test]
    fn runtime_errors_map_into_pipeline_taxonomy() {
        let build: PipelineError = RuntimeError::Build("exit 1".into()).into();
        assert_eq!(build.kind(), ErrorKind::BuildFailure);
        let down: PipelineError = RuntimeError::Unavailable("no socket".into()).into();
        assert_eq!(down.kind(), ErrorKind::RuntimeUnavailable);
    }
}
