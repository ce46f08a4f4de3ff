use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, ListContainersOptions,
    RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{
    BuildRequest, ContainerRuntime, ExecStream, LogSink, ManagedContainer, RuntimeError,
    LABEL_SESSION,
};
use crate::model::ResourceLimits;

const DOCKER_TIMEOUT_SECS: u64 = 120;
const STOP_GRACE_SECS: i32 = 10;

/// Prefer bash, fall back to sh for alpine-style images.
const SHELL_BOOTSTRAP: &str = "if [ -x /bin/bash ]; then exec /bin/bash; else exec /bin/sh; fi";

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// `unix://` hosts connect to that socket; anything else (or nothing) uses
    /// bollard's local defaults, which also honour `DOCKER_HOST`.
    pub async fn connect(docker_host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match docker_host.and_then(|host| host.strip_prefix("unix://")) {
            Some(path) => {
                info!(socket = %path, "connecting to docker over explicit unix socket");
                Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;

        let runtime = Self { docker };
        runtime.ping().await?;
        Ok(runtime)
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn engine_error(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError { status_code: 404, message } => {
            RuntimeError::NotFound(message)
        }
        BollardError::DockerResponseServerError { .. } => RuntimeError::Engine(err.to_string()),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

fn pack_context(dir: &Path) -> Result<Vec<u8>, std::io::Error> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(false);
    archive.append_dir_all(".", dir)?;
    archive.into_inner()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))
    }

    async fn build_image(
        &self,
        request: BuildRequest,
        logs: LogSink,
    ) -> Result<String, RuntimeError> {
        tokio::fs::write(request.context_dir.join("Dockerfile"), &request.dockerfile).await?;
        let context_dir = request.context_dir.clone();
        let context = tokio::task::spawn_blocking(move || pack_context(&context_dir))
            .await
            .map_err(|err| RuntimeError::Build(format!("packing build context: {err}")))??;
        debug!(tag = %request.tag, bytes = context.len(), "build context packed");

        let options = BuildImageOptionsBuilder::new()
            .dockerfile("Dockerfile")
            .t(&request.tag)
            .rm(true)
            .forcerm(true)
            .build();
        let mut stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(Bytes::from(context))));

        let mut image_id = None;
        while let Some(item) = stream.next().await {
            let info = item.map_err(|err| match err {
                BollardError::DockerResponseServerError { .. }
                | BollardError::DockerStreamError { .. } => RuntimeError::Build(err.to_string()),
                other => RuntimeError::Unavailable(other.to_string()),
            })?;
            if let Some(line) = info.stream {
                let _ = logs.send(line);
            }
            if let Some(detail) = info.error_detail {
                let message = detail.message.unwrap_or_else(|| "unknown build error".into());
                let _ = logs.send(format!("ERROR: {message}"));
                return Err(RuntimeError::Build(message));
            }
            if let Some(id) = info.aux.and_then(|aux| aux.id) {
                image_id = Some(id);
            }
        }

        match image_id {
            Some(id) => Ok(id),
            None => {
                let inspected = self
                    .docker
                    .inspect_image(&request.tag)
                    .await
                    .map_err(|err| RuntimeError::Build(format!("built image missing: {err}")))?;
                Ok(inspected.id.unwrap_or(request.tag))
            }
        }
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_image(
                image,
                Some(RemoveImageOptionsBuilder::new().force(true).build()),
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if status_code(&err) == Some(404) => Ok(()),
            Err(err) => Err(engine_error(err)),
        }
    }

    async fn run_container(
        &self,
        image: &str,
        name: &str,
        limits: ResourceLimits,
        labels: HashMap<String, String>,
    ) -> Result<String, RuntimeError> {
        let config = ContainerCreateBody {
            image: Some(image.to_string()),
            labels: Some(labels),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(HostConfig {
                memory: Some(limits.memory_bytes as i64),
                nano_cpus: Some(limits.nano_cpus()),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(name).build()),
                config,
            )
            .await
            .map_err(engine_error)?;

        if let Err(err) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            warn!(container_id = %created.id, error = %err, "start failed; removing container");
            if let Err(cleanup) = self.stop_and_remove(&created.id).await {
                warn!(container_id = %created.id, error = %cleanup, "cleanup after failed start");
            }
            return Err(engine_error(err));
        }
        info!(container_id = %created.id, image = %image, "container started");
        Ok(created.id)
    }

    async fn attach_exec(&self, container_id: &str) -> Result<ExecStream, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    env: Some(vec!["TERM=xterm-256color"]),
                    cmd: Some(vec!["/bin/sh", "-c", SHELL_BOOTSTRAP]),
                    ..Default::default()
                },
            )
            .await
            .map_err(engine_error)?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(engine_error)?;

        match started {
            StartExecResults::Attached { output, input } => Ok(ExecStream {
                output: output
                    .map(|chunk| {
                        chunk
                            .map(|log| log.into_bytes())
                            .map_err(|err| RuntimeError::Engine(err.to_string()))
                    })
                    .boxed(),
                input,
            }),
            StartExecResults::Detached => Err(RuntimeError::Engine(
                "exec started detached; no stream to attach".into(),
            )),
        }
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await
        {
            Ok(_) => {}
            // 304: already stopped, 404: already gone.
            Err(err) if matches!(status_code(&err), Some(304) | Some(404)) => {}
            Err(err) => return Err(engine_error(err)),
        }

        match self
            .docker
            .remove_container(
                container_id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if status_code(&err) == Some(404) => Ok(()),
            // 409: removal already in progress from a concurrent teardown.
            Err(err) if status_code(&err) == Some(409) => Ok(()),
            Err(err) => Err(engine_error(err)),
        }
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let filters = HashMap::from([("label".to_string(), vec![format!("{key}={value}")])]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(engine_error)?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let session_id = summary
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(LABEL_SESSION).cloned());
                let created_at = summary
                    .created
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
                Some(ManagedContainer {
                    id,
                    session_id,
                    created_at,
                })
            })
            .collect())
    }
}
