//! Container Runtime Adapter: the only module that speaks to the Docker
//! Engine API. Everything above this layer works with opaque container ids
//! and never touches `bollard` directly.

use std::collections::HashMap;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
        LogsOptions, RemoveContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::{BuildImageOptions, CreateImageOptions},
    models::ContainerStateStatusEnum,
    service::{HostConfig, HostConfigLogConfig},
    Docker,
};
use futures::StreamExt;
use tracing::{debug, instrument, warn};

use crate::transfer::{pack_single_file, pack_dir, unpack_single_file};

pub const CONTAINER_LABEL: &str = "python-sandbox";
const WORKDIR: &str = "/app/results";
const MEM_LIMIT_BYTES: i64 = 1024 * 1024 * 1024;

/// Parameters used to create a fresh sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
}

/// Outcome of running a command to completion inside a container.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

/// Coarse container lifecycle state, as reported by the runtime's inspect
/// call. Drives the lazy `exited -> running` restart in the lifecycle
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    Missing,
    Other,
}

/// Abstraction over the container engine so the lifecycle manager and
/// execution engine can be tested without a real Docker daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, container_id: &str) -> Result<()>;
    async fn stop_container(&self, container_id: &str) -> Result<()>;
    async fn remove_container(&self, container_id: &str) -> Result<()>;
    /// True if a container with this exact id currently exists.
    async fn exists(&self, container_id: &str) -> Result<bool>;
    /// Finds a container id by exact name match under the sandbox label.
    async fn find_by_name(&self, name: &str) -> Result<Option<String>>;
    /// Reports the container's current lifecycle state, for the
    /// `exited -> running` lazy-restart decision.
    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus>;
    /// Returns up to `tail_lines` of combined stdout/stderr, newest last.
    async fn tail_logs(&self, container_id: &str, tail_lines: usize) -> Result<String>;
    async fn exec(&self, container_id: &str, command: Vec<String>) -> Result<ExecResult>;
    async fn image_exists(&self, image: &str) -> Result<bool>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    /// Builds `tag` from the Dockerfile at `dockerfile` with build context
    /// `context_dir`, pruning intermediate containers on success.
    async fn build_image(&self, context_dir: &Path, dockerfile: &Path, tag: &str) -> Result<()>;
    /// Writes `contents` to `remote_path` inside the container's `/app/results` tree.
    async fn put_file(&self, container_id: &str, remote_path: &str, contents: &[u8]) -> Result<()>;
    /// Reads a single file back out of the container.
    async fn get_file(&self, container_id: &str, remote_path: &str) -> Result<Vec<u8>>;
}

/// `ContainerRuntime` backed by a live Docker Engine connection via `bollard`.
pub struct DockerRuntimeAdapter {
    docker: Docker,
}

impl DockerRuntimeAdapter {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("connecting to local docker engine")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntimeAdapter {
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut labels = HashMap::new();
        labels.insert(CONTAINER_LABEL.to_string(), "true".to_string());

        let host_config = HostConfig {
            memory: Some(MEM_LIMIT_BYTES),
            memory_swap: Some(MEM_LIMIT_BYTES),
            network_mode: Some("bridge".to_string()),
            privileged: Some(false),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            log_config: Some(HostConfigLogConfig {
                typ: Some("json-file".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(labels),
            working_dir: Some(WORKDIR.to_string()),
            tty: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("creating container {}", spec.name))?;
        Ok(created.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(container_id, None)
            .await
            .with_context(|| format!("starting container {container_id}"))?;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .stop_container(container_id, None)
            .await
            .with_context(|| format!("stopping container {container_id}"))?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("removing container {container_id}"))?;
        Ok(())
    }

    async fn exists(&self, container_id: &str) -> Result<bool> {
        match self.docker.inspect_container(container_id, None).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{CONTAINER_LABEL}=true")]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let wanted = format!("/{name}");
        for container in containers {
            if container
                .names
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|n| n == &wanted || n == name)
            {
                return Ok(container.id);
            }
        }
        Ok(None)
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus> {
        match self.docker.inspect_container(container_id, None).await {
            Ok(info) => Ok(match info.state.and_then(|s| s.status) {
                Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
                Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
                _ => ContainerStatus::Other,
            }),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerStatus::Missing),
            Err(err) => Err(err.into()),
        }
    }

    async fn tail_logs(&self, container_id: &str, tail_lines: usize) -> Result<String> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail_lines.to_string(),
                ..Default::default()
            }),
        );

        let mut lines = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => lines.push_str(&log.to_string()),
                Err(err) => {
                    warn!(container_id, error = %err, "failed to read container logs");
                    break;
                }
            }
        }
        Ok(lines)
    }

    #[instrument(skip(self, command), fields(container_id = %container_id))]
    async fn exec(&self, container_id: &str, command: Vec<String>) -> Result<ExecResult> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(WORKDIR.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    bollard::container::LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await?;
        debug!(exit_code = ?inspected.exit_code, "exec finished");

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code: inspected.exit_code,
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            if let Err(err) = progress {
                warn!(image, error = %err, "image pull reported an error frame");
                return Err(err.into());
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn build_image(&self, context_dir: &Path, dockerfile: &Path, tag: &str) -> Result<()> {
        let dockerfile_name = dockerfile
            .file_name()
            .and_then(|n| n.to_str())
            .context("dockerfile path must have a file name")?
            .to_string();
        let tar_bytes = pack_dir(context_dir)
            .with_context(|| format!("packing build context {}", context_dir.display()))?;

        let options = BuildImageOptions {
            t: tag.to_string(),
            dockerfile: dockerfile_name,
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(tar_bytes.into()));
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        debug!(tag, "{}", line.trim());
                    }
                    if let Some(err) = info.error {
                        return Err(anyhow::anyhow!("image build error: {err}"));
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn put_file(&self, container_id: &str, remote_path: &str, contents: &[u8]) -> Result<()> {
        let file_name = remote_path
            .rsplit('/')
            .next()
            .context("remote path must have a file name component")?;
        let archive = pack_single_file(file_name, contents)?;
        let remote_dir = remote_path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .filter(|dir| !dir.is_empty())
            .unwrap_or(WORKDIR);

        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: remote_dir.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .with_context(|| format!("uploading {remote_path} to {container_id}"))
    }

    async fn get_file(&self, container_id: &str, remote_path: &str) -> Result<Vec<u8>> {
        let mut stream = self.docker.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions {
                path: remote_path.to_string(),
            }),
        );
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        let file_name = remote_path
            .rsplit('/')
            .next()
            .context("remote path must have a file name component")?;
        unpack_single_file(&bytes, file_name)
    }
}
