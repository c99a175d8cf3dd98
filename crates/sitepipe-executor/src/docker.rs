//! Docker executor.
//!
//! Each build job gets its own container with the workspace bind-mounted
//! at [`WORKSPACE_MOUNT`]. Containers outlive the script so logs can be
//! read afterwards; [`Executor::remove`] deletes them.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerState, HostConfig};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use sitepipe_core::build::AMAZON_LINUX_2;
use sitepipe_core::executor::*;
use sitepipe_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Public mirror of the managed build image.
const AMAZON_LINUX_2_MIRROR: &str = "public.ecr.aws/codebuild/amazonlinux2-x86_64-standard:3.0";

pub struct DockerExecutor {
    docker: Docker,
    /// Managed image names mapped to pullable references.
    image_aliases: HashMap<String, String>,
}

impl DockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Internal(format!("connecting to docker: {}", e)))?;
        Ok(Self::with_client(docker))
    }

    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            image_aliases: default_aliases(),
        }
    }

    /// Pull `to` whenever a build asks for `from`.
    pub fn with_image_alias(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.image_aliases.insert(from.into(), to.into());
        self
    }

    fn container_name(job_id: &ResourceId) -> String {
        format!("sitepipe-build-{}", job_id)
    }

    fn container_config(spec: &JobSpec, image: &str) -> Config<String> {
        let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        env.push(format!("{}={}", SRC_DIR_VAR, WORKSPACE_MOUNT));

        Config {
            image: Some(image.to_string()),
            cmd: Some(spec.command()),
            env: Some(env),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:rw",
                    spec.workspace.display(),
                    WORKSPACE_MOUNT
                )]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn pull(&self, image: &str) {
        info!(image = %image, "Pulling build image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            match update {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                // A locally built image cannot be pulled; creating the container decides.
                Err(e) => warn!(image = %image, error = %e, "Pull failed"),
            }
        }
    }

    async fn inspect(&self, handle: &JobHandle) -> Result<JobStatus> {
        let inspect = self
            .docker
            .inspect_container(&Self::container_name(&handle.id), None)
            .await
            .map_err(|e| Error::NotFound(format!("build container {}: {}", handle.id, e)))?;
        Ok(job_status(inspect.state.unwrap_or_default()))
    }
}

fn default_aliases() -> HashMap<String, String> {
    HashMap::from([(AMAZON_LINUX_2.to_string(), AMAZON_LINUX_2_MIRROR.to_string())])
}

fn resolve_image<'a>(aliases: &'a HashMap<String, String>, image: &'a str) -> &'a str {
    aliases.get(image).map_or(image, String::as_str)
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn job_status(state: ContainerState) -> JobStatus {
    if state.running.unwrap_or(false) {
        return JobStatus::Running {
            started_at: parse_timestamp(state.started_at.as_deref()).unwrap_or_else(Utc::now),
        };
    }
    JobStatus::Exited {
        exit_code: state.exit_code.map(|c| c as i32),
        finished_at: parse_timestamp(state.finished_at.as_deref()).unwrap_or_else(Utc::now),
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let name = Self::container_name(&spec.id);
        let image = resolve_image(&self.image_aliases, &spec.image);
        self.pull(image).await;
        let config = Self::container_config(&spec, image);

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("creating build container: {}", e)))?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("starting build container: {}", e)))?;
        info!(container = %name, image = %spec.image, "Build container started");

        Ok(JobHandle {
            id: spec.id,
            executor_id: container.id,
        })
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobStatus> {
        let status = self.inspect(handle).await?;
        if status.is_terminal() {
            return Ok(status);
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self
            .docker
            .wait_container(&Self::container_name(&handle.id), Some(options));
        match stream.next().await {
            Some(Ok(_)) => {}
            // a non-zero exit surfaces as an error from the wait stream
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                debug!(job_id = %handle.id, code, "Build container exited");
            }
            Some(Err(e)) => warn!(job_id = %handle.id, error = %e, "Waiting on build container"),
            None => {}
        }

        self.inspect(handle).await
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(&Self::container_name(&handle.id), Some(options))
            .filter_map(|chunk| async move {
                let (stream, message) = match chunk {
                    Ok(LogOutput::StdErr { message }) => (LogStream::Stderr, message),
                    Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                        (LogStream::Stdout, message)
                    }
                    Ok(LogOutput::StdIn { .. }) => return None,
                    Err(e) => {
                        warn!(error = %e, "Build log stream error");
                        return None;
                    }
                };
                Some(LogLine {
                    timestamp: Utc::now(),
                    stream,
                    content: String::from_utf8_lossy(&message).trim_end().to_string(),
                })
            });
        Ok(Box::pin(stream))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        self.docker
            .kill_container(
                &Self::container_name(&handle.id),
                Some(KillContainerOptions { signal: "SIGKILL" }),
            )
            .await
            .map_err(|e| Error::ExecutionFailed(format!("killing build container: {}", e)))
    }

    async fn remove(&self, handle: &JobHandle) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&Self::container_name(&handle.id), Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("removing build container: {}", e)))
    }
}
