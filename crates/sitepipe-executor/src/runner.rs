//! The build stage runner.

use crate::buildspec::BuildSpec;
use crate::tree::{read_tree, safe_join, write_tree};
use async_trait::async_trait;
use futures::StreamExt;
use sitepipe_core::artifact::ArtifactBundle;
use sitepipe_core::build::{BuildRequest, BuildRunner};
use sitepipe_core::executor::{Executor, JobHandle, JobSpec, JobStatus, LogStream};
use sitepipe_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs build projects through an [`Executor`].
///
/// Each run materializes the source bundle into a fresh temporary
/// directory, runs the build specification found there, and collects the
/// declared artifacts into the output bundle.
pub struct ContainerBuildRunner {
    executor: Arc<dyn Executor>,
    timeout: Option<Duration>,
    work_root: Option<PathBuf>,
}

impl ContainerBuildRunner {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            timeout: None,
            work_root: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Create workspaces under `dir` instead of the system temp directory.
    pub fn with_work_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_root = Some(dir.into());
        self
    }

    fn workspace(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sitepipe-build-");
        let dir = match &self.work_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        dir.map_err(|e| Error::Internal(format!("creating build workspace: {}", e)))
    }

    async fn wait(&self, handle: &JobHandle, action: &str) -> Result<JobStatus> {
        let Some(limit) = self.timeout else {
            return self.executor.wait(handle).await;
        };
        match tokio::time::timeout(limit, self.executor.wait(handle)).await {
            Ok(status) => status,
            Err(_) => {
                if let Err(e) = self.executor.cancel(handle).await {
                    warn!(error = %e, "Failed to cancel timed out build");
                }
                Err(Error::Timeout(format!(
                    "build '{}' exceeded {:?}",
                    action, limit
                )))
            }
        }
    }

    async fn forward_logs(&self, handle: &JobHandle, action: &str) {
        let mut logs = match self.executor.logs(handle).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(action, error = %e, "Build output unavailable");
                return;
            }
        };
        while let Some(line) = logs.next().await {
            match line.stream {
                LogStream::Stderr => warn!(action, "{}", line.content),
                LogStream::Stdout => info!(action, "{}", line.content),
            }
        }
    }
}

#[async_trait]
impl BuildRunner for ContainerBuildRunner {
    async fn run(&self, request: BuildRequest) -> Result<ArtifactBundle> {
        let workspace = self.workspace()?;
        let src = workspace.path().to_path_buf();
        write_tree(&src, &request.source).await?;

        let spec_path = request.project.build_spec.relative_path().to_string();
        let spec_file = safe_join(&src, &spec_path)?;
        let yaml = tokio::fs::read_to_string(&spec_file).await.map_err(|_| {
            Error::ExecutionFailed(format!(
                "build specification '{}' not found in source",
                spec_path
            ))
        })?;
        let spec = BuildSpec::parse(&yaml)?;

        let mut env: BTreeMap<String, String> = spec.variables().into_iter().collect();
        env.extend(request.env.clone());
        env.insert("SITEPIPE_RUN_ID".to_string(), request.run_id.to_string());

        let job = JobSpec::new(
            request.project.environment.build_image.as_str(),
            spec.script(),
            src.as_path(),
        )
        .with_env(env);

        info!(
            action = %request.action,
            project = %request.project.logical_id,
            executor = self.executor.name(),
            image = %job.image,
            "Starting build"
        );

        let handle = self.executor.spawn(job).await?;
        let status = self.wait(&handle, &request.action).await;
        self.forward_logs(&handle, &request.action).await;
        if let Err(e) = self.executor.remove(&handle).await {
            warn!(job_id = %handle.id, error = %e, "Failed to remove build job");
        }

        let status = status?;
        if !status.succeeded() {
            return Err(Error::ExecutionFailed(format!(
                "build '{}' failed with exit code {}",
                request.action,
                status
                    .exit_code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )));
        }

        let base = match spec.base_directory() {
            Some(dir) => safe_join(&src, dir)?,
            None => src.clone(),
        };
        let bundle = tokio::task::spawn_blocking(move || read_tree(&base, |p| spec.is_artifact(p)))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;

        if bundle.is_empty() {
            return Err(Error::ExecutionFailed(format!(
                "build '{}' produced no artifacts",
                request.action
            )));
        }

        info!(
            action = %request.action,
            files = bundle.len(),
            bytes = bundle.total_size(),
            "Build finished"
        );
        Ok(bundle)
    }
}
