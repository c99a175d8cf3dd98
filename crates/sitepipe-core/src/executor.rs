//! Build job execution port.
//!
//! A build job runs one shell script over a workspace directory, in a
//! container or directly on the host. The build stage runner drives an
//! [`Executor`]; it never talks to a backend directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{ResourceId, Result};

/// Where container executors mount the job workspace.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Variable through which build scripts find their source directory.
pub const SRC_DIR_VAR: &str = "CODEBUILD_SRC_DIR";

/// One build script to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: ResourceId,
    /// Build image. Host executors ignore it.
    pub image: String,
    /// Run with `sh -c` from the workspace root.
    pub script: String,
    /// Host directory holding the materialized source.
    pub workspace: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn new(
        image: impl Into<String>,
        script: impl Into<String>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            image: image.into(),
            script: script.into(),
            workspace: workspace.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn command(&self) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), self.script.clone()]
    }
}

/// Handle to a spawned job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: ResourceId,
    /// Container id or process id.
    pub executor_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running {
        started_at: DateTime<Utc>,
    },
    /// The script ran to completion. `exit_code` is `None` when the job was
    /// killed by a signal or the backend could not report it.
    Exited {
        exit_code: Option<i32>,
        finished_at: DateTime<Utc>,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JobStatus::Exited { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == Some(0)
    }
}

/// A line of job output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle>;

    /// Block until the job reaches a terminal status.
    async fn wait(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Output of the job. Complete once `wait` has returned.
    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Stop a running job.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;

    /// Release everything the backend keeps for a finished job.
    async fn remove(&self, handle: &JobHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        let now = Utc::now();
        let ok = JobStatus::Exited {
            exit_code: Some(0),
            finished_at: now,
        };
        let failed = JobStatus::Exited {
            exit_code: Some(2),
            finished_at: now,
        };
        assert!(ok.succeeded() && ok.is_terminal());
        assert!(!failed.succeeded());
        assert_eq!(failed.exit_code(), Some(2));
        assert!(!JobStatus::Running { started_at: now }.is_terminal());
        assert!(!JobStatus::Cancelled { cancelled_at: now }.succeeded());
    }

    #[test]
    fn test_command_wraps_script() {
        let spec = JobSpec::new("node:20", "npm ci && npm run build", "/tmp/ws");
        assert_eq!(spec.command(), ["sh", "-c", "npm ci && npm run build"]);
    }
}
