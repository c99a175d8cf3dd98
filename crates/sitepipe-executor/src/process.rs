//! Host process executor.
//!
//! Runs build scripts with `tokio::process` from the workspace directory.
//! The build image is ignored, so the host must provide the toolchain the
//! buildspec expects.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use sitepipe_core::executor::*;
use sitepipe_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock, oneshot, watch};
use tokio::task::JoinHandle as TaskHandle;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info};

struct ProcessJob {
    status: watch::Receiver<JobStatus>,
    output: Arc<Mutex<Vec<LogLine>>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

/// Runs build scripts as child processes.
#[derive(Clone, Default)]
pub struct ProcessExecutor {
    jobs: Arc<RwLock<HashMap<ResourceId, Arc<ProcessJob>>>>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    async fn job(&self, handle: &JobHandle) -> Result<Arc<ProcessJob>> {
        self.jobs
            .read()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("build job {}", handle.id)))
    }
}

fn capture<R>(reader: R, stream: LogStream, sink: Arc<Mutex<Vec<LogLine>>>) -> TaskHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LinesStream::new(BufReader::new(reader).lines());
        while let Some(Ok(content)) = lines.next().await {
            sink.lock().await.push(LogLine {
                timestamp: Utc::now(),
                stream,
                content,
            });
        }
    })
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        if !spec.workspace.is_dir() {
            return Err(Error::ExecutionFailed(format!(
                "workspace {} does not exist",
                spec.workspace.display()
            )));
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&spec.script)
            .envs(&spec.env)
            .env(SRC_DIR_VAR, &spec.workspace)
            .current_dir(&spec.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to start build shell: {}", e)))?;
        let pid = child.id().unwrap_or_default();
        info!(
            job_id = %spec.id,
            pid,
            workspace = %spec.workspace.display(),
            "Started build process"
        );

        let output = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(capture(stdout, LogStream::Stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture(stderr, LogStream::Stderr, output.clone()));
        }

        let (status_tx, status_rx) = watch::channel(JobStatus::Running {
            started_at: Utc::now(),
        });
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let job_id = spec.id;

        tokio::spawn(async move {
            let exit = tokio::select! {
                result = child.wait() => Some(result),
                Ok(()) = cancel_rx => {
                    let _ = child.kill().await;
                    None
                }
            };

            for reader in readers {
                let _ = reader.await;
            }

            let status = match exit {
                Some(result) => JobStatus::Exited {
                    exit_code: result.ok().and_then(|s| s.code()),
                    finished_at: Utc::now(),
                },
                None => JobStatus::Cancelled {
                    cancelled_at: Utc::now(),
                },
            };
            debug!(job_id = %job_id, status = ?status, "Build process finished");
            let _ = status_tx.send(status);
        });

        self.jobs.write().await.insert(
            spec.id,
            Arc::new(ProcessJob {
                status: status_rx,
                output,
                cancel: Mutex::new(Some(cancel_tx)),
            }),
        );

        Ok(JobHandle {
            id: spec.id,
            executor_id: pid.to_string(),
        })
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobStatus> {
        let job = self.job(handle).await?;
        let mut rx = job.status.clone();
        let status = rx
            .wait_for(JobStatus::is_terminal)
            .await
            .map_err(|_| Error::Internal(format!("build job {} lost its supervisor", handle.id)))?
            .clone();
        Ok(status)
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let job = self.job(handle).await?;
        let lines = job.output.lock().await.clone();
        Ok(Box::pin(futures::stream::iter(lines)))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let job = self.job(handle).await?;
        if let Some(tx) = job.cancel.lock().await.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn remove(&self, handle: &JobHandle) -> Result<()> {
        self.jobs.write().await.remove(&handle.id);
        Ok(())
    }
}
