//! Local pipeline execution command.
//!
//! Sources come from a local checkout or a clone of the configured
//! repository. A replayed push payload decides whether the run starts at all.

use super::approval::PromptApproval;
use anyhow::{Context, Result};
use clap::ValueEnum;
use sitepipe_core::approval::{ApprovalGate, ApprovalPolicy};
use sitepipe_core::build::BuildRunner;
use sitepipe_core::deploy::SiteDeployer;
use sitepipe_core::executor::Executor;
use sitepipe_core::pipeline::{RunTrigger, StageStatus};
use sitepipe_core::secret::{SecretRef, SecretValue};
use sitepipe_core::source::SourceProvider;
use sitepipe_core::stack::{Provisioner, StackDefinition};
use sitepipe_deployer::{InMemorySecretStore, LocalCloud, StoreDeployer};
use sitepipe_executor::{
    ContainerBuildRunner, DirectorySource, DockerExecutor, GitSourceProvider, ProcessExecutor,
};
use sitepipe_scheduler::{
    AutoApprove, PipelineEvent, PipelineOrchestrator, PushTrigger, RetryPolicy,
    RetryingBuildRunner, RetryingDeployer, WebhookDelivery, definition_update_trigger,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutorKind {
    /// Host processes
    Process,
    /// Local Docker daemon
    Docker,
}

/// Where the source stage reads the tracked branch from.
pub enum SourceOption {
    /// A local checkout.
    Directory(PathBuf),
    /// A shallow clone of the configured repository.
    Git { base_url: Option<String> },
}

/// A push webhook delivery replayed from a file.
pub struct PushOptions {
    pub event_file: PathBuf,
    /// `X-Hub-Signature-256` header value.
    pub signature: Option<String>,
    /// Webhook secret deliveries must be signed with.
    pub secret: Option<String>,
}

pub struct RunOptions {
    pub source: SourceOption,
    pub push: Option<PushOptions>,
    pub auto_approve: bool,
    pub approval_timeout: Option<Duration>,
    pub executor: ExecutorKind,
    pub retries: u32,
    pub token: Option<String>,
    pub json_events: bool,
}

fn secret_store(definition: &StackDefinition, token: Option<&str>) -> InMemorySecretStore {
    let Some(token) = token else {
        warn!("GITHUB_TOKEN is not set, the source secret cannot be resolved");
        return InMemorySecretStore::new();
    };
    definition.secret_refs().into_iter().fold(
        InMemorySecretStore::new(),
        |store, SecretRef { secret_id, json_field }| match json_field {
            Some(field) => store.with_field(secret_id.as_str(), field.as_str(), token),
            None => store.with_secret(secret_id.as_str(), SecretValue::text(token)),
        },
    )
}

fn source_provider(source: &SourceOption) -> Result<Arc<dyn SourceProvider>> {
    Ok(match source {
        SourceOption::Directory(dir) => {
            let dir = dir
                .canonicalize()
                .with_context(|| format!("Failed to resolve source directory: {}", dir.display()))?;
            Arc::new(DirectorySource::new(dir))
        }
        SourceOption::Git { base_url } => {
            let provider = GitSourceProvider::new();
            match base_url {
                Some(url) => Arc::new(provider.with_base_url(url)),
                None => Arc::new(provider),
            }
        }
    })
}

/// The webhook trigger for a replayed push, or `None` when the push does
/// not target the pipeline's source action.
pub fn push_trigger(
    definition: &StackDefinition,
    push: &PushOptions,
) -> Result<Option<RunTrigger>> {
    let body = std::fs::read(&push.event_file).with_context(|| {
        format!("Failed to read push event: {}", push.event_file.display())
    })?;
    let trigger = match &push.secret {
        Some(secret) => PushTrigger::new().with_secret(secret),
        None => PushTrigger::new(),
    };
    let delivery = WebhookDelivery {
        event: "push".to_string(),
        signature: push.signature.clone(),
        body,
    };
    Ok(trigger.handle(&definition.pipeline, &delivery)?)
}

/// Provision `definition` into an in-process cloud and execute one run.
pub async fn run_local(definition: StackDefinition, options: RunOptions) -> Result<()> {
    let source = source_provider(&options.source)?;
    let push = match &options.push {
        Some(push) => match push_trigger(&definition, push)? {
            Some(trigger) => Some(trigger),
            None => {
                println!(
                    "Push does not target pipeline {}, nothing to run",
                    definition.pipeline.name
                );
                return Ok(());
            }
        },
        None => None,
    };

    let cloud = LocalCloud::new();
    let secrets = Arc::new(secret_store(&definition, options.token.as_deref()));
    let outcome = cloud
        .provisioner(secrets.clone())
        .deploy(&definition)
        .await
        .with_context(|| format!("Failed to provision stack '{}'", definition.name))?;
    let provisioned = outcome.stack.clone();
    println!("Provisioned stack: {}", provisioned.name);
    println!("  bucket: {}", provisioned.bucket_name);
    println!("  distribution: {}", provisioned.distribution_domain);

    let executor: Arc<dyn Executor> = match options.executor {
        ExecutorKind::Process => Arc::new(ProcessExecutor::new()),
        ExecutorKind::Docker => {
            Arc::new(DockerExecutor::new().context("Failed to connect to Docker")?)
        }
    };
    let policy = RetryPolicy::default().with_max_attempts(options.retries);
    let mut builds: Arc<dyn BuildRunner> = Arc::new(ContainerBuildRunner::new(executor));
    let mut deployer: Arc<dyn SiteDeployer> = Arc::new(StoreDeployer::for_stack(
        Arc::new(cloud.content_store()),
        &definition,
        &provisioned,
    ));
    if policy.max_attempts > 1 {
        builds = Arc::new(RetryingBuildRunner::new(builds, policy));
        deployer = Arc::new(RetryingDeployer::new(deployer, policy));
    }
    let approvals: Arc<dyn ApprovalGate> = if options.auto_approve {
        Arc::new(AutoApprove::new())
    } else {
        Arc::new(PromptApproval::stdin())
    };
    let approval_policy = options
        .approval_timeout
        .map(ApprovalPolicy::with_timeout)
        .unwrap_or_default();

    let orchestrator = PipelineOrchestrator::new(
        source,
        secrets,
        approvals,
        builds,
        deployer,
    )
    .with_approval_policy(approval_policy);

    let trigger = push
        .or_else(|| definition_update_trigger(&definition.pipeline, &outcome))
        .unwrap_or_else(|| RunTrigger::Manual {
            actor: std::env::var("USER").ok(),
        });

    println!("\n--- Starting pipeline {} ---\n", definition.pipeline.name);
    let (mut rx, result_handle) = orchestrator.execute(&definition, trigger);

    while let Some(event) = rx.recv().await {
        if options.json_events {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }
        match event {
            PipelineEvent::StageStarted { stage } => {
                println!("▶ Stage '{}' started", stage);
            }
            PipelineEvent::ActionCompleted {
                stage,
                action,
                success,
            } => {
                let marker = if success { "✓" } else { "✗" };
                println!("  [{}] {} {}", stage, marker, action);
            }
            PipelineEvent::StageCompleted { stage, status } => match status {
                StageStatus::Succeeded => {
                    println!("✓ Stage '{}' completed successfully\n", stage)
                }
                StageStatus::Failed { message } => {
                    println!("✗ Stage '{}' failed: {}\n", stage, message)
                }
                StageStatus::Rejected { reason } => {
                    println!("⊘ Stage '{}' rejected: {}\n", stage, reason)
                }
                other => println!("  Stage '{}' ended {:?}\n", stage, other),
            },
            PipelineEvent::RunCompleted { state } => {
                println!("--- Pipeline {} ---", state);
            }
            _ => {}
        }
    }

    let result = result_handle
        .await
        .context("Pipeline execution task failed")?;

    println!("\n--- Stage Summary ---");
    for stage in &result.run.stages {
        let status = match &stage.status {
            StageStatus::Succeeded => "✓ succeeded".to_string(),
            StageStatus::Failed { message } => format!("✗ failed: {}", message),
            StageStatus::Rejected { reason } => format!("⊘ rejected: {}", reason),
            StageStatus::Skipped { reason } => format!("⊘ skipped: {}", reason),
            other => format!("○ {:?}", other),
        };
        println!("  {} - {}", stage.name, status);
    }

    if !result.success() {
        anyhow::bail!("Pipeline run ended {}", result.run.state);
    }

    let page = cloud
        .edge()
        .fetch(&provisioned.distribution_domain, "/")
        .await
        .context("Failed to fetch the deployed site")?;
    println!("\nGET / -> {} ({} bytes)", page.status, page.body.len());
    for (id, value) in &provisioned.outputs {
        println!("{} = {}", id, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sitepipe_config::{GitHubConfig, StackConfig, assemble};
    use sitepipe_core::secret::SecretStore;

    fn definition() -> StackDefinition {
        assemble(&StackConfig::new(GitHubConfig::new("acme", "react-aod"))).unwrap()
    }

    fn push_file(dir: &tempfile::TempDir, branch: &str) -> PathBuf {
        let path = dir.path().join("push.json");
        let payload = json!({
            "ref": format!("refs/heads/{}", branch),
            "before": "0000000",
            "after": "abc1234",
            "repository": { "full_name": "acme/react-aod" },
            "pusher": { "name": "octocat" },
        });
        std::fs::write(&path, serde_json::to_vec(&payload).unwrap()).unwrap();
        path
    }

    fn unsigned(event_file: PathBuf) -> PushOptions {
        PushOptions {
            event_file,
            signature: None,
            secret: None,
        }
    }

    #[test]
    fn test_push_to_tracked_branch_triggers_run() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = push_trigger(&definition(), &unsigned(push_file(&dir, "master"))).unwrap();
        assert!(matches!(
            trigger,
            Some(RunTrigger::Webhook { commit, pusher })
                if commit == "abc1234" && pusher == "octocat"
        ));
    }

    #[test]
    fn test_push_to_other_branch_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = push_trigger(&definition(), &unsigned(push_file(&dir, "feature"))).unwrap();
        assert!(trigger.is_none());
    }

    #[test]
    fn test_badly_signed_push_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let push = PushOptions {
            event_file: push_file(&dir, "master"),
            signature: Some("sha256=00".to_string()),
            secret: Some("hook-secret".to_string()),
        };
        let err = push_trigger(&definition(), &push).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<sitepipe_core::Error>(),
            Some(sitepipe_core::Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_missing_push_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = push_trigger(&definition(), &unsigned(dir.path().join("none.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read push event"));
    }

    #[tokio::test]
    async fn test_token_lands_under_source_secret() {
        let definition = definition();
        let store = secret_store(&definition, Some("ghp_test"));
        assert_eq!(
            store.get("GitHubToken").await.unwrap().field("GitHubToken").as_deref(),
            Some("ghp_test")
        );
        assert!(secret_store(&definition, None).ids("").await.unwrap().is_empty());
    }
}
