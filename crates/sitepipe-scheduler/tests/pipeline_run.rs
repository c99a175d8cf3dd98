//! End-to-end pipeline runs against the local backend.

use async_trait::async_trait;
use sitepipe_config::{GitHubConfig, StackConfig, assemble};
use sitepipe_core::approval::{ApprovalGate, ApprovalPolicy, ApprovalRequest};
use sitepipe_core::artifact::ArtifactBundle;
use sitepipe_core::build::{BuildRequest, BuildRunner};
use sitepipe_core::deploy::{DeployReceipt, DeployRequest, SiteDeployer};
use sitepipe_core::distribution::EdgeResponse;
use sitepipe_core::pipeline::{RunState, RunTrigger, StageStatus};
use sitepipe_core::secret::SecretStore;
use sitepipe_core::source::{SourceProvider, SourceRequest, SourceRevision};
use sitepipe_core::stack::{ProvisionedStack, Provisioner, StackDefinition};
use sitepipe_core::{Error, Result};
use sitepipe_deployer::{InMemorySecretStore, LocalCloud, StoreDeployer};
use sitepipe_scheduler::orchestrator::APPROVAL_EXPIRED;
use sitepipe_scheduler::{
    AutoApprove, ManualApprovalGate, PipelineEvent, PipelineOrchestrator, PipelineResult,
    RetryPolicy, RetryingDeployer,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

struct StaticSource;

#[async_trait]
impl SourceProvider for StaticSource {
    async fn fetch(&self, request: &SourceRequest) -> Result<SourceRevision> {
        assert_eq!(request.token, "ghp_test");
        Ok(SourceRevision {
            commit: Some("abc1234".to_string()),
            bundle: ArtifactBundle::new()
                .with_file("buildspec-prod.yml", "version: 0.2")
                .with_file("src/App.js", "app()"),
        })
    }
}

#[derive(Default)]
struct FakeBuild {
    calls: AtomicU32,
    fail: bool,
    env: Mutex<Option<BTreeMap<String, String>>>,
}

impl FakeBuild {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildRunner for FakeBuild {
    async fn run(&self, request: BuildRequest) -> Result<ArtifactBundle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.env.lock().await = Some(request.env.clone());
        if self.fail {
            return Err(Error::ExecutionFailed(format!(
                "build '{}' failed with exit code 1",
                request.action
            )));
        }
        assert!(request.source.contains("src/App.js"));
        let label = request.env.get("AmplifyEnvProd").cloned().unwrap_or_default();
        Ok(ArtifactBundle::new().with_file("index.html", format!("<h1>{}</h1>", label)))
    }
}

/// Fails the first `failures` deploys, then delegates.
struct FlakyDeployer {
    inner: StoreDeployer,
    failures: AtomicU32,
}

#[async_trait]
impl SiteDeployer for FlakyDeployer {
    async fn deploy(&self, request: DeployRequest) -> Result<DeployReceipt> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::DeploymentFailed("store unreachable".to_string()));
        }
        self.inner.deploy(request).await
    }
}

struct Harness {
    cloud: LocalCloud,
    definition: StackDefinition,
    provisioned: ProvisionedStack,
    secrets: Arc<InMemorySecretStore>,
}

impl Harness {
    async fn new() -> Self {
        let definition = assemble(&StackConfig::new(GitHubConfig::new("acme", "react-aod")))
            .unwrap();
        let cloud = LocalCloud::new();
        let secrets = Arc::new(
            InMemorySecretStore::new().with_field("GitHubToken", "GitHubToken", "ghp_test"),
        );
        let outcome = cloud
            .provisioner(secrets.clone())
            .deploy(&definition)
            .await
            .unwrap();
        Self {
            cloud,
            definition,
            provisioned: outcome.stack,
            secrets,
        }
    }

    fn deployer(&self) -> StoreDeployer {
        StoreDeployer::for_stack(
            Arc::new(self.cloud.content_store()),
            &self.definition,
            &self.provisioned,
        )
    }

    fn orchestrator(
        &self,
        approvals: Arc<dyn ApprovalGate>,
        builds: Arc<dyn BuildRunner>,
        deployer: Arc<dyn SiteDeployer>,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            Arc::new(StaticSource),
            self.secrets.clone(),
            approvals,
            builds,
            deployer,
        )
    }

    async fn run(&self, orchestrator: &PipelineOrchestrator) -> PipelineResult {
        let (_events, handle) = orchestrator.execute(
            &self.definition,
            RunTrigger::Manual {
                actor: Some("test".to_string()),
            },
        );
        handle.await.unwrap()
    }

    async fn fetch(&self, path: &str) -> EdgeResponse {
        self.cloud
            .edge()
            .fetch(&self.provisioned.distribution_domain, path)
            .await
            .unwrap()
    }
}

async fn wait_until_pending(gate: &ManualApprovalGate) -> ApprovalRequest {
    loop {
        if let Some(request) = gate.pending().await.into_iter().next() {
            return request;
        }
        tokio::task::yield_now().await;
    }
}

fn status<'a>(result: &'a PipelineResult, stage: &str) -> &'a StageStatus {
    &result.run.stage(stage).unwrap().status
}

#[tokio::test]
async fn test_auto_approved_run_deploys_site() {
    let harness = Harness::new().await;
    let builds = Arc::new(FakeBuild::default());
    let orchestrator = harness.orchestrator(
        Arc::new(AutoApprove::new()),
        builds.clone(),
        Arc::new(harness.deployer()),
    );

    let (mut events, handle) = orchestrator.execute(
        &harness.definition,
        RunTrigger::Manual { actor: None },
    );
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    let result = handle.await.unwrap();

    assert!(result.success());
    assert_eq!(result.run.state, RunState::Succeeded);
    assert_eq!(result.run.commit.as_deref(), Some("abc1234"));
    assert!(result.run.finished_at.is_some());
    for stage in ["Source", "Approval", "Build", "Deploy"] {
        assert_eq!(status(&result, stage), &StageStatus::Succeeded);
    }
    assert_eq!(builds.calls(), 1);
    assert_eq!(result.deploys.len(), 1);

    let env = builds.env.lock().await.clone().unwrap();
    assert_eq!(env.get("AmplifyEnvProd").map(String::as_str), Some("prod"));

    let started: Vec<&str> = seen
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StageStarted { stage } => Some(stage.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["Source", "Approval", "Build", "Deploy"]);
    assert!(matches!(
        seen.last(),
        Some(PipelineEvent::RunCompleted {
            state: RunState::Succeeded
        })
    ));

    let page = harness.fetch("/").await;
    assert_eq!(page.status, 200);
    assert_eq!(page.body.as_ref(), b"<h1>prod</h1>");
    let routed = harness.fetch("/orders/42").await;
    assert_eq!(routed.status, 200);
    assert_eq!(routed.body.as_ref(), b"<h1>prod</h1>");
}

#[tokio::test]
async fn test_rejected_approval_never_builds() {
    let harness = Harness::new().await;
    let gate = Arc::new(ManualApprovalGate::new());
    let builds = Arc::new(FakeBuild::default());
    let orchestrator =
        harness.orchestrator(gate.clone(), builds.clone(), Arc::new(harness.deployer()));

    let (_events, handle) =
        orchestrator.execute(&harness.definition, RunTrigger::Manual { actor: None });

    let request = wait_until_pending(&gate).await;
    assert_eq!(request.stage, "Approval");
    assert_eq!(request.additional_information, "This deploy is scary, are u sure?!");
    gate.reject(request.run_id, Some("ops".to_string()), "freeze week")
        .await
        .unwrap();

    let result = handle.await.unwrap();
    assert_eq!(
        result.run.state,
        RunState::Rejected {
            reason: "freeze week".to_string()
        }
    );
    assert_eq!(builds.calls(), 0);
    assert!(result.deploys.is_empty());
    assert!(matches!(status(&result, "Approval"), StageStatus::Rejected { .. }));
    assert!(matches!(status(&result, "Build"), StageStatus::Skipped { .. }));
    assert!(matches!(status(&result, "Deploy"), StageStatus::Skipped { .. }));
    assert_eq!(harness.fetch("/").await.status, 404);
}

#[tokio::test]
async fn test_manual_approval_resumes_run() {
    let harness = Harness::new().await;
    let gate = Arc::new(ManualApprovalGate::new());
    let builds = Arc::new(FakeBuild::default());
    let orchestrator =
        harness.orchestrator(gate.clone(), builds.clone(), Arc::new(harness.deployer()));

    let (_events, handle) =
        orchestrator.execute(&harness.definition, RunTrigger::Manual { actor: None });
    let request = wait_until_pending(&gate).await;
    assert_eq!(builds.calls(), 0);

    gate.approve(request.run_id, Some("ops".to_string()))
        .await
        .unwrap();
    let result = handle.await.unwrap();
    assert!(result.success());
    assert_eq!(builds.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_approval_timeout_rejects_run() {
    let harness = Harness::new().await;
    let gate = Arc::new(ManualApprovalGate::new());
    let builds = Arc::new(FakeBuild::default());
    let orchestrator = harness
        .orchestrator(gate.clone(), builds.clone(), Arc::new(harness.deployer()))
        .with_approval_policy(ApprovalPolicy::with_timeout(Duration::from_secs(3600)));

    let started = tokio::time::Instant::now();
    let result = harness.run(&orchestrator).await;

    assert_eq!(
        result.run.state,
        RunState::Rejected {
            reason: APPROVAL_EXPIRED.to_string()
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(3600));
    assert_eq!(builds.calls(), 0);
    assert!(gate.pending().await.is_empty());
}

#[tokio::test]
async fn test_build_failure_keeps_previous_site() {
    let harness = Harness::new().await;
    let first = harness.orchestrator(
        Arc::new(AutoApprove::new()),
        Arc::new(FakeBuild::default()),
        Arc::new(harness.deployer()),
    );
    assert!(harness.run(&first).await.success());

    let builds = Arc::new(FakeBuild::failing());
    let second = harness.orchestrator(
        Arc::new(AutoApprove::new()),
        builds.clone(),
        Arc::new(harness.deployer()),
    );
    let result = harness.run(&second).await;

    assert!(matches!(
        result.run.state,
        RunState::Failed { ref stage, ref message }
            if stage == "Build" && message.contains("exit code 1")
    ));
    assert!(matches!(status(&result, "Build"), StageStatus::Failed { .. }));
    assert!(matches!(status(&result, "Deploy"), StageStatus::Skipped { .. }));
    // no retry at the stage level
    assert_eq!(builds.calls(), 1);
    assert_eq!(harness.fetch("/").await.body.as_ref(), b"<h1>prod</h1>");
}

#[tokio::test]
async fn test_unreachable_store_fails_deploy() {
    let harness = Harness::new().await;
    let first = harness.orchestrator(
        Arc::new(AutoApprove::new()),
        Arc::new(FakeBuild::default()),
        Arc::new(harness.deployer()),
    );
    assert!(harness.run(&first).await.success());

    harness
        .cloud
        .set_accepts_writes(&harness.provisioned.bucket_name, false)
        .await
        .unwrap();
    let result = harness.run(&first).await;

    assert!(matches!(result.run.state, RunState::Failed { ref stage, .. } if stage == "Deploy"));
    assert_eq!(harness.fetch("/").await.body.as_ref(), b"<h1>prod</h1>");
}

#[tokio::test(start_paused = true)]
async fn test_retrying_deployer_recovers() {
    let harness = Harness::new().await;
    let flaky = Arc::new(FlakyDeployer {
        inner: harness.deployer(),
        failures: AtomicU32::new(2),
    });
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_secs(5),
        multiplier: 2.0,
    };
    let orchestrator = harness.orchestrator(
        Arc::new(AutoApprove::new()),
        Arc::new(FakeBuild::default()),
        Arc::new(RetryingDeployer::new(flaky, policy)),
    );

    let result = harness.run(&orchestrator).await;
    assert!(result.success());
    assert_eq!(result.deploys.len(), 1);
}

#[tokio::test]
async fn test_missing_token_fails_source() {
    let harness = Harness::new().await;
    harness.secrets.delete("GitHubToken").await.unwrap();
    let builds = Arc::new(FakeBuild::default());
    let orchestrator = harness.orchestrator(
        Arc::new(AutoApprove::new()),
        builds.clone(),
        Arc::new(harness.deployer()),
    );

    let result = harness.run(&orchestrator).await;
    assert!(matches!(
        result.run.state,
        RunState::Failed { ref stage, ref message }
            if stage == "Source" && message.contains("cannot authenticate")
    ));
    assert!(matches!(status(&result, "Approval"), StageStatus::Skipped { .. }));
    assert_eq!(builds.calls(), 0);
}
