//! Pipeline orchestrator - drives one run through its stages.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use sitepipe_core::approval::{ApprovalDecision, ApprovalGate, ApprovalPolicy, ApprovalRequest};
use sitepipe_core::artifact::ArtifactBundle;
use sitepipe_core::build::{BuildRequest, BuildRunner};
use sitepipe_core::deploy::{DeployReceipt, DeployRequest, SiteDeployer};
use sitepipe_core::pipeline::{
    Action, ActionKind, PipelineRun, RunEvent, RunState, RunTrigger, Stage, StageStatus,
};
use sitepipe_core::secret::SecretStore;
use sitepipe_core::source::{SourceProvider, SourceRequest};
use sitepipe_core::stack::StackDefinition;
use sitepipe_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Reason recorded when an approval wait exceeds the policy timeout.
pub const APPROVAL_EXPIRED: &str = "approval expired";

/// Event emitted during pipeline execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted { run_id: ResourceId, pipeline: String },
    StageStarted { stage: String },
    ActionStarted { stage: String, action: String },
    ApprovalRequested { request: ApprovalRequest },
    ActionCompleted { stage: String, action: String, success: bool },
    StageCompleted { stage: String, status: StageStatus },
    RunCompleted { state: RunState },
}

/// Result of a pipeline execution.
#[derive(Debug)]
pub struct PipelineResult {
    pub run: PipelineRun,
    /// Contents of every artifact slot that was filled, by slot id.
    pub artifacts: HashMap<ResourceId, ArtifactBundle>,
    pub deploys: Vec<DeployReceipt>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.run.state.is_success()
    }
}

/// What one action handed back.
#[derive(Default)]
struct ActionOutput {
    artifacts: Vec<(ResourceId, ArtifactBundle)>,
    commit: Option<String>,
    receipt: Option<DeployReceipt>,
}

/// Orchestrates the execution of a stack's pipeline.
///
/// Stages run strictly in order. Within a stage, actions sharing a run
/// order run concurrently and the next run order starts once they all
/// finished. The first failure ends the run and skips the remaining stages.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    sources: Arc<dyn SourceProvider>,
    secrets: Arc<dyn SecretStore>,
    approvals: Arc<dyn ApprovalGate>,
    builds: Arc<dyn BuildRunner>,
    deployer: Arc<dyn SiteDeployer>,
    approval_policy: ApprovalPolicy,
}

impl PipelineOrchestrator {
    pub fn new(
        sources: Arc<dyn SourceProvider>,
        secrets: Arc<dyn SecretStore>,
        approvals: Arc<dyn ApprovalGate>,
        builds: Arc<dyn BuildRunner>,
        deployer: Arc<dyn SiteDeployer>,
    ) -> Self {
        Self {
            sources,
            secrets,
            approvals,
            builds,
            deployer,
            approval_policy: ApprovalPolicy::default(),
        }
    }

    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval_policy = policy;
        self
    }

    /// Execute one run, returning a channel of events and a handle to get the final result.
    pub fn execute(
        &self,
        definition: &StackDefinition,
        trigger: RunTrigger,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let orchestrator = self.clone();
        let definition = definition.clone();

        let handle =
            tokio::spawn(async move { orchestrator.execute_inner(definition, trigger, tx).await });

        (rx, handle)
    }

    async fn execute_inner(
        &self,
        definition: StackDefinition,
        trigger: RunTrigger,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        let pipeline = &definition.pipeline;
        let mut run = PipelineRun::new(pipeline, trigger);
        let mut artifacts: HashMap<ResourceId, ArtifactBundle> = HashMap::new();
        let mut deploys = Vec::new();

        info!(
            run_id = %run.id,
            pipeline = %pipeline.name,
            trigger = ?run.trigger,
            "Starting pipeline run"
        );
        let _ = tx
            .send(PipelineEvent::RunStarted {
                run_id: run.id,
                pipeline: pipeline.name.clone(),
            })
            .await;
        let first_stage = pipeline
            .stages
            .first()
            .map(|s| s.name.clone())
            .unwrap_or_default();
        Self::advance(&mut run, RunEvent::Start, &first_stage);

        for stage in &pipeline.stages {
            if run.state.is_terminal() {
                let reason = format!("run ended in {}", run.state);
                if let Some(result) = run.stage_mut(&stage.name) {
                    result.finish(StageStatus::Skipped { reason });
                }
                continue;
            }

            let waits = stage
                .actions
                .iter()
                .any(|a| matches!(a.kind, ActionKind::ManualApproval(_)));
            if let Some(result) = run.stage_mut(&stage.name) {
                result.start(if waits {
                    StageStatus::WaitingApproval
                } else {
                    StageStatus::Running
                });
            }
            info!(run_id = %run.id, stage = %stage.name, "Stage started");
            let _ = tx
                .send(PipelineEvent::StageStarted {
                    stage: stage.name.clone(),
                })
                .await;

            let status = match self
                .execute_stage(&definition, run.id, stage, &mut artifacts, &tx)
                .await
            {
                Ok(outputs) => {
                    for output in outputs {
                        if output.commit.is_some() {
                            run.commit = output.commit;
                        }
                        deploys.extend(output.receipt);
                    }
                    info!(run_id = %run.id, stage = %stage.name, "Stage completed successfully");
                    if let Some(event) = stage.actions.first().map(|a| a.kind.success_event()) {
                        Self::advance(&mut run, event, &stage.name);
                    }
                    StageStatus::Succeeded
                }
                Err(Error::Rejected(reason)) => {
                    warn!(
                        run_id = %run.id,
                        stage = %stage.name,
                        reason = %reason,
                        "Stage rejected"
                    );
                    Self::advance(
                        &mut run,
                        RunEvent::Declined {
                            reason: reason.clone(),
                        },
                        &stage.name,
                    );
                    StageStatus::Rejected { reason }
                }
                Err(e) => {
                    error!(run_id = %run.id, stage = %stage.name, error = %e, "Stage failed");
                    let message = e.to_string();
                    Self::advance(
                        &mut run,
                        RunEvent::ActionFailed {
                            stage: stage.name.clone(),
                            message: message.clone(),
                        },
                        &stage.name,
                    );
                    StageStatus::Failed { message }
                }
            };

            if let Some(result) = run.stage_mut(&stage.name) {
                result.finish(status.clone());
            }
            let _ = tx
                .send(PipelineEvent::StageCompleted {
                    stage: stage.name.clone(),
                    status,
                })
                .await;
        }

        info!(
            run_id = %run.id,
            pipeline = %pipeline.name,
            state = %run.state,
            "Pipeline run finished"
        );
        let _ = tx
            .send(PipelineEvent::RunCompleted {
                state: run.state.clone(),
            })
            .await;

        PipelineResult {
            run,
            artifacts,
            deploys,
        }
    }

    /// Apply `event`; a transition the state machine refuses fails the run.
    fn advance(run: &mut PipelineRun, event: RunEvent, stage: &str) {
        if let Err(e) = run.apply(&event) {
            error!(run_id = %run.id, stage, error = %e, "Invalid run transition");
            run.state = RunState::Failed {
                stage: stage.to_string(),
                message: e.to_string(),
            };
            run.finished_at = Some(Utc::now());
        }
    }

    async fn execute_stage(
        &self,
        definition: &StackDefinition,
        run_id: ResourceId,
        stage: &Stage,
        artifacts: &mut HashMap<ResourceId, ArtifactBundle>,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<Vec<ActionOutput>> {
        let mut outputs = Vec::new();

        for group in stage.run_order_groups() {
            let results = {
                let available = &*artifacts;
                join_all(group.iter().map(|action| async move {
                    let _ = tx
                        .send(PipelineEvent::ActionStarted {
                            stage: stage.name.clone(),
                            action: action.name.clone(),
                        })
                        .await;
                    let result = self
                        .execute_action(definition, run_id, stage, action, available, tx)
                        .await;
                    let _ = tx
                        .send(PipelineEvent::ActionCompleted {
                            stage: stage.name.clone(),
                            action: action.name.clone(),
                            success: result.is_ok(),
                        })
                        .await;
                    result
                }))
                .await
            };

            for result in results {
                let output = result?;
                for (slot, bundle) in &output.artifacts {
                    artifacts.insert(*slot, bundle.clone());
                }
                outputs.push(output);
            }
        }

        Ok(outputs)
    }

    async fn execute_action(
        &self,
        definition: &StackDefinition,
        run_id: ResourceId,
        stage: &Stage,
        action: &Action,
        artifacts: &HashMap<ResourceId, ArtifactBundle>,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<ActionOutput> {
        let input = |slot: &ResourceId| {
            artifacts.get(slot).cloned().ok_or_else(|| {
                Error::Internal(format!(
                    "action '{}' runs before its input artifact was produced",
                    action.name
                ))
            })
        };

        match &action.kind {
            ActionKind::Source(source) => {
                let token = source
                    .oauth_token
                    .resolve(self.secrets.as_ref())
                    .await
                    .map_err(|e| {
                        Error::ExecutionFailed(format!(
                            "cannot authenticate to {}/{}: {}",
                            source.owner, source.repository, e
                        ))
                    })?;
                let request = SourceRequest {
                    owner: source.owner.clone(),
                    repository: source.repository.clone(),
                    branch: source.branch.clone(),
                    token,
                };
                let revision = self.sources.fetch(&request).await?;
                Ok(ActionOutput {
                    artifacts: vec![(source.output, revision.bundle)],
                    commit: revision.commit,
                    receipt: None,
                })
            }
            ActionKind::ManualApproval(approval) => {
                let request = ApprovalRequest {
                    run_id,
                    stage: stage.name.clone(),
                    action: action.name.clone(),
                    additional_information: approval.additional_information.clone(),
                    requested_at: Utc::now(),
                };
                let _ = tx
                    .send(PipelineEvent::ApprovalRequested {
                        request: request.clone(),
                    })
                    .await;

                let waiting = self.approvals.wait_for_decision(request);
                let decision = match self.approval_policy.timeout {
                    Some(limit) => match tokio::time::timeout(limit, waiting).await {
                        Ok(decision) => decision,
                        Err(_) => {
                            warn!(
                                run_id = %run_id,
                                action = %action.name,
                                timeout = ?limit,
                                "Approval timed out"
                            );
                            return Err(Error::Rejected(APPROVAL_EXPIRED.to_string()));
                        }
                    },
                    None => waiting.await,
                };

                match decision {
                    Ok(ApprovalDecision::Approved { by }) => {
                        info!(run_id = %run_id, action = %action.name, by = ?by, "Approved");
                        Ok(ActionOutput::default())
                    }
                    Ok(ApprovalDecision::Rejected { by, reason }) => {
                        info!(run_id = %run_id, action = %action.name, by = ?by, "Rejected");
                        Err(Error::Rejected(reason))
                    }
                    Err(e) => Err(Error::Rejected(format!("approval failed: {}", e))),
                }
            }
            ActionKind::Build(build) => {
                if build.project != definition.build_project.logical_id {
                    return Err(Error::Internal(format!(
                        "unknown build project '{}'",
                        build.project
                    )));
                }
                let request = BuildRequest {
                    run_id,
                    action: action.name.clone(),
                    project: definition.build_project.clone(),
                    source: input(&build.input)?,
                    env: build.environment_variables.clone(),
                };
                let bundle = self.builds.run(request).await?;
                Ok(ActionOutput {
                    artifacts: build
                        .outputs
                        .iter()
                        .map(|slot| (*slot, bundle.clone()))
                        .collect(),
                    ..ActionOutput::default()
                })
            }
            ActionKind::Deploy(deploy) => {
                let request = DeployRequest {
                    run_id,
                    action: action.name.clone(),
                    bucket: deploy.bucket.clone(),
                    bundle: input(&deploy.input)?,
                };
                let receipt = self.deployer.deploy(request).await?;
                info!(
                    run_id = %run_id,
                    bucket = %receipt.bucket,
                    objects = receipt.objects_written,
                    checksum = %receipt.checksum,
                    "Site deployed"
                );
                Ok(ActionOutput {
                    receipt: Some(receipt),
                    ..ActionOutput::default()
                })
            }
        }
    }
}
