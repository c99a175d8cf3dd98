//! Pipeline definitions and the run state machine.
//!
//! A [`PipelineDefinition`] is an immutable value: ordered stages whose
//! actions are wired together through [`ArtifactSlot`] ids. A
//! [`PipelineRun`] is one execution of it, driven through [`RunState`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::artifact::ArtifactSlot;
use crate::secret::SecretRef;
use crate::{Error, LogicalId, ResourceId, Result};

/// A continuous-delivery pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (e.g., "MasterAoD").
    pub name: String,
    /// Start a new run whenever the definition itself changes.
    pub restart_execution_on_update: bool,
    /// Artifact slots declared by the pipeline.
    pub artifacts: Vec<ArtifactSlot>,
    /// Stages, executed strictly in order.
    pub stages: Vec<Stage>,
}

/// A stage in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

/// A single unit of work within a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    /// Actions sharing a run order within a stage may run concurrently.
    pub run_order: u32,
    pub kind: ActionKind,
}

/// What an action does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Source(SourceAction),
    ManualApproval(ApprovalAction),
    Build(BuildAction),
    Deploy(DeployAction),
}

/// When a source action starts the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTrigger {
    /// Push webhooks from the tracked branch.
    Webhook,
    /// Periodic polling.
    Poll,
    /// Manual runs only.
    None,
}

/// Subscribes to one branch of a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAction {
    pub owner: String,
    pub repository: String,
    pub branch: String,
    pub oauth_token: SecretRef,
    pub trigger: SourceTrigger,
    pub output: ResourceId,
}

/// Blocks the run until an operator decides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalAction {
    pub additional_information: String,
}

/// Runs a build project against an input artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAction {
    pub project: LogicalId,
    pub input: ResourceId,
    pub outputs: Vec<ResourceId>,
    pub environment_variables: BTreeMap<String, String>,
}

/// Writes an artifact into a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployAction {
    pub bucket: LogicalId,
    pub input: ResourceId,
}

impl ActionKind {
    /// The run state while an action of this kind is in progress.
    pub fn active_state(&self) -> RunState {
        match self {
            ActionKind::Source(_) => RunState::SourceFetching,
            ActionKind::ManualApproval(_) => RunState::AwaitingApproval,
            ActionKind::Build(_) => RunState::Building,
            ActionKind::Deploy(_) => RunState::Deploying,
        }
    }

    /// The event that completes an action of this kind.
    pub fn success_event(&self) -> RunEvent {
        match self {
            ActionKind::Source(_) => RunEvent::SourceFetched,
            ActionKind::ManualApproval(_) => RunEvent::Approved,
            ActionKind::Build(_) => RunEvent::Built,
            ActionKind::Deploy(_) => RunEvent::Deployed,
        }
    }
}

impl Action {
    /// Artifact slots this action consumes.
    pub fn inputs(&self) -> Vec<ResourceId> {
        match &self.kind {
            ActionKind::Build(b) => vec![b.input],
            ActionKind::Deploy(d) => vec![d.input],
            ActionKind::Source(_) | ActionKind::ManualApproval(_) => Vec::new(),
        }
    }

    /// Artifact slots this action produces.
    pub fn outputs(&self) -> Vec<ResourceId> {
        match &self.kind {
            ActionKind::Source(s) => vec![s.output],
            ActionKind::Build(b) => b.outputs.clone(),
            ActionKind::ManualApproval(_) | ActionKind::Deploy(_) => Vec::new(),
        }
    }
}

impl Stage {
    /// Actions grouped by run order, lowest first.
    pub fn run_order_groups(&self) -> Vec<Vec<&Action>> {
        let mut groups: BTreeMap<u32, Vec<&Action>> = BTreeMap::new();
        for action in &self.actions {
            groups.entry(action.run_order).or_default().push(action);
        }
        groups.into_values().collect()
    }
}

impl PipelineDefinition {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn artifact(&self, id: &ResourceId) -> Option<&ArtifactSlot> {
        self.artifacts.iter().find(|a| a.id == *id)
    }

    /// The stage index and action that produce `artifact`.
    pub fn producer_of(&self, artifact: &ResourceId) -> Option<(usize, &Action)> {
        self.stages.iter().enumerate().find_map(|(idx, stage)| {
            stage
                .actions
                .iter()
                .find(|a| a.outputs().contains(artifact))
                .map(|a| (idx, a))
        })
    }

    /// Every stage index and action that consumes `artifact`.
    pub fn consumers_of(&self, artifact: &ResourceId) -> Vec<(usize, &Action)> {
        self.stages
            .iter()
            .enumerate()
            .flat_map(|(idx, stage)| {
                stage
                    .actions
                    .iter()
                    .filter(|a| a.inputs().contains(artifact))
                    .map(move |a| (idx, a))
            })
            .collect()
    }

    pub fn source_actions(&self) -> impl Iterator<Item = &SourceAction> {
        self.stages
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter_map(|a| match &a.kind {
                ActionKind::Source(source) => Some(source),
                _ => None,
            })
    }

    /// Check the structural invariants of the definition.
    ///
    /// - every stage has at least one action and a unique name
    /// - action names are unique across the pipeline
    /// - source actions appear only in the first stage, which holds nothing else
    /// - every referenced artifact is declared and produced exactly once
    /// - an action only consumes artifacts produced by an earlier stage
    pub fn validate(&self) -> Result<()> {
        if self.stages.len() < 2 {
            return Err(Error::InvalidDefinition(format!(
                "pipeline '{}' needs at least two stages",
                self.name
            )));
        }

        let mut stage_names = HashSet::new();
        let mut action_names = HashSet::new();
        for (idx, stage) in self.stages.iter().enumerate() {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(Error::InvalidDefinition(format!(
                    "duplicate stage '{}'",
                    stage.name
                )));
            }
            if stage.actions.is_empty() {
                return Err(Error::InvalidDefinition(format!(
                    "stage '{}' has no actions",
                    stage.name
                )));
            }
            for action in &stage.actions {
                if !action_names.insert(action.name.as_str()) {
                    return Err(Error::InvalidDefinition(format!(
                        "duplicate action '{}'",
                        action.name
                    )));
                }
                let is_source = matches!(action.kind, ActionKind::Source(_));
                if is_source != (idx == 0) {
                    return Err(Error::InvalidDefinition(format!(
                        "action '{}': source actions belong only in the first stage",
                        action.name
                    )));
                }
            }
        }

        let declared: HashSet<ResourceId> = self.artifacts.iter().map(|a| a.id).collect();
        let mut produced_at: HashMap<ResourceId, usize> = HashMap::new();
        for (idx, stage) in self.stages.iter().enumerate() {
            for action in &stage.actions {
                for output in action.outputs() {
                    if !declared.contains(&output) {
                        return Err(Error::InvalidDefinition(format!(
                            "action '{}' produces undeclared artifact {}",
                            action.name, output
                        )));
                    }
                    if produced_at.insert(output, idx).is_some() {
                        return Err(Error::InvalidDefinition(format!(
                            "artifact {} is produced more than once",
                            output
                        )));
                    }
                }
            }
        }

        for (idx, stage) in self.stages.iter().enumerate() {
            for action in &stage.actions {
                for input in action.inputs() {
                    match produced_at.get(&input) {
                        Some(&producer) if producer < idx => {}
                        Some(_) => {
                            return Err(Error::InvalidDefinition(format!(
                                "action '{}' consumes artifact {} before it is produced",
                                action.name, input
                            )));
                        }
                        None => {
                            return Err(Error::InvalidDefinition(format!(
                                "action '{}' consumes artifact {} that nothing produces",
                                action.name, input
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// State of a pipeline run.
///
/// ```text
/// Idle -> SourceFetching -> AwaitingApproval -> Building -> Deploying -> Succeeded
///              |                   |               |            |
///              v                   v               v            v
///            Failed            Rejected          Failed       Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    SourceFetching,
    AwaitingApproval,
    Building,
    Deploying,
    /// The run finished; the pipeline is idle again.
    Succeeded,
    Failed { stage: String, message: String },
    Rejected { reason: String },
}

/// Inputs to the run state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEvent {
    Start,
    SourceFetched,
    Approved,
    Declined { reason: String },
    Built,
    Deployed,
    ActionFailed { stage: String, message: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed { .. } | RunState::Rejected { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunState::Succeeded)
    }

    /// Apply `event`, returning the next state.
    ///
    /// Any pair not in the transition table is a `Conflict`. Terminal states
    /// accept no events; a new run starts from `Idle`.
    pub fn transition(&self, event: &RunEvent) -> Result<RunState> {
        use RunEvent as E;
        use RunState as S;

        let next = match (self, event) {
            (S::Idle, E::Start) => S::SourceFetching,
            (S::SourceFetching, E::SourceFetched) => S::AwaitingApproval,
            (S::AwaitingApproval, E::Approved) => S::Building,
            (S::AwaitingApproval, E::Declined { reason }) => S::Rejected {
                reason: reason.clone(),
            },
            (S::Building, E::Built) => S::Deploying,
            (S::Deploying, E::Deployed) => S::Succeeded,
            (
                S::SourceFetching | S::Building | S::Deploying,
                E::ActionFailed { stage, message },
            ) => S::Failed {
                stage: stage.clone(),
                message: message.clone(),
            },
            (state, event) => {
                return Err(Error::Conflict(format!(
                    "no transition from {} on {:?}",
                    state, event
                )));
            }
        };
        Ok(next)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::SourceFetching => write!(f, "source_fetching"),
            RunState::AwaitingApproval => write!(f, "awaiting_approval"),
            RunState::Building => write!(f, "building"),
            RunState::Deploying => write!(f, "deploying"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::Failed { stage, .. } => write!(f, "failed ({})", stage),
            RunState::Rejected { .. } => write!(f, "rejected"),
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunTrigger {
    Manual { actor: Option<String> },
    Webhook { commit: String, pusher: String },
    DefinitionUpdated { fingerprint: String },
}

/// A pipeline run instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: ResourceId,
    pub pipeline: String,
    pub trigger: RunTrigger,
    pub state: RunState,
    pub stages: Vec<StageResult>,
    /// Commit checked out by the source stage.
    pub commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(definition: &PipelineDefinition, trigger: RunTrigger) -> Self {
        Self {
            id: ResourceId::new(),
            pipeline: definition.name.clone(),
            trigger,
            state: RunState::Idle,
            stages: definition
                .stages
                .iter()
                .map(|s| StageResult::pending(&s.name))
                .collect(),
            commit: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply an event to the run state.
    pub fn apply(&mut self, event: &RunEvent) -> Result<&RunState> {
        self.state = self.state.transition(event)?;
        match self.state {
            RunState::SourceFetching if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            ref s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(&self.state)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageResult> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self, status: StageStatus) {
        self.status = status;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: StageStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Status of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    /// Waiting for earlier stages.
    Pending,
    /// Currently executing.
    Running,
    /// Waiting for manual approval.
    WaitingApproval,
    /// Completed successfully.
    Succeeded,
    /// Failed.
    Failed { message: String },
    /// The approval was declined.
    Rejected { reason: String },
    /// Never started because an earlier stage did not succeed.
    Skipped { reason: String },
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded
                | StageStatus::Failed { .. }
                | StageStatus::Rejected { .. }
                | StageStatus::Skipped { .. }
        )
    }
}
