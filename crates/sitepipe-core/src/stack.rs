//! The immutable stack definition and the provisioning port.
//!
//! Assembly produces a [`StackDefinition`]: a plain value holding the
//! pipeline, the build role and project, the hosting bucket and its
//! distribution front. A [`Provisioner`] turns that value into live
//! resources.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::build::BuildProject;
use crate::distribution::{DistributionSpec, OriginAccessIdentity};
use crate::id::MAX_LOGICAL_ID_LEN;
use crate::pipeline::{ActionKind, PipelineDefinition};
use crate::policy::{BUILD_SERVICE_PRINCIPAL, Principal, Role};
use crate::secret::SecretRef;
use crate::store::BucketSpec;
use crate::{Error, LogicalId, Result};

/// The value a stack output resolves to once provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "ref", rename_all = "snake_case")]
pub enum OutputValue {
    /// Public domain name of the distribution with this logical id.
    DistributionDomainName(LogicalId),
    /// Physical name of the bucket with this logical id.
    BucketName(LogicalId),
}

/// A named, optionally exported stack output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    pub logical_id: String,
    pub value: OutputValue,
    pub export_name: Option<String>,
}

/// Everything one stack declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDefinition {
    pub name: String,
    pub pipeline: PipelineDefinition,
    pub build_role: Role,
    pub build_project: BuildProject,
    pub bucket: BucketSpec,
    pub origin_access_identity: OriginAccessIdentity,
    pub distribution: DistributionSpec,
    pub outputs: Vec<StackOutput>,
}

impl StackDefinition {
    /// SHA-256 over the JSON encoding of the whole definition.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(self)
    }

    /// Fingerprint of the parts that make up the pipeline wiring.
    ///
    /// Artifact slot ids are regenerated on every assembly, so slots are
    /// compared by name and each action by its non-artifact settings.
    pub fn pipeline_fingerprint(&self) -> String {
        let stages: Vec<(String, Vec<serde_json::Value>)> = self
            .pipeline
            .stages
            .iter()
            .map(|stage| {
                let actions = stage
                    .actions
                    .iter()
                    .map(|action| {
                        let kind = match &action.kind {
                            ActionKind::Source(s) => serde_json::json!({
                                "owner": s.owner,
                                "repository": s.repository,
                                "branch": s.branch,
                                "oauth_token": s.oauth_token,
                                "trigger": s.trigger,
                            }),
                            ActionKind::ManualApproval(a) => serde_json::json!({
                                "additional_information": a.additional_information,
                            }),
                            ActionKind::Build(b) => serde_json::json!({
                                "project": b.project,
                                "environment_variables": b.environment_variables,
                            }),
                            ActionKind::Deploy(d) => serde_json::json!({
                                "bucket": d.bucket,
                            }),
                        };
                        serde_json::json!({
                            "name": action.name,
                            "run_order": action.run_order,
                            "inputs": self.slot_names(&action.inputs()),
                            "outputs": self.slot_names(&action.outputs()),
                            "kind": kind,
                        })
                    })
                    .collect();
                (stage.name.clone(), actions)
            })
            .collect();

        fingerprint_of(&(
            &self.pipeline.name,
            self.pipeline.restart_execution_on_update,
            stages,
            &self.build_project,
        ))
    }

    fn slot_names(&self, ids: &[crate::ResourceId]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.pipeline.artifact(id).map(|slot| slot.name.clone()))
            .collect()
    }

    /// Secret references the stack needs at provisioning time.
    pub fn secret_refs(&self) -> Vec<&SecretRef> {
        self.pipeline
            .source_actions()
            .map(|source| &source.oauth_token)
            .collect()
    }

    pub fn output(&self, logical_id: &str) -> Option<&StackOutput> {
        self.outputs.iter().find(|o| o.logical_id == logical_id)
    }

    /// Check cross-resource references.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidDefinition("stack name is empty".to_string()));
        }

        let declared = [
            &self.build_role.logical_id,
            &self.build_project.logical_id,
            &self.bucket.logical_id,
            &self.origin_access_identity.logical_id,
            &self.distribution.logical_id,
        ];
        if let Some(bad) = declared.iter().find(|id| !id.is_valid()) {
            return Err(Error::InvalidDefinition(format!(
                "logical id '{}' must be 1-{} alphanumeric characters",
                bad, MAX_LOGICAL_ID_LEN
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        if let Some(dup) = declared.iter().find(|id| !seen.insert(**id)) {
            return Err(Error::InvalidDefinition(format!(
                "logical id '{}' is declared twice",
                dup
            )));
        }

        self.pipeline.validate()?;
        self.distribution.validate()?;

        if self.build_role.statements().is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "role '{}' has no policy statements",
                self.build_role.logical_id
            )));
        }
        let build_service = Principal::Service(BUILD_SERVICE_PRINCIPAL.to_string());
        if !self.build_role.can_be_assumed_by(&build_service) {
            return Err(Error::InvalidDefinition(format!(
                "role '{}' must be assumable only by {}",
                self.build_role.logical_id, BUILD_SERVICE_PRINCIPAL
            )));
        }
        if !self.build_project.role.is_current(&self.build_role) {
            return Err(Error::InvalidDefinition(format!(
                "role '{}' changed after it was handed to project '{}'",
                self.build_role.logical_id, self.build_project.logical_id
            )));
        }

        if self.distribution.origin.bucket != self.bucket.logical_id {
            return Err(Error::InvalidDefinition(format!(
                "distribution origin '{}' is not the stack bucket",
                self.distribution.origin.bucket
            )));
        }
        if self.origin_access_identity.stack != self.name {
            return Err(Error::InvalidDefinition(format!(
                "access identity '{}' belongs to stack '{}'",
                self.origin_access_identity.logical_id, self.origin_access_identity.stack
            )));
        }
        if self.distribution.origin.origin_access_identity != self.origin_access_identity.logical_id
        {
            return Err(Error::InvalidDefinition(format!(
                "distribution reads through unknown identity '{}'",
                self.distribution.origin.origin_access_identity
            )));
        }

        for stage in &self.pipeline.stages {
            for action in &stage.actions {
                match &action.kind {
                    ActionKind::Build(b) if b.project != self.build_project.logical_id => {
                        return Err(Error::InvalidDefinition(format!(
                            "action '{}' references unknown project '{}'",
                            action.name, b.project
                        )));
                    }
                    ActionKind::Deploy(d) if d.bucket != self.bucket.logical_id => {
                        return Err(Error::InvalidDefinition(format!(
                            "action '{}' references unknown bucket '{}'",
                            action.name, d.bucket
                        )));
                    }
                    _ => {}
                }
            }
        }

        for output in &self.outputs {
            let known = match &output.value {
                OutputValue::DistributionDomainName(id) => *id == self.distribution.logical_id,
                OutputValue::BucketName(id) => *id == self.bucket.logical_id,
            };
            if !known {
                return Err(Error::InvalidDefinition(format!(
                    "output '{}' references an unknown resource",
                    output.logical_id
                )));
            }
        }

        Ok(())
    }
}

fn fingerprint_of<T: Serialize + ?Sized>(value: &T) -> String {
    let encoded = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

/// A stack as it exists in a provisioning backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedStack {
    pub name: String,
    pub fingerprint: String,
    pub pipeline_fingerprint: String,
    /// Physical name of the hosting bucket.
    pub bucket_name: String,
    pub distribution_domain: String,
    /// Output logical id to resolved value.
    pub outputs: BTreeMap<String, String>,
    /// Export name to resolved value.
    pub exports: BTreeMap<String, String>,
    pub provisioned_at: DateTime<Utc>,
}

impl ProvisionedStack {
    pub fn output(&self, logical_id: &str) -> Option<&str> {
        self.outputs.get(logical_id).map(String::as_str)
    }
}

/// Result of applying a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionOutcome {
    pub stack: ProvisionedStack,
    /// True on first creation or when the pipeline wiring changed.
    pub pipeline_changed: bool,
    /// True when the stack did not exist before.
    pub created: bool,
}

/// Realizes stack definitions into live resources.
///
/// A failed `deploy` must leave no partially provisioned stack behind.
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create or update the stack.
    async fn deploy(&self, definition: &StackDefinition) -> Result<ProvisionOutcome>;

    /// Tear down the stack, honoring each resource's removal policy.
    async fn destroy(&self, stack_name: &str) -> Result<()>;

    async fn describe(&self, stack_name: &str) -> Result<Option<ProvisionedStack>>;
}
