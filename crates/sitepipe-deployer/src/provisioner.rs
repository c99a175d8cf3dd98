//! Applying stack definitions to a [`LocalCloud`].

use async_trait::async_trait;
use chrono::Utc;
use sitepipe_core::secret::SecretStore;
use sitepipe_core::stack::{
    OutputValue, ProvisionOutcome, ProvisionedStack, Provisioner, StackDefinition,
};
use sitepipe_core::store::RemovalPolicy;
use sitepipe_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cloud::{
    Bucket, CloudState, Distribution, LocalCloud, StackRecord, bucket_name, distribution_domain,
};

/// In-process [`Provisioner`].
///
/// Every check runs before the shared state is touched, and the new
/// resources are committed under a single write lock, so a failed deploy
/// leaves the previous state of the stack (or nothing) behind.
pub struct LocalProvisioner {
    cloud: LocalCloud,
    secrets: Arc<dyn SecretStore>,
}

impl LocalProvisioner {
    pub fn new(cloud: LocalCloud, secrets: Arc<dyn SecretStore>) -> Self {
        Self { cloud, secrets }
    }

    async fn resolve_secrets(&self, definition: &StackDefinition) -> Result<()> {
        for secret in definition.secret_refs() {
            if let Err(e) = secret.resolve(self.secrets.as_ref()).await {
                return Err(Error::Provisioning(format!(
                    "secret '{}' could not be resolved: {}",
                    secret, e
                )));
            }
        }
        Ok(())
    }

    fn check_grants(definition: &StackDefinition) -> Result<()> {
        let identity = definition.origin_access_identity.principal();
        let bucket = &definition.bucket;

        if let Some(stranger) = bucket.read_grants().iter().find(|p| **p != identity) {
            return Err(Error::Conflict(format!(
                "bucket '{}' grants read to {}, which the stack does not declare",
                bucket.logical_id, stranger
            )));
        }
        if !bucket.allows_read(&identity) {
            return Err(Error::Conflict(format!(
                "access identity '{}' cannot read bucket '{}'",
                definition.origin_access_identity.logical_id, bucket.logical_id
            )));
        }
        Ok(())
    }

    /// Reject names already held by another stack.
    fn check_ownership(
        state: &CloudState,
        definition: &StackDefinition,
        bucket: &str,
        exports: &BTreeMap<String, String>,
    ) -> Result<()> {
        if let Some(existing) = state.buckets.get(bucket) {
            if existing.owner.as_deref() != Some(definition.name.as_str()) {
                return Err(Error::Conflict(format!("bucket '{}' already exists", bucket)));
            }
        }

        for (name, record) in &state.stacks {
            if *name == definition.name {
                continue;
            }
            if let Some(export) = exports
                .keys()
                .find(|e| record.provisioned.exports.contains_key(*e))
            {
                return Err(Error::Conflict(format!(
                    "export '{}' is already defined by stack '{}'",
                    export, name
                )));
            }
        }
        Ok(())
    }
}

fn resolve_outputs(
    definition: &StackDefinition,
    bucket: &str,
    domain: &str,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut outputs = BTreeMap::new();
    let mut exports = BTreeMap::new();
    for output in &definition.outputs {
        let value = match &output.value {
            OutputValue::DistributionDomainName(_) => domain.to_string(),
            OutputValue::BucketName(_) => bucket.to_string(),
        };
        if let Some(export) = &output.export_name {
            exports.insert(export.clone(), value.clone());
        }
        outputs.insert(output.logical_id.clone(), value);
    }
    (outputs, exports)
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn deploy(&self, definition: &StackDefinition) -> Result<ProvisionOutcome> {
        info!(stack = %definition.name, provisioner = self.name(), "Provisioning stack");

        let checks = async {
            definition.validate()?;
            self.resolve_secrets(definition).await?;
            definition
                .build_project
                .build_spec
                .validate()
                .map_err(|e| Error::Provisioning(e.to_string()))?;
            Self::check_grants(definition)
        };
        if let Err(e) = checks.await {
            error!(stack = %definition.name, error = %e, "Stack provisioning failed");
            return Err(e);
        }

        let fingerprint = definition.fingerprint();
        let pipeline_fingerprint = definition.pipeline_fingerprint();
        let bucket = bucket_name(&definition.name, &definition.bucket.logical_id);
        let domain = distribution_domain(&definition.name, &definition.distribution.logical_id);
        let (outputs, exports) = resolve_outputs(definition, &bucket, &domain);

        let mut state = self.cloud.state().write().await;
        if let Err(e) = Self::check_ownership(&state, definition, &bucket, &exports) {
            error!(stack = %definition.name, error = %e, "Stack provisioning failed");
            return Err(e);
        }

        let previous = state.stacks.get(&definition.name).map(|r| r.provisioned.clone());
        let created = previous.is_none();
        let pipeline_changed = previous
            .as_ref()
            .is_none_or(|p| p.pipeline_fingerprint != pipeline_fingerprint);

        let objects = state
            .buckets
            .remove(&bucket)
            .map(|b| b.objects)
            .unwrap_or_default();
        state.buckets.insert(
            bucket.clone(),
            Bucket {
                spec: definition.bucket.clone(),
                owner: Some(definition.name.clone()),
                objects,
                accepts_writes: true,
            },
        );
        state.distributions.insert(
            domain.clone(),
            Distribution {
                spec: definition.distribution.clone(),
                bucket_name: bucket.clone(),
                reader: definition.origin_access_identity.principal(),
            },
        );

        let provisioned = ProvisionedStack {
            name: definition.name.clone(),
            fingerprint,
            pipeline_fingerprint,
            bucket_name: bucket,
            distribution_domain: domain,
            outputs,
            exports,
            provisioned_at: Utc::now(),
        };
        state.stacks.insert(
            definition.name.clone(),
            StackRecord {
                definition: definition.clone(),
                provisioned: provisioned.clone(),
            },
        );

        let unchanged = previous
            .as_ref()
            .is_some_and(|p| p.fingerprint == provisioned.fingerprint);
        info!(
            stack = %provisioned.name,
            bucket = %provisioned.bucket_name,
            domain = %provisioned.distribution_domain,
            created,
            pipeline_changed,
            unchanged,
            "Stack provisioned"
        );

        Ok(ProvisionOutcome {
            stack: provisioned,
            pipeline_changed,
            created,
        })
    }

    async fn destroy(&self, stack_name: &str) -> Result<()> {
        let mut state = self.cloud.state().write().await;
        let record = state
            .stacks
            .remove(stack_name)
            .ok_or_else(|| Error::NotFound(format!("stack '{}'", stack_name)))?;
        let provisioned = &record.provisioned;

        state.distributions.remove(&provisioned.distribution_domain);

        match record.definition.bucket.removal_policy {
            RemovalPolicy::Destroy => {
                let objects = state
                    .buckets
                    .remove(&provisioned.bucket_name)
                    .map(|b| b.objects.len())
                    .unwrap_or_default();
                info!(
                    stack = %stack_name,
                    bucket = %provisioned.bucket_name,
                    objects,
                    "Deleted bucket"
                );
            }
            RemovalPolicy::Retain => {
                if let Some(bucket) = state.buckets.get_mut(&provisioned.bucket_name) {
                    bucket.owner = None;
                }
                warn!(
                    stack = %stack_name,
                    bucket = %provisioned.bucket_name,
                    "Retaining bucket after stack removal"
                );
            }
        }

        info!(stack = %stack_name, "Stack destroyed");
        Ok(())
    }

    async fn describe(&self, stack_name: &str) -> Result<Option<ProvisionedStack>> {
        Ok(self
            .cloud
            .state()
            .read()
            .await
            .stacks
            .get(stack_name)
            .map(|r| r.provisioned.clone()))
    }
}
