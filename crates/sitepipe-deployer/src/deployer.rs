//! The deploy stage: website bundle into bucket.

use async_trait::async_trait;
use chrono::Utc;
use sitepipe_core::deploy::{DeployReceipt, DeployRequest, SiteDeployer};
use sitepipe_core::stack::{ProvisionedStack, StackDefinition};
use sitepipe_core::store::ContentStore;
use sitepipe_core::{Error, LogicalId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Replaces a bucket's contents with the deployed bundle.
///
/// A deploy is all-or-nothing: either every object of the bundle is
/// visible afterwards or the previous contents are untouched.
pub struct StoreDeployer {
    store: Arc<dyn ContentStore>,
    /// Logical bucket id to physical bucket name.
    buckets: HashMap<LogicalId, String>,
}

impl StoreDeployer {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            buckets: HashMap::new(),
        }
    }

    pub fn with_bucket(
        mut self,
        logical_id: impl Into<LogicalId>,
        name: impl Into<String>,
    ) -> Self {
        self.buckets.insert(logical_id.into(), name.into());
        self
    }

    /// A deployer targeting the bucket of a provisioned stack.
    pub fn for_stack(
        store: Arc<dyn ContentStore>,
        definition: &StackDefinition,
        provisioned: &ProvisionedStack,
    ) -> Self {
        Self::new(store).with_bucket(
            definition.bucket.logical_id.clone(),
            provisioned.bucket_name.clone(),
        )
    }
}

#[async_trait]
impl SiteDeployer for StoreDeployer {
    async fn deploy(&self, request: DeployRequest) -> Result<DeployReceipt> {
        let bucket = self.buckets.get(&request.bucket).ok_or_else(|| {
            Error::DeploymentFailed(format!("bucket '{}' is not provisioned", request.bucket))
        })?;
        if request.bundle.is_empty() {
            return Err(Error::DeploymentFailed(format!(
                "action '{}' has nothing to deploy",
                request.action
            )));
        }

        let objects_written = request.bundle.len();
        let checksum = request.bundle.checksum();
        info!(
            run_id = %request.run_id,
            action = %request.action,
            bucket = %bucket,
            files = objects_written,
            "Deploying site"
        );

        if let Err(e) = self.store.replace_contents(bucket, request.bundle).await {
            error!(run_id = %request.run_id, bucket = %bucket, error = %e, "Deploy failed");
            return Err(match e {
                Error::DeploymentFailed(_) => e,
                other => Error::DeploymentFailed(other.to_string()),
            });
        }

        Ok(DeployReceipt {
            bucket: bucket.clone(),
            objects_written,
            checksum,
            deployed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Bucket, LocalCloud};
    use sitepipe_core::ResourceId;
    use sitepipe_core::artifact::ArtifactBundle;
    use sitepipe_core::store::BucketSpec;
    use std::collections::BTreeMap;

    async fn setup() -> (LocalCloud, StoreDeployer) {
        let cloud = LocalCloud::new();
        cloud.state().write().await.buckets.insert(
            "prod-site".to_string(),
            Bucket {
                spec: BucketSpec::new("bucketReactAoD"),
                owner: Some("Prod".to_string()),
                objects: BTreeMap::new(),
                accepts_writes: true,
            },
        );
        let deployer = StoreDeployer::new(Arc::new(cloud.content_store()))
            .with_bucket("bucketReactAoD", "prod-site");
        (cloud, deployer)
    }

    fn request(bucket: &str, bundle: ArtifactBundle) -> DeployRequest {
        DeployRequest {
            run_id: ResourceId::new(),
            action: "DeployMasterAod".to_string(),
            bucket: LogicalId::new(bucket),
            bundle,
        }
    }

    #[tokio::test]
    async fn test_deploy_resolves_physical_bucket() {
        let (cloud, deployer) = setup().await;
        let bundle = ArtifactBundle::new().with_file("index.html", "<h1>prod</h1>");
        let checksum = bundle.checksum();

        let receipt = deployer
            .deploy(request("bucketReactAoD", bundle))
            .await
            .unwrap();
        assert_eq!(receipt.bucket, "prod-site");
        assert_eq!(receipt.objects_written, 1);
        assert_eq!(receipt.checksum, checksum);

        let listed = cloud.content_store().list_objects("prod-site").await.unwrap();
        assert_eq!(listed, vec!["index.html"]);
    }

    #[tokio::test]
    async fn test_unknown_bucket_fails() {
        let (_cloud, deployer) = setup().await;
        let err = deployer
            .deploy(request("other", ArtifactBundle::new().with_file("a", "b")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeploymentFailed(_)));
    }

    #[tokio::test]
    async fn test_empty_bundle_is_refused() {
        let (_cloud, deployer) = setup().await;
        let err = deployer
            .deploy(request("bucketReactAoD", ArtifactBundle::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeploymentFailed(ref m) if m.contains("nothing to deploy")));
    }
}
