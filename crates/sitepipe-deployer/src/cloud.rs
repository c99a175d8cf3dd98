//! Shared in-memory state of the local backend.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use sitepipe_core::distribution::DistributionSpec;
use sitepipe_core::policy::Principal;
use sitepipe_core::secret::SecretStore;
use sitepipe_core::stack::{ProvisionedStack, StackDefinition};
use sitepipe_core::store::BucketSpec;
use sitepipe_core::{Error, LogicalId, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::edge::LocalEdge;
use crate::provisioner::LocalProvisioner;
use crate::store::LocalContentStore;

/// Suffix of every distribution domain handed out by the local backend.
pub const EDGE_DOMAIN_SUFFIX: &str = "edge.sitepipe.local";

#[derive(Debug, Clone)]
pub(crate) struct Bucket {
    pub spec: BucketSpec,
    /// `None` once the owning stack was destroyed with a retain policy.
    pub owner: Option<String>,
    pub objects: BTreeMap<String, Bytes>,
    pub accepts_writes: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Distribution {
    pub spec: DistributionSpec,
    pub bucket_name: String,
    /// Principal the distribution reads its origin as.
    pub reader: Principal,
}

#[derive(Debug, Clone)]
pub(crate) struct StackRecord {
    pub definition: StackDefinition,
    pub provisioned: ProvisionedStack,
}

#[derive(Debug, Default)]
pub(crate) struct CloudState {
    /// Keyed by physical bucket name.
    pub buckets: HashMap<String, Bucket>,
    /// Keyed by domain name.
    pub distributions: HashMap<String, Distribution>,
    pub stacks: HashMap<String, StackRecord>,
}

/// An in-process stand-in for the hosting cloud.
///
/// Cloning is cheap and every clone sees the same state.
#[derive(Clone, Default)]
pub struct LocalCloud {
    state: Arc<RwLock<CloudState>>,
}

impl LocalCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> &RwLock<CloudState> {
        &self.state
    }

    pub fn content_store(&self) -> LocalContentStore {
        LocalContentStore::new(self.clone())
    }

    pub fn edge(&self) -> LocalEdge {
        LocalEdge::new(self.clone())
    }

    pub fn provisioner(&self, secrets: Arc<dyn SecretStore>) -> LocalProvisioner {
        LocalProvisioner::new(self.clone(), secrets)
    }

    /// Physical names of all buckets, including orphaned ones.
    pub async fn buckets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.buckets.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn bucket_exists(&self, name: &str) -> bool {
        self.state.read().await.buckets.contains_key(name)
    }

    /// Make writes to `bucket` fail, as if the store were unreachable.
    pub async fn set_accepts_writes(&self, bucket: &str, accepts: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let bucket = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::NotFound(format!("bucket '{}'", bucket)))?;
        bucket.accepts_writes = accepts;
        Ok(())
    }
}

fn slug(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn digest(stack: &str, logical_id: &LogicalId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stack.as_bytes());
    hasher.update(b"/");
    hasher.update(logical_id.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Physical bucket name: `<stack>-<logical id>-<8 hex>`, lowercased.
pub fn bucket_name(stack: &str, logical_id: &LogicalId) -> String {
    format!(
        "{}-{}-{}",
        slug(stack),
        logical_id.slug(),
        &digest(stack, logical_id)[..8]
    )
}

/// Distribution domain: `d<13 hex>.edge.sitepipe.local`.
pub fn distribution_domain(stack: &str, logical_id: &LogicalId) -> String {
    format!(
        "d{}.{}",
        &digest(stack, logical_id)[..13],
        EDGE_DOMAIN_SUFFIX
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_is_stable_and_lowercase() {
        let a = bucket_name("CICDProdStack", &"bucketReactAoD".into());
        assert_eq!(a, bucket_name("CICDProdStack", &"bucketReactAoD".into()));
        assert!(a.starts_with("cicdprodstack-bucketreactaod-"));
        assert_eq!(a, a.to_ascii_lowercase());
        assert_ne!(a, bucket_name("CICDDevStack", &"bucketReactAoD".into()));
    }

    #[test]
    fn test_distribution_domain() {
        let domain = distribution_domain("CICDProdStack", &"CloudFront".into());
        assert!(domain.starts_with('d'));
        assert!(domain.ends_with(".edge.sitepipe.local"));
        assert_eq!(domain.len(), 1 + 13 + 1 + EDGE_DOMAIN_SUFFIX.len());
    }

    #[tokio::test]
    async fn test_toggle_writes_on_unknown_bucket() {
        let cloud = LocalCloud::new();
        assert!(matches!(
            cloud.set_accepts_writes("nope", false).await,
            Err(Error::NotFound(_))
        ));
        assert!(cloud.buckets().await.is_empty());
    }
}
