//! Static-site content store declarations and the storage abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactBundle;
use crate::policy::{PolicyStatement, Principal};
use crate::{Error, LogicalId, Result};

/// Actions covered by a read grant on a bucket.
pub const READ_ACTIONS: &[&str] = &["store:GetObject*", "store:List*"];

pub const GET_OBJECT: &str = "store:GetObject";

/// Website-style serving documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteConfiguration {
    pub index_document: String,
    pub error_document: String,
}

impl Default for WebsiteConfiguration {
    /// Both documents point at the application entry point so unknown
    /// paths still load the client-side router.
    fn default() -> Self {
        Self {
            index_document: "index.html".to_string(),
            error_document: "index.html".to_string(),
        }
    }
}

/// What happens to a resource when its stack is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    /// Delete the resource and everything in it.
    #[default]
    Destroy,
    /// Orphan the resource.
    Retain,
}

impl std::str::FromStr for RemovalPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "destroy" => Ok(RemovalPolicy::Destroy),
            "retain" => Ok(RemovalPolicy::Retain),
            _ => Err(format!("unknown removal policy: {}", s)),
        }
    }
}

/// Declaration of the bucket that hosts the built site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub logical_id: LogicalId,
    pub website: WebsiteConfiguration,
    pub removal_policy: RemovalPolicy,
    /// When set, no anonymous read path may be granted.
    pub block_public_access: bool,
    read_grants: Vec<Principal>,
}

impl BucketSpec {
    pub fn new(logical_id: impl Into<LogicalId>) -> Self {
        Self {
            logical_id: logical_id.into(),
            website: WebsiteConfiguration::default(),
            removal_policy: RemovalPolicy::default(),
            block_public_access: true,
            read_grants: Vec::new(),
        }
    }

    pub fn with_website(mut self, website: WebsiteConfiguration) -> Self {
        self.website = website;
        self
    }

    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }

    /// Grant read-only capability on the bucket contents to `principal`.
    pub fn grant_read(&mut self, principal: Principal) -> Result<()> {
        if principal == Principal::Anonymous && self.block_public_access {
            return Err(Error::Conflict(format!(
                "bucket '{}' blocks public access",
                self.logical_id
            )));
        }
        if !self.read_grants.contains(&principal) {
            self.read_grants.push(principal);
        }
        Ok(())
    }

    pub fn read_grants(&self) -> &[Principal] {
        &self.read_grants
    }

    pub fn allows_read(&self, principal: &Principal) -> bool {
        self.read_grants.contains(principal)
    }

    /// Resource pattern covering every object in the bucket.
    pub fn objects_resource(&self) -> String {
        format!("bucket:{}/*", self.logical_id)
    }

    pub fn object_resource(&self, key: &str) -> String {
        format!("bucket:{}/{}", self.logical_id, key)
    }

    /// The statement every read grant carries.
    pub fn read_statement(&self) -> PolicyStatement {
        PolicyStatement::allow(READ_ACTIONS.iter().copied(), [self.objects_resource()])
    }

    /// Whether `principal` may perform `action` on the object at `key`.
    pub fn permits(&self, principal: &Principal, action: &str, key: &str) -> bool {
        self.allows_read(principal)
            && self
                .read_statement()
                .matches(action, &self.object_resource(key))
    }
}

/// Trait for content store backends.
///
/// `bucket` is the physical bucket name assigned at provisioning time.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Read an object on behalf of `principal`.
    ///
    /// Returns `Forbidden` when the principal holds no read grant and
    /// `NotFound` when the key does not exist.
    async fn get_object(&self, bucket: &str, key: &str, principal: &Principal) -> Result<Bytes>;

    /// Write a single object.
    async fn put_object(&self, bucket: &str, key: &str, content: Bytes) -> Result<()>;

    /// Atomically replace every object in the bucket with the bundle.
    async fn replace_contents(&self, bucket: &str, bundle: ArtifactBundle) -> Result<()>;

    /// List object keys.
    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_website_defaults_share_entry_point() {
        let bucket = BucketSpec::new("bucketReactAoD");
        assert_eq!(bucket.website.index_document, "index.html");
        assert_eq!(
            bucket.website.index_document,
            bucket.website.error_document
        );
        assert_eq!(bucket.removal_policy, RemovalPolicy::Destroy);
        assert!(bucket.block_public_access);
    }

    #[test]
    fn test_public_grant_conflicts() {
        let mut bucket = BucketSpec::new("site");
        let err = bucket.grant_read(Principal::Anonymous).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(bucket.read_grants().is_empty());
    }

    #[test]
    fn test_grant_read_is_idempotent() {
        let mut bucket = BucketSpec::new("site");
        let oai = Principal::AccessIdentity {
            stack: "Stack".to_string(),
            logical_id: LogicalId::new("OAI"),
        };
        bucket.grant_read(oai.clone()).unwrap();
        bucket.grant_read(oai.clone()).unwrap();

        assert_eq!(bucket.read_grants().len(), 1);
        assert!(bucket.allows_read(&oai));
        assert!(!bucket.allows_read(&Principal::Anonymous));
    }

    #[test]
    fn test_read_grant_covers_only_reads() {
        let mut bucket = BucketSpec::new("site");
        let oai = Principal::AccessIdentity {
            stack: "Stack".to_string(),
            logical_id: LogicalId::new("OAI"),
        };
        bucket.grant_read(oai.clone()).unwrap();

        let statement = bucket.read_statement();
        assert_eq!(statement.resources, vec!["bucket:site/*".to_string()]);
        assert!(bucket.permits(&oai, GET_OBJECT, "static/js/main.js"));
        assert!(bucket.permits(&oai, "store:ListObjects", "index.html"));
        assert!(!bucket.permits(&oai, "store:PutObject", "index.html"));
        assert!(!bucket.permits(&Principal::Anonymous, GET_OBJECT, "index.html"));
    }

    #[test]
    fn test_removal_policy_from_str() {
        assert_eq!(
            "DESTROY".parse::<RemovalPolicy>().unwrap(),
            RemovalPolicy::Destroy
        );
        assert_eq!(
            "retain".parse::<RemovalPolicy>().unwrap(),
            RemovalPolicy::Retain
        );
        assert!("keep".parse::<RemovalPolicy>().is_err());
    }
}
