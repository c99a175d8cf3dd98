//! Deploy stage port.
//!
//! A site deployer writes a website bundle into the hosting bucket,
//! replacing whatever was there before.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactBundle;
use crate::{LogicalId, ResourceId, Result};

/// One invocation of a deploy action.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub run_id: ResourceId,
    pub action: String,
    /// Logical id of the target bucket in the stack.
    pub bucket: LogicalId,
    pub bundle: ArtifactBundle,
}

/// Record of a completed deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployReceipt {
    /// Physical bucket name the bundle landed in.
    pub bucket: String,
    pub objects_written: usize,
    pub checksum: String,
    pub deployed_at: DateTime<Utc>,
}

/// Writes bundles into a content store.
///
/// A failed deploy must leave the previous contents in place.
#[async_trait]
pub trait SiteDeployer: Send + Sync {
    async fn deploy(&self, request: DeployRequest) -> Result<DeployReceipt>;
}
