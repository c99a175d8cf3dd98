//! Identifiers for runs, jobs and declared resources.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest logical id a stack template accepts.
pub const MAX_LOGICAL_ID_LEN: usize = 255;

/// Identity of a pipeline run or build job. Time-ordered (UUIDv7), so
/// sorting ids sorts by creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

/// The name a resource is declared under inside a stack (e.g. `bucketReactAoD`).
///
/// Logical ids are stable across redeploys; the provisioner derives
/// physical names from them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct LogicalId(String);

impl LogicalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty, ASCII alphanumeric, at most [`MAX_LOGICAL_ID_LEN`] chars.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_LOGICAL_ID_LEN
            && self.0.chars().all(|c| c.is_ascii_alphanumeric())
    }

    /// Lowercase form usable inside DNS-style physical names.
    pub fn slug(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl From<&str> for LogicalId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for LogicalId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_unique_v7() {
        let first = ResourceId::new();
        assert_ne!(first, ResourceId::new());
        assert_eq!(first.0.get_version_num(), 7);
    }

    #[test]
    fn test_logical_id_rules() {
        assert!(LogicalId::new("bucketReactAoD").is_valid());
        assert!(LogicalId::new("CodeBuild2").is_valid());
        assert!(!LogicalId::new("").is_valid());
        assert!(!LogicalId::new("code-build").is_valid());
        assert!(!LogicalId::new("a".repeat(MAX_LOGICAL_ID_LEN + 1)).is_valid());
        assert_eq!(LogicalId::new("bucketReactAoD").slug(), "bucketreactaod");
    }
}
