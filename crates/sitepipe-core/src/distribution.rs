//! Distribution front declarations.
//!
//! A distribution serves a private bucket through an access identity and
//! rewrites upstream errors according to its error-response table.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::policy::Principal;
use crate::{Error, LogicalId, Result};

/// A principal scoped to a single distribution for reading its origin.
///
/// Two stacks declaring the same logical id still get distinct principals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginAccessIdentity {
    pub stack: String,
    pub logical_id: LogicalId,
    pub comment: String,
}

impl OriginAccessIdentity {
    pub fn new(
        stack: impl Into<String>,
        logical_id: impl Into<LogicalId>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            stack: stack.into(),
            logical_id: logical_id.into(),
            comment: comment.into(),
        }
    }

    pub fn principal(&self) -> Principal {
        Principal::AccessIdentity {
            stack: self.stack.clone(),
            logical_id: self.logical_id.clone(),
        }
    }
}

/// A bucket origin read through an access identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOrigin {
    pub bucket: LogicalId,
    pub origin_access_identity: LogicalId,
}

/// A cache behavior routing a path pattern to the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Behavior {
    pub is_default: bool,
    pub path_pattern: String,
    pub allowed_methods: Vec<String>,
    pub compress: bool,
}

impl Behavior {
    /// The catch-all behavior.
    pub fn default_behavior() -> Self {
        Self {
            is_default: true,
            path_pattern: "*".to_string(),
            allowed_methods: vec!["GET".to_string(), "HEAD".to_string()],
            compress: true,
        }
    }
}

/// Rewrites an upstream error status into a different response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: u16,
    pub response_code: u16,
    pub response_page_path: String,
}

impl ErrorResponse {
    /// Serve `index_document` with 200 for any upstream 404.
    pub fn spa_fallback(index_document: &str) -> Self {
        Self {
            error_code: 404,
            response_code: 200,
            response_page_path: format!("/{}", index_document.trim_start_matches('/')),
        }
    }
}

/// Declaration of a distribution front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionSpec {
    pub logical_id: LogicalId,
    pub origin: BucketOrigin,
    pub behaviors: Vec<Behavior>,
    pub error_responses: Vec<ErrorResponse>,
    pub default_root_object: Option<String>,
}

impl DistributionSpec {
    pub fn default_behavior(&self) -> Option<&Behavior> {
        self.behaviors.iter().find(|b| b.is_default)
    }

    pub fn error_response_for(&self, status: u16) -> Option<&ErrorResponse> {
        self.error_responses.iter().find(|r| r.error_code == status)
    }

    /// Map a request path to an origin object key.
    pub fn object_key(&self, path: &str) -> String {
        let key = path
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_start_matches('/');
        if key.is_empty() {
            self.default_root_object.clone().unwrap_or_default()
        } else {
            key.to_string()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let defaults = self.behaviors.iter().filter(|b| b.is_default).count();
        if defaults != 1 {
            return Err(Error::InvalidDefinition(format!(
                "distribution '{}' must have exactly one default behavior, found {}",
                self.logical_id, defaults
            )));
        }

        let mut codes: Vec<u16> = self.error_responses.iter().map(|r| r.error_code).collect();
        codes.sort_unstable();
        codes.dedup();
        if codes.len() != self.error_responses.len() {
            return Err(Error::InvalidDefinition(format!(
                "distribution '{}' rewrites the same error code twice",
                self.logical_id
            )));
        }
        Ok(())
    }
}

/// A response served by a distribution edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeResponse {
    pub status: u16,
    /// Origin key the body was read from.
    pub key: String,
    pub body: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DistributionSpec {
        DistributionSpec {
            logical_id: LogicalId::new("CloudFront"),
            origin: BucketOrigin {
                bucket: LogicalId::new("bucket"),
                origin_access_identity: LogicalId::new("OAI"),
            },
            behaviors: vec![Behavior::default_behavior()],
            error_responses: vec![ErrorResponse::spa_fallback("index.html")],
            default_root_object: Some("index.html".to_string()),
        }
    }

    #[test]
    fn test_object_key_mapping() {
        let spec = spec();
        assert_eq!(spec.object_key("/"), "index.html");
        assert_eq!(spec.object_key(""), "index.html");
        assert_eq!(spec.object_key("/static/app.js"), "static/app.js");
        assert_eq!(spec.object_key("/about?ref=nav"), "about");
    }

    #[test]
    fn test_error_response_lookup() {
        let spec = spec();
        let rule = spec.error_response_for(404).unwrap();
        assert_eq!(rule.response_code, 200);
        assert_eq!(rule.response_page_path, "/index.html");
        assert!(spec.error_response_for(403).is_none());
    }

    #[test]
    fn test_validate_requires_single_default_behavior() {
        let mut spec = spec();
        assert!(spec.validate().is_ok());

        spec.behaviors.push(Behavior::default_behavior());
        assert!(spec.validate().is_err());

        spec.behaviors.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_rewrites() {
        let mut spec = spec();
        spec.error_responses
            .push(ErrorResponse::spa_fallback("other.html"));
        assert!(spec.validate().is_err());
    }
}
