//! Secrets the stack refers to but never embeds.
//!
//! A stack definition only carries [`SecretRef`]s. The provisioner checks
//! they resolve and the source stage resolves them again to authenticate,
//! both through a [`SecretStore`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Stored form of a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    /// Opaque text. May itself hold a JSON object.
    Text(String),
    /// Structured key/value secret.
    Fields(BTreeMap<String, String>),
}

impl SecretValue {
    pub fn text(value: impl Into<String>) -> Self {
        SecretValue::Text(value.into())
    }

    pub fn field_pair(key: impl Into<String>, value: impl Into<String>) -> Self {
        SecretValue::Fields(BTreeMap::from([(key.into(), value.into())]))
    }

    /// Look up one field. Text secrets are read as a JSON object; non-string
    /// members come back in their JSON form.
    pub fn field(&self, key: &str) -> Option<String> {
        match self {
            SecretValue::Fields(fields) => fields.get(key).cloned(),
            SecretValue::Text(raw) => {
                let object: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(raw).ok()?;
                match object.get(key)? {
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                }
            }
        }
    }

    /// The whole secret as a string. Field secrets are rendered as JSON.
    pub fn to_secret_string(&self) -> String {
        match self {
            SecretValue::Text(raw) => raw.clone(),
            SecretValue::Fields(fields) => serde_json::to_string(fields).unwrap_or_default(),
        }
    }
}

/// A reference to a secret by name, optionally narrowed to one JSON field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub secret_id: String,
    pub json_field: Option<String>,
}

impl SecretRef {
    pub fn new(secret_id: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            json_field: None,
        }
    }

    pub fn with_json_field(mut self, field: impl Into<String>) -> Self {
        self.json_field = Some(field.into());
        self
    }

    /// Resolve to a non-empty string.
    pub async fn resolve(&self, store: &dyn SecretStore) -> Result<String> {
        let value = store.get(&self.secret_id).await?;
        let resolved = match &self.json_field {
            Some(field) => value
                .field(field)
                .ok_or_else(|| Error::NotFound(format!("secret '{}'", self)))?,
            None => value.to_secret_string(),
        };
        if resolved.is_empty() {
            return Err(Error::NotFound(format!("secret '{}' is empty", self)));
        }
        Ok(resolved)
    }
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.json_field {
            Some(field) => write!(f, "{}#{}", self.secret_id, field),
            None => write!(f, "{}", self.secret_id),
        }
    }
}

/// Named secret storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `NotFound` when no secret has this id.
    async fn get(&self, secret_id: &str) -> Result<SecretValue>;

    async fn put(&self, secret_id: &str, value: SecretValue) -> Result<()>;

    async fn delete(&self, secret_id: &str) -> Result<()>;

    /// Sorted ids starting with `prefix`.
    async fn ids(&self, prefix: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_lookup() {
        let fields = SecretValue::field_pair("GitHubToken", "ghp_123");
        assert_eq!(fields.field("GitHubToken").as_deref(), Some("ghp_123"));
        assert_eq!(fields.field("missing"), None);

        let text = SecretValue::text(r#"{"GitHubToken":"ghp_json","retries":3}"#);
        assert_eq!(text.field("GitHubToken").as_deref(), Some("ghp_json"));
        assert_eq!(text.field("retries").as_deref(), Some("3"));
        assert_eq!(SecretValue::text("ghp_plain").field("GitHubToken"), None);
    }

    #[test]
    fn test_secret_string() {
        assert_eq!(SecretValue::text("ghp_plain").to_secret_string(), "ghp_plain");
        assert_eq!(
            SecretValue::field_pair("GitHubToken", "t").to_secret_string(),
            r#"{"GitHubToken":"t"}"#
        );
    }

    #[test]
    fn test_secret_ref_display() {
        let r = SecretRef::new("GitHubToken").with_json_field("GitHubToken");
        assert_eq!(r.to_string(), "GitHubToken#GitHubToken");
        assert_eq!(SecretRef::new("plain").to_string(), "plain");
    }
}
