use async_trait::async_trait;
use sitepipe_core::secret::{SecretStore, SecretValue};
use sitepipe_core::{Error, Result};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Secrets held in process memory, keyed by secret id.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<BTreeMap<String, SecretValue>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, secret_id: impl Into<String>, value: SecretValue) -> Self {
        self.secrets.get_mut().insert(secret_id.into(), value);
        self
    }

    /// A structured secret holding a single field.
    pub fn with_field(
        self,
        secret_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.with_secret(secret_id, SecretValue::field_pair(key, value))
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, secret_id: &str) -> Result<SecretValue> {
        self.secrets
            .read()
            .await
            .get(secret_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret '{}'", secret_id)))
    }

    async fn put(&self, secret_id: &str, value: SecretValue) -> Result<()> {
        debug!(secret_id = %secret_id, "Storing secret");
        self.secrets.write().await.insert(secret_id.to_string(), value);
        Ok(())
    }

    async fn delete(&self, secret_id: &str) -> Result<()> {
        self.secrets.write().await.remove(secret_id);
        Ok(())
    }

    async fn ids(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .secrets
            .read()
            .await
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }
}
