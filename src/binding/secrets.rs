use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Reference to a key inside a namespaced Secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    #[serde(default = "default_secret_key")]
    pub key: String,
}

fn default_secret_key() -> String {
    "provider.token".to_string()
}

/// Resolves secret references to their values. Backed by cluster Secrets in
/// production and by a static map in tests.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn token(&self, namespace: &str, secret: &SecretRef) -> anyhow::Result<SecretString>;
}

#[derive(Default)]
pub struct StaticSecretStore {
    entries: RwLock<HashMap<(String, String, String), String>>,
}

impl StaticSecretStore {
    pub fn insert(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.entries.write().insert(
            (namespace.to_string(), name.to_string(), key.to_string()),
            value.to_string(),
        );
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn token(&self, namespace: &str, secret: &SecretRef) -> anyhow::Result<SecretString> {
        let entries = self.entries.read();
        let value = entries
            .get(&(
                namespace.to_string(),
                secret.name.clone(),
                secret.key.clone(),
            ))
            .ok_or_else(|| {
                anyhow::anyhow!("Secret {}/{} has no key {}", namespace, secret.name, secret.key)
            })?;
        Ok(SecretString::new(value.clone()))
    }
}
