//! Secret lookup for upstream credentials.
//!
//! The gateway only ever knows a `key_id`; the secret itself is fetched on
//! every selection and is never cached or logged.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("no secret configured for key {0}")]
    Missing(String),
    #[error("secret backend error: {0}")]
    Backend(String),
}

/// Secret value with a redacted `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiSecret(String);

impl ApiSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiSecret(***)")
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch_api_secret(&self, key_id: &str) -> Result<ApiSecret, SecretError>;
}

/// Reads `KEYRELAY_SECRET_<KEY_ID>` where the key id is upper-cased and every
/// non-alphanumeric character becomes `_`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self {
            prefix: "KEYRELAY_SECRET_".to_string(),
        }
    }
}

impl EnvSecretStore {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn var_name(&self, key_id: &str) -> String {
        let suffix: String = key_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch_api_secret(&self, key_id: &str) -> Result<ApiSecret, SecretError> {
        match std::env::var(self.var_name(key_id)) {
            Ok(v) if !v.trim().is_empty() => Ok(ApiSecret::new(v.trim())),
            _ => Err(SecretError::Missing(key_id.to_string())),
        }
    }
}

/// Fixed secrets, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, ApiSecret>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key_id: &str, secret: &str) -> Self {
        self.secrets
            .insert(key_id.to_string(), ApiSecret::new(secret));
        self
    }

    /// Every key id maps to `sk-<key_id>`.
    pub fn for_keys<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        ids.into_iter()
            .fold(Self::new(), |s, id| s.with(id, &format!("sk-{}", id)))
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn fetch_api_secret(&self, key_id: &str) -> Result<ApiSecret, SecretError> {
        self.secrets
            .get(key_id)
            .cloned()
            .ok_or_else(|| SecretError::Missing(key_id.to_string()))
    }
}
