//! Key Registry Module
//!
//! Loads the upstream credential fleet from a JSON or YAML key file:
//! - `models`: catalog of known model names (order is the default preference order)
//! - `fallbacks`: model → ordered alternate models, resolved one hop at a time
//! - `keys`: one entry per credential, each bound to exactly one provider/model
//!
//! Secrets are never part of the key file; they are fetched by `key_id` from a
//! [`crate::secrets::SecretStore`].
//!
//! Reloads swap an immutable [`RegistrySnapshot`] behind an `Arc`, so requests
//! already holding a snapshot keep a consistent view.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON key file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid YAML key file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("duplicate key_id: {0}")]
    DuplicateKey(String),
    #[error("key {key_id} references unknown model '{model}'")]
    UnknownModel { key_id: String, model: String },
    #[error("unresolved placeholder model name '{model}' ({context})")]
    PlaceholderModel { model: String, context: String },
    #[error("key {key_id}: {field} must be greater than zero")]
    InvalidLimit { key_id: String, field: &'static str },
    #[error("fallback chain for '{model}' references unknown model '{target}'")]
    UnknownFallbackModel { model: String, target: String },
    #[error("key {0}: provider openai_compatible requires base_url")]
    MissingBaseUrl(String),
    #[error("registry lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Upstream provider dialect
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Openai,
    Anthropic,
    Google,
    Deepseek,
    Openrouter,
    OpenaiCompatible,
}

impl Provider {
    /// Base URL of the provider's OpenAI-compatible endpoint.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Provider::Openai => Some("https://api.openai.com/v1"),
            Provider::Anthropic => Some("https://api.anthropic.com/v1"),
            Provider::Google => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            Provider::Deepseek => Some("https://api.deepseek.com/v1"),
            Provider::Openrouter => Some("https://openrouter.ai/api/v1"),
            Provider::OpenaiCompatible => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::Deepseek => "deepseek",
            Provider::Openrouter => "openrouter",
            Provider::OpenaiCompatible => "openai_compatible",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workload class used to order candidate models when no model is requested
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    Light,
    Medium,
    Heavy,
}

impl FromStr for Workload {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Workload::Light),
            "medium" => Ok(Workload::Medium),
            "heavy" => Ok(Workload::Heavy),
            other => Err(format!("unknown workload class '{}'", other)),
        }
    }
}

/// One upstream credential
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyConfig {
    /// Unique identifier; also the lookup key for the secret
    pub key_id: String,

    pub provider: Provider,

    /// Model served by this key (must be in the catalog)
    pub model_name: String,

    /// Requests per minute
    pub rpm: u32,

    /// Tokens per minute
    pub tpm: u32,

    #[serde(default = "default_true")]
    pub active: bool,

    /// Free-form tags; `workload` and `priority` are interpreted
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: HashMap<String, String>,

    /// Override for the provider's default base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Accept scalar tag values of any type (`priority: 2` in YAML is an integer).
fn deserialize_tags<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}

impl ApiKeyConfig {
    pub fn workload(&self) -> Option<Workload> {
        self.tags.get("workload").and_then(|w| w.parse().ok())
    }

    /// Higher is preferred; missing or unparsable tags count as 0.
    pub fn priority(&self) -> i64 {
        self.tags
            .get("priority")
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Explicit override, else the provider default.
    pub fn effective_base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| self.provider.default_base_url().map(str::to_string))
    }
}

/// On-disk key file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyFile {
    #[serde(default)]
    pub models: Vec<String>,

    #[serde(default)]
    pub fallbacks: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub keys: Vec<ApiKeyConfig>,
}

impl KeyFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }
}

/// Where the registry reads its keys from
#[derive(Debug, Clone)]
pub enum KeySource {
    File(PathBuf),
    Inline(KeyFile),
}

impl KeySource {
    fn read(&self) -> Result<KeyFile> {
        match self {
            KeySource::File(path) => KeyFile::from_path(path),
            KeySource::Inline(file) => Ok(file.clone()),
        }
    }
}

fn is_placeholder(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    if matches!(lower.as_str(), "changeme" | "change_me" | "todo" | "tbd") {
        return true;
    }
    (trimmed.starts_with("${") && trimmed.ends_with('}'))
        || (trimmed.starts_with("{{") && trimmed.ends_with("}}"))
        || (trimmed.starts_with('<') && trimmed.ends_with('>'))
}

/// Immutable, validated view of the key file
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    keys: Vec<ApiKeyConfig>,
    by_id: HashMap<String, usize>,
    models: Vec<String>,
    fallbacks: HashMap<String, Vec<String>>,
}

impl RegistrySnapshot {
    pub fn build(file: KeyFile) -> Result<Self> {
        for model in &file.models {
            if is_placeholder(model) {
                return Err(RegistryError::PlaceholderModel {
                    model: model.clone(),
                    context: "model catalog".to_string(),
                });
            }
        }
        let catalog: HashSet<&str> = file.models.iter().map(String::as_str).collect();

        let mut by_id = HashMap::new();
        for (idx, key) in file.keys.iter().enumerate() {
            if is_placeholder(&key.model_name) {
                return Err(RegistryError::PlaceholderModel {
                    model: key.model_name.clone(),
                    context: format!("key {}", key.key_id),
                });
            }
            if !catalog.contains(key.model_name.as_str()) {
                return Err(RegistryError::UnknownModel {
                    key_id: key.key_id.clone(),
                    model: key.model_name.clone(),
                });
            }
            if key.rpm == 0 {
                return Err(RegistryError::InvalidLimit {
                    key_id: key.key_id.clone(),
                    field: "rpm",
                });
            }
            if key.tpm == 0 {
                return Err(RegistryError::InvalidLimit {
                    key_id: key.key_id.clone(),
                    field: "tpm",
                });
            }
            if key.provider == Provider::OpenaiCompatible && key.base_url.is_none() {
                return Err(RegistryError::MissingBaseUrl(key.key_id.clone()));
            }
            if by_id.insert(key.key_id.clone(), idx).is_some() {
                return Err(RegistryError::DuplicateKey(key.key_id.clone()));
            }
        }

        for (model, chain) in &file.fallbacks {
            for target in std::iter::once(model).chain(chain.iter()) {
                if !catalog.contains(target.as_str()) {
                    return Err(RegistryError::UnknownFallbackModel {
                        model: model.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        Ok(Self {
            keys: file.keys,
            by_id,
            models: file.models,
            fallbacks: file.fallbacks,
        })
    }

    pub fn keys(&self) -> &[ApiKeyConfig] {
        &self.keys
    }

    pub fn get(&self, key_id: &str) -> Option<&ApiKeyConfig> {
        self.by_id.get(key_id).map(|&i| &self.keys[i])
    }

    /// Model catalog in file order.
    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn fallbacks(&self, model: &str) -> &[String] {
        self.fallbacks.get(model).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_known_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model) || self.keys.iter().any(|k| k.model_name == model)
    }

    pub fn keys_for_model<'a>(&'a self, model: &'a str) -> impl Iterator<Item = &'a ApiKeyConfig> {
        self.keys.iter().filter(move |k| k.model_name == model)
    }

    /// Catalog models with at least one active key, in catalog order.
    pub fn active_models(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|m| self.keys.iter().any(|k| k.active && &k.model_name == *m))
            .cloned()
            .collect()
    }
}

/// Registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_keys: usize,
    pub active_keys: usize,
    pub models: usize,
    pub models_with_fallbacks: usize,
    pub keys_per_model: HashMap<String, usize>,
    pub generation: u64,
}

pub struct KeyRegistry {
    source: KeySource,
    current: RwLock<Arc<RegistrySnapshot>>,
    generation: AtomicU64,
}

impl KeyRegistry {
    /// Read and validate `source`.
    pub fn load(source: KeySource) -> Result<Self> {
        let snapshot = RegistrySnapshot::build(source.read()?)?;
        info!(
            keys = snapshot.keys.len(),
            models = snapshot.models.len(),
            "key registry loaded"
        );
        Ok(Self {
            source,
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
        })
    }

    pub fn from_key_file(file: KeyFile) -> Result<Self> {
        Self::load(KeySource::Inline(file))
    }

    /// Re-read the source and swap the snapshot. The previous snapshot stays
    /// in place when the new one fails validation.
    pub fn reload(&self) -> Result<usize> {
        let snapshot = match self.source.read().and_then(RegistrySnapshot::build) {
            Ok(s) => s,
            Err(e) => {
                warn!("key registry reload rejected: {}", e);
                return Err(e);
            }
        };
        let count = snapshot.keys.len();
        let mut guard = self.current.write().map_err(|_| RegistryError::Poisoned)?;
        *guard = Arc::new(snapshot);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(keys = count, generation, "key registry reloaded");
        Ok(count)
    }

    /// Current snapshot; cheap to clone and safe to hold across awaits.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Bumped on every successful reload.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get(&self, key_id: &str) -> Option<ApiKeyConfig> {
        self.snapshot().get(key_id).cloned()
    }

    pub fn all_keys(&self) -> Vec<ApiKeyConfig> {
        self.snapshot().keys().to_vec()
    }

    pub fn all_active(&self) -> Vec<ApiKeyConfig> {
        self.snapshot()
            .keys()
            .iter()
            .filter(|k| k.active)
            .cloned()
            .collect()
    }

    pub fn fallbacks(&self, model: &str) -> Vec<String> {
        self.snapshot().fallbacks(model).to_vec()
    }

    pub fn is_known_model(&self, model: &str) -> bool {
        self.snapshot().is_known_model(model)
    }

    pub fn keys_for_model(&self, model: &str) -> Vec<ApiKeyConfig> {
        self.snapshot().keys_for_model(model).cloned().collect()
    }

    pub fn active_models(&self) -> Vec<String> {
        self.snapshot().active_models()
    }

    pub fn stats(&self) -> RegistryStats {
        let snap = self.snapshot();
        let mut keys_per_model = HashMap::new();
        for key in snap.keys() {
            *keys_per_model.entry(key.model_name.clone()).or_insert(0) += 1;
        }
        RegistryStats {
            total_keys: snap.keys().len(),
            active_keys: snap.keys().iter().filter(|k| k.active).count(),
            models: snap.models().len(),
            models_with_fallbacks: snap.fallbacks.values().filter(|c| !c.is_empty()).count(),
            keys_per_model,
            generation: self.generation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn key(id: &str, model: &str) -> ApiKeyConfig {
        ApiKeyConfig {
            key_id: id.to_string(),
            provider: Provider::Openai,
            model_name: model.to_string(),
            rpm: 10,
            tpm: 10_000,
            active: true,
            tags: HashMap::new(),
            base_url: None,
        }
    }

    fn file(keys: Vec<ApiKeyConfig>) -> KeyFile {
        KeyFile {
            models: vec!["flash".to_string(), "pro".to_string()],
            fallbacks: HashMap::from([("flash".to_string(), vec!["pro".to_string()])]),
            keys,
        }
    }

    #[test]
    fn test_load_inline() {
        let registry =
            KeyRegistry::from_key_file(file(vec![key("k1", "flash"), key("k2", "pro")])).unwrap();
        assert_eq!(registry.all_active().len(), 2);
        assert_eq!(registry.get("k2").unwrap().model_name, "pro");
        assert_eq!(registry.fallbacks("flash"), vec!["pro".to_string()]);
        assert!(registry.fallbacks("pro").is_empty());
        assert!(registry.is_known_model("pro"));
        assert!(!registry.is_known_model("ultra"));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let err =
            KeyRegistry::from_key_file(file(vec![key("k1", "flash"), key("k1", "pro")])).err();
        assert!(matches!(err, Some(RegistryError::DuplicateKey(id)) if id == "k1"));
    }

    #[test]
    fn test_unknown_and_placeholder_models_rejected() {
        let err = KeyRegistry::from_key_file(file(vec![key("k1", "ultra")])).err();
        assert!(matches!(err, Some(RegistryError::UnknownModel { .. })));

        for placeholder in ["${MODEL}", "{{model}}", "<model>", "", "changeme"] {
            let err = KeyRegistry::from_key_file(file(vec![key("k1", placeholder)])).err();
            assert!(
                matches!(err, Some(RegistryError::PlaceholderModel { .. })),
                "{placeholder:?} accepted"
            );
        }
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut k = key("k1", "flash");
        k.rpm = 0;
        let err = KeyRegistry::from_key_file(file(vec![k])).err();
        assert!(matches!(err, Some(RegistryError::InvalidLimit { field: "rpm", .. })));

        let mut k = key("k1", "flash");
        k.tpm = 0;
        let err = KeyRegistry::from_key_file(file(vec![k])).err();
        assert!(matches!(err, Some(RegistryError::InvalidLimit { field: "tpm", .. })));
    }

    #[test]
    fn test_fallback_to_unknown_model_rejected() {
        let mut f = file(vec![key("k1", "flash")]);
        f.fallbacks
            .insert("pro".to_string(), vec!["ultra".to_string()]);
        let err = KeyRegistry::from_key_file(f).err();
        assert!(matches!(err, Some(RegistryError::UnknownFallbackModel { .. })));
    }

    #[test]
    fn test_openai_compatible_requires_base_url() {
        let mut k = key("k1", "flash");
        k.provider = Provider::OpenaiCompatible;
        assert!(matches!(
            KeyRegistry::from_key_file(file(vec![k.clone()])).err(),
            Some(RegistryError::MissingBaseUrl(_))
        ));
        k.base_url = Some("http://localhost:8000/v1".to_string());
        let registry = KeyRegistry::from_key_file(file(vec![k])).unwrap();
        assert_eq!(
            registry.get("k1").unwrap().effective_base_url().as_deref(),
            Some("http://localhost:8000/v1")
        );
    }

    #[test]
    fn test_yaml_file_with_tags_and_reload() {
        let mut tmp = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            tmp,
            r#"
models: [flash, pro]
fallbacks:
  flash: [pro]
keys:
  - key_id: k1
    provider: google
    model_name: flash
    rpm: 10
    tpm: 100000
    tags:
      workload: light
      priority: 2
  - key_id: k2
    provider: openai
    model_name: pro
    rpm: 5
    tpm: 100000
    active: false
"#
        )
        .unwrap();
        tmp.flush().unwrap();

        let registry = KeyRegistry::load(KeySource::File(tmp.path().to_path_buf())).unwrap();
        let k1 = registry.get("k1").unwrap();
        assert_eq!(k1.workload(), Some(Workload::Light));
        assert_eq!(k1.priority(), 2);
        assert_eq!(registry.all_active().len(), 1);
        assert_eq!(registry.active_models(), vec!["flash".to_string()]);
        assert_eq!(registry.generation(), 1);

        let held = registry.snapshot();

        std::fs::write(
            tmp.path(),
            r#"
models: [flash]
keys:
  - key_id: k3
    provider: deepseek
    model_name: flash
    rpm: 1
    tpm: 1000
"#,
        )
        .unwrap();
        assert_eq!(registry.reload().unwrap(), 1);
        assert_eq!(registry.generation(), 2);
        assert!(registry.get("k1").is_none());
        assert!(held.get("k1").is_some());

        std::fs::write(tmp.path(), "models: [flash]\nkeys:\n  - key_id: bad\n").unwrap();
        assert!(registry.reload().is_err());
        assert!(registry.get("k3").is_some());
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn test_stats() {
        let mut inactive = key("k3", "pro");
        inactive.active = false;
        let registry =
            KeyRegistry::from_key_file(file(vec![key("k1", "flash"), key("k2", "flash"), inactive]))
                .unwrap();
        let stats = registry.stats();
        assert_eq!(stats.total_keys, 3);
        assert_eq!(stats.active_keys, 2);
        assert_eq!(stats.keys_per_model.get("flash"), Some(&2));
        assert_eq!(stats.models_with_fallbacks, 1);
    }
}
