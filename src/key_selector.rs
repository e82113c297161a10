//! Key selection with per-model rotation queues.
//!
//! Each model has a FIFO of its key ids. Selection walks the queue from the
//! head, skipping inactive, excluded and cooling-down keys, and reserves RPM and
//! TPM capacity atomically through the [`QuotaManager`]. The winning key moves
//! to the tail. Queues are per-instance and only give best-effort fairness;
//! quota correctness comes from the store alone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::key_registry::{KeyRegistry, Provider, RegistrySnapshot, Workload};
use crate::quota::QuotaManager;
use crate::secrets::{ApiSecret, SecretError, SecretStore};

#[derive(Error, Debug)]
pub enum SelectError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("secret lookup failed: {0}")]
    Secret(#[from] SecretError),
}

/// A reserved key, ready to dispatch.
#[derive(Debug, Clone)]
pub struct KeySelection {
    pub key_id: String,
    pub model: String,
    pub provider: Provider,
    pub base_url: Option<String>,
    pub secret: ApiSecret,
}

/// Queue contents for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub model: String,
    pub order: Vec<String>,
}

#[derive(Default)]
struct RotationQueues {
    generation: u64,
    queues: HashMap<String, VecDeque<String>>,
}

impl RotationQueues {
    /// Rebuild for a new registry snapshot, keeping the relative order of
    /// surviving keys and appending new ones in file order.
    fn rebuild(&mut self, snapshot: &RegistrySnapshot, generation: u64) {
        let mut rebuilt: HashMap<String, VecDeque<String>> = HashMap::new();
        for model in snapshot.models() {
            let ids: Vec<&str> = snapshot
                .keys_for_model(model)
                .map(|k| k.key_id.as_str())
                .collect();
            let mut queue: VecDeque<String> = self
                .queues
                .get(model)
                .map(|old| {
                    old.iter()
                        .filter(|id| ids.contains(&id.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for id in ids {
                if !queue.iter().any(|q| q == id) {
                    queue.push_back(id.to_string());
                }
            }
            rebuilt.insert(model.clone(), queue);
        }
        self.queues = rebuilt;
        self.generation = generation;
    }
}

pub struct KeySelector {
    registry: Arc<KeyRegistry>,
    quota: Arc<QuotaManager>,
    secrets: Arc<dyn SecretStore>,
    rotation: Mutex<RotationQueues>,
}

impl KeySelector {
    pub fn new(
        registry: Arc<KeyRegistry>,
        quota: Arc<QuotaManager>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            registry,
            quota,
            secrets,
            rotation: Mutex::new(RotationQueues::default()),
        }
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    fn rotation(&self) -> std::sync::MutexGuard<'_, RotationQueues> {
        // A poisoned queue only affects fairness.
        self.rotation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of one model's queue. The lock is released on return.
    fn queue_order(&self, snapshot: &RegistrySnapshot, generation: u64, model: &str) -> Vec<String> {
        let mut rotation = self.rotation();
        if rotation.generation != generation {
            rotation.rebuild(snapshot, generation);
        }
        rotation
            .queues
            .get(model)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn move_to_tail(&self, model: &str, key_id: &str) {
        let mut rotation = self.rotation();
        if let Some(queue) = rotation.queues.get_mut(model) {
            if let Some(pos) = queue.iter().position(|id| id == key_id) {
                if let Some(id) = queue.remove(pos) {
                    queue.push_back(id);
                }
            }
        }
    }

    pub fn queue_states(&self) -> Vec<QueueState> {
        let generation = self.registry.generation();
        let snapshot = self.registry.snapshot();
        snapshot
            .models()
            .iter()
            .map(|m| QueueState {
                model: m.clone(),
                order: self.queue_order(&snapshot, generation, m),
            })
            .collect()
    }

    /// Candidate models when the caller has no preference: workload matches
    /// first, then the rest; each group by highest priority, then catalog order.
    fn rank_models(snapshot: &RegistrySnapshot, workload: Option<Workload>) -> Vec<String> {
        let mut ranked: Vec<(bool, i64, usize, String)> = snapshot
            .active_models()
            .into_iter()
            .enumerate()
            .map(|(idx, model)| {
                let active: Vec<_> = snapshot.keys_for_model(&model).filter(|k| k.active).collect();
                let matches = workload
                    .map(|w| active.iter().any(|k| k.workload() == Some(w)))
                    .unwrap_or(false);
                let priority = active.iter().map(|k| k.priority()).max().unwrap_or(0);
                (matches, priority, idx, model)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
        ranked.into_iter().map(|(_, _, _, m)| m).collect()
    }

    /// Pick and reserve a key for `model_preference` or, failing that, its
    /// direct fallbacks. Without a preference every model with an active key is
    /// a candidate. `Ok(None)` means nothing has capacity right now.
    pub async fn select(
        &self,
        model_preference: Option<&str>,
        workload: Option<Workload>,
        tokens_needed: u64,
        exclude_keys: &HashSet<String>,
    ) -> Result<Option<KeySelection>, SelectError> {
        let generation = self.registry.generation();
        let snapshot = self.registry.snapshot();

        let candidates: Vec<String> = match model_preference {
            Some(pref) => {
                if !snapshot.is_known_model(pref) {
                    return Err(SelectError::UnknownModel(pref.to_string()));
                }
                let mut models = vec![pref.to_string()];
                for fb in snapshot.fallbacks(pref) {
                    if !models.contains(fb) {
                        models.push(fb.clone());
                    }
                }
                models
            }
            None => Self::rank_models(&snapshot, workload),
        };

        for model in &candidates {
            if let Some(selection) = self
                .try_model(&snapshot, generation, model, tokens_needed, exclude_keys)
                .await?
            {
                if let Some(pref) = model_preference.filter(|p| *p != model.as_str()) {
                    info!(requested = pref, model = %model, "falling back to alternate model");
                }
                return Ok(Some(selection));
            }
        }

        debug!(
            model = model_preference.unwrap_or("*"),
            tokens_needed,
            excluded = exclude_keys.len(),
            "no key available"
        );
        Ok(None)
    }

    /// Like [`select`](Self::select) but restricted to one model, no fallback.
    pub async fn select_exact(
        &self,
        model: &str,
        tokens_needed: u64,
        exclude_keys: &HashSet<String>,
    ) -> Result<Option<KeySelection>, SelectError> {
        let generation = self.registry.generation();
        let snapshot = self.registry.snapshot();
        if !snapshot.is_known_model(model) {
            return Err(SelectError::UnknownModel(model.to_string()));
        }
        self.try_model(&snapshot, generation, model, tokens_needed, exclude_keys)
            .await
    }

    async fn try_model(
        &self,
        snapshot: &RegistrySnapshot,
        generation: u64,
        model: &str,
        tokens_needed: u64,
        exclude_keys: &HashSet<String>,
    ) -> Result<Option<KeySelection>, SelectError> {
        for key_id in self.queue_order(snapshot, generation, model) {
            let Some(key) = snapshot.get(&key_id) else {
                continue;
            };
            if !key.active || exclude_keys.contains(&key_id) {
                continue;
            }
            if self.quota.in_cooldown(&key_id).await {
                debug!(key_id = %key_id, "skipping key in cooldown");
                continue;
            }
            if !self
                .quota
                .try_reserve_key(&key_id, key.rpm, key.tpm, tokens_needed)
                .await
            {
                continue;
            }

            self.move_to_tail(model, &key_id);
            let secret = self.secrets.fetch_api_secret(&key_id).await?;
            debug!(key_id = %key_id, model, tokens_needed, "key selected");
            return Ok(Some(KeySelection {
                key_id: key.key_id.clone(),
                model: model.to_string(),
                provider: key.provider,
                base_url: key.effective_base_url(),
                secret,
            }));
        }
        Ok(None)
    }
}
