//! Request Router
//!
//! Drives one logical request through key selection, dispatch and outcome
//! handling:
//!
//! ```text
//! ESTIMATE -> SELECT_KEY -> DISPATCH -> SUCCESS
//!                 ^            |-> RATE_LIMITED / TRANSIENT -> cooldown, backoff, exclude key
//!                 |            |-> SAFETY_BLOCKED -> sanitize, then escalate through fallbacks
//!                 +------------+-> FATAL / EXHAUSTED -> fail
//! ```
//!
//! Terminal failures come back as `RouterResult { success: false, .. }`; only
//! configuration errors surface as `Err(RouterError)`.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversation::{ConversationInit, MessageRole, StoredMessage};
use crate::conversation_manager::ConversationManager;
use crate::key_registry::{Provider, RegistryError, RegistryStats, Workload};
use crate::key_selector::{KeySelection, KeySelector, SelectError};
use crate::provider::{
    classify, ChatMessage, Outcome, ProviderClient, ProviderError, ProviderRequest, ProviderTarget,
};
use crate::quota::QuotaError;
use crate::secrets::SecretError;

/// Framing overhead added per message when estimating tokens.
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("unknown key: {0}")]
    UnknownKey(String),
    #[error("key registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("secret store error: {0}")]
    Secret(#[from] SecretError),
    #[error("quota store error: {0}")]
    Quota(#[from] QuotaError),
}

impl From<SelectError> for RouterError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::UnknownModel(m) => RouterError::UnknownModel(m),
            SelectError::Secret(s) => RouterError::Secret(s),
        }
    }
}

/// Why a request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    NoCapacity,
    RateLimited,
    SafetyBlocked,
    Transient,
    Fatal,
    Exhausted,
    DeadlineExceeded,
    StoreUnavailable,
}

/// Retry and cooldown tuning
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Retries after rate-limit or transient failures
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound on one provider call
    pub dispatch_timeout: Duration,
    pub rate_limit_cooldown: Duration,
    pub transient_cooldown: Duration,
    pub safety_cooldown: Duration,
    /// Completion budget assumed when the caller gives none
    pub default_completion_tokens: u64,
    /// Most recent chat messages sent upstream (None = whole history)
    pub history_limit: Option<usize>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            dispatch_timeout: Duration::from_secs(60),
            rate_limit_cooldown: Duration::from_secs(60),
            transient_cooldown: Duration::from_secs(30),
            safety_cooldown: Duration::from_secs(300),
            default_completion_tokens: 1_024,
            history_limit: None,
        }
    }
}

impl RouterConfig {
    /// `min(max_backoff, base * 2^attempt)` plus up to 10% uniform jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let base = exp.min(self.max_backoff_ms) as f64;
        let jitter = rand::thread_rng().gen_range(0.0..0.1) * base;
        Duration::from_secs_f64((base + jitter) / 1_000.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OneShotRequest {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub workload: Option<Workload>,
    #[serde(default)]
    pub expected_completion_tokens: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Overall budget for the request including retries
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub conv_id: String,
    pub message: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub workload: Option<Workload>,
    #[serde(default)]
    pub expected_completion_tokens: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    pub attempts: u32,
    pub request_id: String,
}

impl RouterResult {
    fn failure(request_id: &str, error_type: ErrorType, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(error.into()),
            model: None,
            key_id: None,
            tokens: None,
            error_type: Some(error_type),
            attempts,
            request_id: request_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    /// At least one active key is loaded
    pub key_manager: bool,
    /// Quota store reachable
    pub redis: bool,
    pub quota_backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_store: Option<bool>,
    pub registry: RegistryStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub key_id: String,
    pub provider: Provider,
    pub model_name: String,
    pub active: bool,
    pub rpm: u32,
    pub tpm: u32,
    pub rpm_available: Option<f64>,
    pub tpm_available: Option<f64>,
    pub in_cooldown: bool,
    pub cooldown_remaining_secs: Option<u64>,
}

/// `ceil(chars / 4)` plus framing overhead, per message.
pub fn estimate_tokens(messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .map(|m| (m.content.chars().count() as u64).div_ceil(4) + MESSAGE_OVERHEAD_TOKENS)
        .sum()
}

/// Terms that commonly trip provider safety filters in otherwise benign prompts.
const FLAGGED_TERMS: &[&str] = &[
    "exploit", "attack", "kill", "weapon", "bomb", "hack", "malware", "payload", "shoot",
];

/// Strip content that commonly trips safety filters: fenced code, URLs and
/// flagged terms. Whitespace is collapsed.
pub fn sanitize_prompt(text: &str) -> String {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (r"(?s)```.*?```".to_string(), "[code omitted]"),
            (r"https?://\S+".to_string(), "[link]"),
            (format!(r"(?i)\b({})\w*", FLAGGED_TERMS.join("|")), "[redacted]"),
            (r"[ \t]+".to_string(), " "),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Some((Regex::new(&pattern).ok()?, replacement)))
        .collect()
    });

    let mut out = text.to_string();
    for (re, replacement) in patterns {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    out.trim().to_string()
}

fn sanitize_messages(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| {
            if m.role == "user" {
                ChatMessage::new(m.role.clone(), sanitize_prompt(&m.content))
            } else {
                m.clone()
            }
        })
        .collect()
}

/// Where a request is in safety handling.
#[derive(Debug, Clone, PartialEq)]
enum SafetyStage {
    Original,
    /// Sanitized prompt on the model that blocked it
    Sanitized { model: String },
    /// Sanitized prompt on `chain[idx]`
    Escalating { chain: Vec<String>, idx: usize },
}

struct DispatchPlan {
    model: Option<String>,
    workload: Option<Workload>,
    tokens_needed: u64,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
    deadline: Option<Instant>,
}

struct Success {
    content: String,
    tokens: Option<u64>,
    model: String,
    key_id: String,
}

enum Terminal {
    Done(Success),
    Failed(ErrorType, String),
}

pub struct RequestRouter {
    selector: Arc<KeySelector>,
    provider: Arc<dyn ProviderClient>,
    conversations: Option<Arc<ConversationManager>>,
    config: RouterConfig,
}

impl RequestRouter {
    pub fn new(
        selector: Arc<KeySelector>,
        provider: Arc<dyn ProviderClient>,
        conversations: Option<Arc<ConversationManager>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            selector,
            provider,
            conversations,
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn selector(&self) -> &Arc<KeySelector> {
        &self.selector
    }

    pub fn conversations(&self) -> Option<&Arc<ConversationManager>> {
        self.conversations.as_ref()
    }

    pub async fn send_one_shot(&self, req: OneShotRequest) -> Result<RouterResult, RouterError> {
        let request_id = Uuid::new_v4().to_string();
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = req.system.filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(req.prompt));

        let plan = DispatchPlan {
            tokens_needed: estimate_tokens(&messages)
                + req
                    .expected_completion_tokens
                    .unwrap_or(self.config.default_completion_tokens),
            model: req.model,
            workload: req.workload,
            max_output_tokens: req.max_output_tokens,
            temperature: req.temperature,
            deadline: req
                .deadline_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
        };

        let (terminal, attempts) = self.run(&request_id, messages, plan).await?;
        Ok(Self::into_result(&request_id, terminal, attempts))
    }

    pub async fn send_chat(&self, req: ChatRequest) -> Result<RouterResult, RouterError> {
        let request_id = Uuid::new_v4().to_string();
        let deadline = req
            .deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        let Some(conversations) = self.conversations.clone() else {
            return Ok(RouterResult::failure(
                &request_id,
                ErrorType::StoreUnavailable,
                "conversation store not configured",
                0,
            ));
        };

        let history = match conversations
            .load_messages(&req.conv_id, self.config.history_limit)
            .await
        {
            Ok(h) => h,
            Err(e) => {
                warn!(conv_id = %req.conv_id, "failed to load conversation history: {}", e);
                return Ok(RouterResult::failure(
                    &request_id,
                    ErrorType::StoreUnavailable,
                    format!("conversation store unavailable: {}", e),
                    0,
                ));
            }
        };

        if history.is_empty() && req.user_id.is_some() {
            let init = ConversationInit {
                user_id: req.user_id.clone(),
                ..Default::default()
            };
            if let Err(e) = conversations.create_conversation(&req.conv_id, init).await {
                warn!(conv_id = %req.conv_id, "failed to create conversation: {}", e);
                return Ok(RouterResult::failure(
                    &request_id,
                    ErrorType::StoreUnavailable,
                    format!("conversation store unavailable: {}", e),
                    0,
                ));
            }
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(system) = req.system.as_ref().filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.extend(history.iter().map(ChatMessage::from));
        let user_message = ChatMessage::user(req.message.clone());
        let user_tokens = estimate_tokens(std::slice::from_ref(&user_message));
        messages.push(user_message);

        let plan = DispatchPlan {
            tokens_needed: estimate_tokens(&messages)
                + req
                    .expected_completion_tokens
                    .unwrap_or(self.config.default_completion_tokens),
            model: req.model.clone(),
            workload: req.workload,
            max_output_tokens: req.max_output_tokens,
            temperature: req.temperature,
            deadline,
        };

        let (terminal, attempts) = self.run(&request_id, messages, plan).await?;

        if let Terminal::Done(success) = &terminal {
            let clock = self.selector.quota().clock();
            let now = clock.now();
            let turn = [
                StoredMessage::new(MessageRole::User, req.message.clone(), now)
                    .with_tokens(Some(user_tokens)),
                StoredMessage::new(MessageRole::Assistant, success.content.clone(), now)
                    .with_tokens(success.tokens)
                    .with_meta(Some(success.model.clone()), Some(success.key_id.clone())),
            ];
            if let Err(e) = conversations.append_turn(&req.conv_id, &turn).await {
                warn!(
                    conv_id = %req.conv_id,
                    request_id = %request_id,
                    "reply delivered but conversation append failed: {}",
                    e
                );
            }
        }

        Ok(Self::into_result(&request_id, terminal, attempts))
    }

    fn into_result(request_id: &str, terminal: Terminal, attempts: u32) -> RouterResult {
        match terminal {
            Terminal::Done(s) => RouterResult {
                success: true,
                content: Some(s.content),
                error: None,
                model: Some(s.model),
                key_id: Some(s.key_id),
                tokens: s.tokens,
                error_type: None,
                attempts,
                request_id: request_id.to_string(),
            },
            Terminal::Failed(kind, message) => {
                RouterResult::failure(request_id, kind, message, attempts)
            }
        }
    }

    fn deadline_passed(deadline: Option<Instant>) -> bool {
        deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    async fn cooldown(&self, key_id: &str, ttl: Duration, reason: &str) {
        if let Err(e) = self
            .selector
            .quota()
            .set_cooldown(key_id, ttl, reason)
            .await
        {
            warn!(key_id, reason, "failed to record key cooldown: {}", e);
        }
    }

    /// Apply the deferred safety cooldown once the sanitized retry on the
    /// blocked model is over without a success.
    async fn release_held_back(
        &self,
        held_back: &mut Option<String>,
        excluded: &mut HashSet<String>,
    ) {
        if let Some(key_id) = held_back.take() {
            self.cooldown(&key_id, self.config.safety_cooldown, "safety_blocked")
                .await;
            excluded.insert(key_id);
        }
    }

    async fn select_for_stage(
        &self,
        stage: &SafetyStage,
        plan: &DispatchPlan,
        excluded: &HashSet<String>,
    ) -> Result<Option<KeySelection>, RouterError> {
        let selection = match stage {
            SafetyStage::Original => {
                self.selector
                    .select(plan.model.as_deref(), plan.workload, plan.tokens_needed, excluded)
                    .await?
            }
            SafetyStage::Sanitized { model } => {
                self.selector
                    .select_exact(model, plan.tokens_needed, excluded)
                    .await?
            }
            SafetyStage::Escalating { chain, idx } => match chain.get(*idx) {
                Some(model) => {
                    self.selector
                        .select_exact(model, plan.tokens_needed, excluded)
                        .await?
                }
                None => None,
            },
        };
        Ok(selection)
    }

    /// Move to the next safety stage. `None` when the chain is exhausted.
    fn next_safety_stage(&self, stage: &SafetyStage, blocked_model: &str) -> Option<SafetyStage> {
        match stage {
            SafetyStage::Original => Some(SafetyStage::Sanitized {
                model: blocked_model.to_string(),
            }),
            SafetyStage::Sanitized { model } => {
                let chain = self.selector.registry().fallbacks(model);
                (!chain.is_empty()).then_some(SafetyStage::Escalating { chain, idx: 0 })
            }
            SafetyStage::Escalating { chain, idx } => (idx + 1 < chain.len()).then(|| {
                SafetyStage::Escalating {
                    chain: chain.clone(),
                    idx: idx + 1,
                }
            }),
        }
    }

    async fn run(
        &self,
        request_id: &str,
        mut messages: Vec<ChatMessage>,
        plan: DispatchPlan,
    ) -> Result<(Terminal, u32), RouterError> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut retries: u32 = 0;
        let mut attempts: u32 = 0;
        let mut stage = SafetyStage::Original;
        let mut last_error: Option<String> = None;
        // key blocked on the raw prompt; stays eligible for the sanitized retry
        let mut held_back: Option<String> = None;

        loop {
            if Self::deadline_passed(plan.deadline) {
                self.release_held_back(&mut held_back, &mut excluded).await;
                return Ok((
                    Terminal::Failed(ErrorType::DeadlineExceeded, "request deadline exceeded".into()),
                    attempts,
                ));
            }

            let Some(selection) = self.select_for_stage(&stage, &plan, &excluded).await? else {
                if stage != SafetyStage::Original {
                    self.release_held_back(&mut held_back, &mut excluded).await;
                    // no capacity on this rung; try the next one
                    let current_model = match &stage {
                        SafetyStage::Sanitized { model } => model.clone(),
                        _ => String::new(),
                    };
                    match self.next_safety_stage(&stage, &current_model) {
                        Some(next) => {
                            stage = next;
                            continue;
                        }
                        None => {
                            return Ok((
                                Terminal::Failed(
                                    ErrorType::SafetyBlocked,
                                    last_error.unwrap_or_else(|| "blocked by safety filters".into()),
                                ),
                                attempts,
                            ));
                        }
                    }
                }
                let (kind, message) = if attempts == 0 {
                    if self.selector.quota().health_check().await {
                        (ErrorType::NoCapacity, "no key with available capacity".to_string())
                    } else {
                        (ErrorType::StoreUnavailable, "quota store unavailable".to_string())
                    }
                } else {
                    (
                        ErrorType::Exhausted,
                        last_error.unwrap_or_else(|| "all keys exhausted".into()),
                    )
                };
                return Ok((Terminal::Failed(kind, message), attempts));
            };

            attempts += 1;
            let target = ProviderTarget {
                provider: selection.provider,
                base_url: selection.base_url.clone(),
                model: selection.model.clone(),
            };
            let request = ProviderRequest {
                model: selection.model.clone(),
                messages: messages.clone(),
                max_output_tokens: plan.max_output_tokens,
                temperature: plan.temperature,
            };
            let call_timeout = match plan.deadline {
                Some(d) => self
                    .config
                    .dispatch_timeout
                    .min(d.saturating_duration_since(Instant::now())),
                None => self.config.dispatch_timeout,
            };
            let deadline_bound = call_timeout < self.config.dispatch_timeout;

            let started = Instant::now();
            let raw = match tokio::time::timeout(
                call_timeout,
                self.provider.send(&selection.secret, &target, &request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) if deadline_bound => {
                    // the caller's budget ran out, not the key's
                    info!(
                        target: "keyrelay::dispatch",
                        request_id,
                        key_id = %selection.key_id,
                        model = %selection.model,
                        attempt = attempts,
                        latency_ms = started.elapsed().as_millis() as u64,
                        outcome = "deadline_exceeded",
                        "dispatch"
                    );
                    self.release_held_back(&mut held_back, &mut excluded).await;
                    return Ok((
                        Terminal::Failed(
                            ErrorType::DeadlineExceeded,
                            format!(
                                "request deadline exceeded during dispatch after {}ms",
                                call_timeout.as_millis()
                            ),
                        ),
                        attempts,
                    ));
                }
                Err(_) => Err(ProviderError::Timeout(call_timeout)),
            };
            let outcome = classify(raw);
            info!(
                target: "keyrelay::dispatch",
                request_id,
                key_id = %selection.key_id,
                model = %selection.model,
                attempt = attempts,
                latency_ms = started.elapsed().as_millis() as u64,
                outcome = outcome.label(),
                "dispatch"
            );

            let (cooldown, reason, message) = match outcome {
                Outcome::Success { content, tokens } => {
                    return Ok((
                        Terminal::Done(Success {
                            content,
                            tokens,
                            model: selection.model,
                            key_id: selection.key_id,
                        }),
                        attempts,
                    ));
                }
                Outcome::Fatal { status, message } => {
                    debug!(request_id, ?status, "fatal provider error");
                    self.release_held_back(&mut held_back, &mut excluded).await;
                    return Ok((Terminal::Failed(ErrorType::Fatal, message), attempts));
                }
                Outcome::SafetyBlocked { message } => {
                    if stage == SafetyStage::Original {
                        held_back = Some(selection.key_id.clone());
                    } else {
                        self.cooldown(&selection.key_id, self.config.safety_cooldown, "safety_blocked")
                            .await;
                        excluded.insert(selection.key_id.clone());
                        self.release_held_back(&mut held_back, &mut excluded).await;
                    }
                    last_error = Some(message.clone());
                    match self.next_safety_stage(&stage, &selection.model) {
                        Some(next) => {
                            if stage == SafetyStage::Original {
                                messages = sanitize_messages(&messages);
                            }
                            info!(request_id, model = %selection.model, "safety block, escalating");
                            stage = next;
                            continue;
                        }
                        None => {
                            return Ok((Terminal::Failed(ErrorType::SafetyBlocked, message), attempts));
                        }
                    }
                }
                Outcome::RateLimited {
                    message,
                    retry_after,
                } => {
                    let ttl = retry_after
                        .map(Duration::from_secs)
                        .unwrap_or_default()
                        .max(self.config.rate_limit_cooldown);
                    (ttl, "rate_limited", message)
                }
                Outcome::Transient { message } => {
                    (self.config.transient_cooldown, "transient", message)
                }
            };

            self.cooldown(&selection.key_id, cooldown, reason).await;
            excluded.insert(selection.key_id);
            last_error = Some(message.clone());

            if retries >= self.config.max_retries {
                self.release_held_back(&mut held_back, &mut excluded).await;
                return Ok((
                    Terminal::Failed(
                        ErrorType::Exhausted,
                        format!("retries exhausted after {}: {}", reason, message),
                    ),
                    attempts,
                ));
            }

            let delay = self.config.backoff_delay(retries);
            retries += 1;
            if let Some(d) = plan.deadline {
                if Instant::now() + delay >= d {
                    self.release_held_back(&mut held_back, &mut excluded).await;
                    return Ok((
                        Terminal::Failed(
                            ErrorType::DeadlineExceeded,
                            "request deadline exceeded before retry".into(),
                        ),
                        attempts,
                    ));
                }
            }
            debug!(request_id, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::time::sleep(delay).await;
        }
    }

    /// Health snapshot across the registry and stores.
    pub async fn health_check(&self) -> HealthReport {
        let registry = self.selector.registry().stats();
        let key_manager = registry.active_keys > 0;
        let redis = self.selector.quota().health_check().await;
        let conversation_store = match &self.conversations {
            Some(c) => Some(c.health_check().await),
            None => None,
        };
        HealthReport {
            healthy: key_manager && redis && conversation_store.unwrap_or(true),
            key_manager,
            redis,
            quota_backend: self.selector.quota().store().backend_name(),
            conversation_store,
            registry,
        }
    }

    pub async fn get_all_key_statuses(&self) -> Vec<KeyStatus> {
        let quota = self.selector.quota();
        let mut statuses = Vec::new();
        for key in self.selector.registry().all_keys() {
            let snap = quota.snapshot(&key.key_id, key.rpm, key.tpm).await;
            statuses.push(KeyStatus {
                in_cooldown: snap.cooldown_remaining_secs.is_some(),
                cooldown_remaining_secs: snap.cooldown_remaining_secs,
                rpm_available: snap.rpm_available,
                tpm_available: snap.tpm_available,
                key_id: key.key_id,
                provider: key.provider,
                model_name: key.model_name,
                active: key.active,
                rpm: key.rpm,
                tpm: key.tpm,
            });
        }
        statuses
    }

    /// Re-read the key source. Returns the number of keys loaded.
    pub fn reload_keys(&self) -> Result<usize, RouterError> {
        Ok(self.selector.registry().reload()?)
    }

    pub async fn mark_key_unhealthy(
        &self,
        key_id: &str,
        cooldown_seconds: u64,
        reason: &str,
    ) -> Result<(), RouterError> {
        if self.selector.registry().get(key_id).is_none() {
            return Err(RouterError::UnknownKey(key_id.to_string()));
        }
        info!(key_id, cooldown_seconds, reason, "key marked unhealthy");
        self.selector
            .quota()
            .set_cooldown(key_id, Duration::from_secs(cooldown_seconds), reason)
            .await?;
        Ok(())
    }
}
