//! Provider call capability.
//!
//! [`ProviderClient`] is the seam to the upstream SDK: one request, one
//! structured result. [`classify`] maps that result onto the [`Outcome`] the
//! request router's retry state machine runs on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::key_registry::Provider;
use crate::secrets::ApiSecret;

/// Message in chat-completions wire form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Where a request goes
#[derive(Debug, Clone)]
pub struct ProviderTarget {
    pub provider: Provider,
    pub base_url: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    pub tokens: Option<u64>,
    pub raw_status: u16,
    pub finish_reason: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<u64>,
    },
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("no base URL for provider {0}")]
    NoBaseUrl(Provider),
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send(
        &self,
        secret: &ApiSecret,
        target: &ProviderTarget,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Classified result of one dispatch attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        content: String,
        tokens: Option<u64>,
    },
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },
    SafetyBlocked {
        message: String,
    },
    Transient {
        message: String,
    },
    Fatal {
        status: Option<u16>,
        message: String,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::RateLimited { .. } => "rate_limited",
            Outcome::SafetyBlocked { .. } => "safety_blocked",
            Outcome::Transient { .. } => "transient",
            Outcome::Fatal { .. } => "fatal",
        }
    }
}

const SAFETY_MARKERS: &[&str] = &[
    "safety",
    "content policy",
    "content_policy",
    "content_filter",
    "content management policy",
    "responsible ai",
    "prohibited content",
];

fn mentions_safety(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    SAFETY_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn classify(result: Result<ProviderResponse, ProviderError>) -> Outcome {
    match result {
        Ok(resp) => {
            let filtered = resp
                .finish_reason
                .as_deref()
                .map(|r| matches!(r, "content_filter" | "safety" | "SAFETY" | "prohibited_content"))
                .unwrap_or(false);
            if filtered {
                Outcome::SafetyBlocked {
                    message: format!(
                        "response stopped: {}",
                        resp.finish_reason.unwrap_or_default()
                    ),
                }
            } else if resp.content.trim().is_empty() {
                Outcome::Transient {
                    message: "empty response content".to_string(),
                }
            } else {
                Outcome::Success {
                    content: resp.content,
                    tokens: resp.tokens,
                }
            }
        }
        Err(ProviderError::Status {
            status,
            message,
            retry_after,
        }) => match status {
            429 => Outcome::RateLimited {
                message,
                retry_after,
            },
            408 | 500..=599 => Outcome::Transient {
                message: format!("{}: {}", status, message),
            },
            400..=499 if mentions_safety(&message) => Outcome::SafetyBlocked { message },
            _ => Outcome::Fatal {
                status: Some(status),
                message,
            },
        },
        Err(e @ ProviderError::Timeout(_)) | Err(e @ ProviderError::Network(_)) => {
            Outcome::Transient {
                message: e.to_string(),
            }
        }
        Err(e @ ProviderError::Decode(_)) => Outcome::Transient {
            message: e.to_string(),
        },
        Err(e @ ProviderError::NoBaseUrl(_)) => Outcome::Fatal {
            status: None,
            message: e.to_string(),
        },
    }
}

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new() -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Option<ChatMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CompletionUsage {
    total_tokens: Option<u64>,
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error").and_then(|e| {
                e.get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .or_else(|| e.as_str().map(str::to_string))
            })
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    async fn send(
        &self,
        secret: &ApiSecret,
        target: &ProviderTarget,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let base = target
            .base_url
            .clone()
            .or_else(|| target.provider.default_base_url().map(str::to_string))
            .ok_or(ProviderError::NoBaseUrl(target.provider))?;
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));

        let mut body = serde_json::json!({
            "model": target.model,
            "messages": request.messages,
        });
        if let Some(max) = request.max_output_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(secret.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(Duration::ZERO)
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message: error_message(&text),
                retry_after,
            });
        }

        let parsed: CompletionBody = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let choice = parsed.choices.into_iter().next();
        let (content, finish_reason) = match choice {
            Some(c) => (c.message.map(|m| m.content).unwrap_or_default(), c.finish_reason),
            None => (String::new(), None),
        };
        Ok(ProviderResponse {
            content,
            tokens: parsed.usage.and_then(|u| u.total_tokens),
            raw_status: status.as_u16(),
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(content: &str, finish: Option<&str>) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            content: content.to_string(),
            tokens: Some(12),
            raw_status: 200,
            finish_reason: finish.map(str::to_string),
        })
    }

    fn status(code: u16, message: &str) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Status {
            status: code,
            message: message.to_string(),
            retry_after: None,
        })
    }

    #[test]
    fn test_classify_success_and_empty() {
        assert_eq!(
            classify(ok("hi", Some("stop"))),
            Outcome::Success {
                content: "hi".into(),
                tokens: Some(12)
            }
        );
        assert_eq!(classify(ok("  ", None)).label(), "transient");
        assert_eq!(classify(ok("partial", Some("content_filter"))).label(), "safety_blocked");
    }

    #[test]
    fn test_classify_statuses() {
        assert_eq!(classify(status(429, "slow down")).label(), "rate_limited");
        assert_eq!(classify(status(503, "overloaded")).label(), "transient");
        assert_eq!(classify(status(408, "timeout")).label(), "transient");
        assert_eq!(
            classify(status(400, "Request blocked by safety settings")).label(),
            "safety_blocked"
        );
        assert_eq!(
            classify(status(400, "violates our content policy")).label(),
            "safety_blocked"
        );
        assert_eq!(classify(status(400, "bad request")).label(), "fatal");
        assert_eq!(classify(status(401, "invalid api key")).label(), "fatal");
    }

    #[test]
    fn test_classify_transport_errors() {
        assert_eq!(
            classify(Err(ProviderError::Timeout(Duration::from_secs(1)))).label(),
            "transient"
        );
        assert_eq!(
            classify(Err(ProviderError::Network("reset".into()))).label(),
            "transient"
        );
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error":{"message":"quota exceeded"}}"#),
            "quota exceeded"
        );
        assert_eq!(error_message("plain text\n"), "plain text");
    }
}
