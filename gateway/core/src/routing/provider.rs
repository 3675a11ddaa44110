//! Provider Contract
//!
//! Every model backend implements [`Provider`]. The set of backends is closed
//! ([`ProviderType`]); capability questions are answered through
//! [`ModelCapabilities`] rather than by probing the implementation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::ModelCapabilities;

// ============================================================================
// Provider Type
// ============================================================================

/// The closed set of backends the gateway knows how to talk to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// OpenAI
    OpenAi,
    /// xAI (Grok)
    XAi,
    /// Moonshot (Kimi)
    Moonshot,
    /// Self-hosted OpenAI-compatible endpoint (Ollama, vLLM, ...)
    Custom,
    /// OpenRouter catch-all
    OpenRouter,
}

impl ProviderType {
    /// Every variant in default registration priority: native providers
    /// first, local next, catch-all last
    pub const PRIORITY: [ProviderType; 5] = [
        Self::OpenAi,
        Self::XAi,
        Self::Moonshot,
        Self::Custom,
        Self::OpenRouter,
    ];

    /// Stable lowercase name, also used as the circuit breaker key
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::XAi => "xai",
            Self::Moonshot => "moonshot",
            Self::Custom => "custom",
            Self::OpenRouter => "openrouter",
        }
    }

    /// Parse a provider name (case-insensitive)
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::PRIORITY.into_iter().find(|p| p.as_str() == name)
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Requests and Responses
// ============================================================================

/// A single generation request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// User prompt
    pub prompt: String,
    /// Model to run
    pub model_name: String,
    /// Optional system prompt
    pub system_prompt: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Output token cap
    pub max_output_tokens: Option<u32>,
}

impl GenerateRequest {
    /// Create a request for `model_name`
    pub fn new(prompt: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the output token cap
    #[must_use]
    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }
}

/// Token accounting for one call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

/// Result of a generation call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Generated text
    pub content: String,
    /// Model that produced it
    pub model_name: String,
    /// Provider that served it
    pub provider: ProviderType,
    /// Token usage
    pub usage: Usage,
}

// ============================================================================
// Errors
// ============================================================================

/// User-facing classification of a provider failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderErrorKind {
    /// Rate limit or quota
    RateLimit,
    /// Connectivity or timeout
    Network,
    /// Credentials rejected
    Auth,
    /// Request rejected as invalid
    Input,
    /// Anything else
    Other,
}

/// Errors raised by providers
#[derive(Clone, Debug, Error)]
pub enum ProviderError {
    /// Upstream rate limit
    #[error("rate limited: {message}")]
    RateLimited {
        /// Upstream message
        message: String,
        /// Suggested wait, if the upstream sent one
        retry_after_ms: Option<u64>,
    },

    /// Could not reach the upstream
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded its time budget
    #[error("request timed out")]
    Timeout,

    /// Credentials missing or rejected
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Upstream rejected the request body
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Model is not served by this provider
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Provider could not be constructed or is disabled
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Non-success response not covered above
    #[error("upstream error (status {status}): {message}")]
    Upstream {
        /// HTTP status
        status: u16,
        /// Response body or reason
        message: String,
    },
}

impl ProviderError {
    /// Classify for user-facing reporting
    ///
    /// Raw upstream errors are classified from their status and message text.
    #[must_use]
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::RateLimited { .. } => ProviderErrorKind::RateLimit,
            Self::Network(_) | Self::Timeout => ProviderErrorKind::Network,
            Self::Authentication(_) => ProviderErrorKind::Auth,
            Self::InvalidInput(_) | Self::ModelNotFound(_) => ProviderErrorKind::Input,
            Self::Unavailable(_) => ProviderErrorKind::Other,
            Self::Upstream { status, message } => classify_upstream(*status, message),
        }
    }

    /// Whether the resilience decorator should try again
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) | Self::Timeout => true,
            Self::Upstream { status, .. } => {
                *status >= 500 || self.kind() == ProviderErrorKind::RateLimit
            }
            _ => false,
        }
    }

    /// Whether the failure counts against the provider's circuit
    ///
    /// Rejected input and rejected credentials say nothing about whether
    /// the provider is up.
    #[must_use]
    pub fn trips_circuit(&self) -> bool {
        !matches!(self.kind(), ProviderErrorKind::Input | ProviderErrorKind::Auth)
    }
}

fn classify_upstream(status: u16, message: &str) -> ProviderErrorKind {
    let text = message.to_ascii_lowercase();
    if status == 429 || ["rate limit", "quota", "too many requests"].iter().any(|p| text.contains(p)) {
        ProviderErrorKind::RateLimit
    } else if status == 401
        || status == 403
        || ["api key", "unauthorized", "forbidden", "permission"].iter().any(|p| text.contains(p))
    {
        ProviderErrorKind::Auth
    } else if status == 400
        || status == 413
        || status == 422
        || ["context length", "invalid", "too long"].iter().any(|p| text.contains(p))
    {
        ProviderErrorKind::Input
    } else if status == 502
        || status == 503
        || status == 504
        || ["timeout", "timed out", "connection"].iter().any(|p| text.contains(p))
    {
        ProviderErrorKind::Network
    } else {
        ProviderErrorKind::Other
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// A model backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which backend this is
    fn provider_type(&self) -> ProviderType;

    /// Capabilities of `model_name`, if this provider serves it
    fn capabilities(&self, model_name: &str) -> Option<ModelCapabilities>;

    /// Whether this provider serves `model_name`
    fn validate_model_name(&self, model_name: &str) -> bool {
        self.capabilities(model_name).is_some()
    }

    /// Map an alias to the canonical model name
    fn resolve_model_name(&self, model_name: &str) -> String {
        self.capabilities(model_name)
            .map_or_else(|| model_name.to_string(), |c| c.name)
    }

    /// Canonical names of every served model
    fn list_models(&self) -> Vec<String>;

    /// Run one generation
    async fn generate_content(&self, request: &GenerateRequest) -> Result<ModelResponse, ProviderError>;
}
