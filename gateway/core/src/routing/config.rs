//! Routing Configuration
//!
//! Configuration and descriptor types shared by the provider registry, the
//! resilience decorator, the router and the fallback orchestrator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Route Hints
// ============================================================================

/// Categorical hint that biases model selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteHint {
    /// Latency over depth
    Fast,
    /// Large inputs (long documents, many files)
    LongContext,
    /// Image inputs
    Vision,
}

impl RouteHint {
    /// Parse a hint from its wire name
    ///
    /// Accepts a few spellings clients commonly send.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "fast" | "quick" => Some(Self::Fast),
            "long_context" | "long_context_analysis" | "long" => Some(Self::LongContext),
            "vision" | "image" | "images" => Some(Self::Vision),
            _ => None,
        }
    }
}

// ============================================================================
// Model Descriptors
// ============================================================================

/// Relative cost of running a model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CostTier {
    /// Free tier (no per-token billing)
    Free,
    /// Cheap hosted models
    Low,
    /// Mid-range hosted models
    #[default]
    Medium,
    /// Flagship models
    High,
}

/// What a single model can do
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Canonical model name
    pub name: String,

    /// Alternative names accepted by `validate_model_name`
    pub aliases: Vec<String>,

    /// Maximum input context in tokens
    pub context_window: u32,

    /// Maximum output tokens
    pub max_output_tokens: u32,

    /// Accepts image inputs
    pub supports_images: bool,

    /// Can perform provider-side web search
    pub supports_websearch: bool,

    /// Accepts provider-side file uploads
    pub supports_file_upload: bool,

    /// Cost tier
    pub cost_tier: CostTier,
}

impl ModelCapabilities {
    /// Create a text-only descriptor
    pub fn new(name: impl Into<String>, context_window: u32, cost_tier: CostTier) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            context_window,
            max_output_tokens: 8_192,
            supports_images: false,
            supports_websearch: false,
            supports_file_upload: false,
            cost_tier,
        }
    }

    /// Add aliases
    #[must_use]
    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| (*a).to_string()).collect();
        self
    }

    /// Mark as accepting images
    #[must_use]
    pub fn with_images(mut self) -> Self {
        self.supports_images = true;
        self
    }

    /// Mark as supporting web search
    #[must_use]
    pub fn with_websearch(mut self) -> Self {
        self.supports_websearch = true;
        self
    }

    /// Mark as supporting file uploads
    #[must_use]
    pub fn with_file_upload(mut self) -> Self {
        self.supports_file_upload = true;
        self
    }

    /// Case-insensitive match against the name and aliases
    #[must_use]
    pub fn matches(&self, model_name: &str) -> bool {
        let wanted = model_name.trim();
        self.name.eq_ignore_ascii_case(wanted)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(wanted))
    }

    /// Whether the model bills nothing per token
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.cost_tier == CostTier::Free || self.name.ends_with(":free")
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry configuration for the provider resilience decorator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Initial backoff delay
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f32,

    /// Add jitter to backoff
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate backoff duration for attempt N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * f64::from(self.backoff_multiplier).powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            // Up to 25% jitter, still capped
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)).min(self.max_backoff_ms as f64) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }
}

// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

/// Thresholds for the per-provider circuit breakers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Successes while half-open before the circuit closes
    pub reset_threshold: u32,

    /// How long an open circuit rejects before probing
    pub cooloff_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_threshold: 2,
            cooloff_ms: 30_000,
        }
    }
}

impl CircuitConfig {
    /// Cooloff as a duration
    #[must_use]
    pub fn cooloff(&self) -> Duration {
        Duration::from_millis(self.cooloff_ms)
    }
}
