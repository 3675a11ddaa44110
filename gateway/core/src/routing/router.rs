//! Router Service
//!
//! Policy layer over the [`ProviderRegistry`]: turns a requested model name
//! (possibly `"auto"`) into a concrete model, and orders fallback candidates.
//!
//! ```text
//! choose_model(requested)
//!   ├─ concrete + resolvable ───────────────► explicit
//!   ├─ fast default resolvable ─────────────► auto_default_fast
//!   ├─ long-context default resolvable ─────► auto_default_long_context
//!   ├─ any available model ─────────────────► auto_first_available
//!   └─ nothing ─────────────────────────────► no_models_available
//! ```
//!
//! Every decision is an immutable [`RouteDecision`] and is logged.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use super::config::{ModelCapabilities, RouteHint};
use super::provider::{GenerateRequest, ProviderType};
use super::registry::ProviderRegistry;
use crate::config::RoutingConfig;

/// Budget for each preflight probe
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(15);

/// Why a model was chosen
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    /// Caller named a model we can serve
    Explicit,
    /// Configured fast default
    AutoDefaultFast,
    /// Configured long-context default
    AutoDefaultLongContext,
    /// First model any available provider offers
    AutoFirstAvailable,
    /// Picked for a fast hint
    HintFast,
    /// Picked for a long-context hint
    HintLongContext,
    /// Picked for a vision hint
    HintVision,
    /// Nothing can serve the request
    NoModelsAvailable,
}

impl RouteReason {
    /// Stable log/wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::AutoDefaultFast => "auto_default_fast",
            Self::AutoDefaultLongContext => "auto_default_long_context",
            Self::AutoFirstAvailable => "auto_first_available",
            Self::HintFast => "hint_fast",
            Self::HintLongContext => "hint_long_context",
            Self::HintVision => "hint_vision",
            Self::NoModelsAvailable => "no_models_available",
        }
    }
}

/// One routing outcome
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteDecision {
    requested: String,
    chosen: Option<String>,
    reason: RouteReason,
    provider: Option<ProviderType>,
    meta: Map<String, Value>,
}

impl RouteDecision {
    fn new(
        requested: &str,
        chosen: Option<String>,
        reason: RouteReason,
        provider: Option<ProviderType>,
        meta: Map<String, Value>,
    ) -> Self {
        let decision = Self {
            requested: requested.to_string(),
            chosen,
            reason,
            provider,
            meta,
        };
        tracing::info!(
            requested = %decision.requested,
            chosen = decision.chosen.as_deref().unwrap_or("-"),
            reason = decision.reason.as_str(),
            provider = decision.provider.map_or("-", |p| p.as_str()),
            meta = %serde_json::Value::Object(decision.meta.clone()),
            "Route decision"
        );
        decision
    }

    /// Name the caller asked for
    pub fn requested(&self) -> &str {
        &self.requested
    }

    /// Model to use, if any
    pub fn chosen(&self) -> Option<&str> {
        self.chosen.as_deref()
    }

    /// Why it was chosen
    pub fn reason(&self) -> RouteReason {
        self.reason
    }

    /// Provider that serves the chosen model
    pub fn provider(&self) -> Option<ProviderType> {
        self.provider
    }

    /// Extra context (unresolved names, hints)
    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }
}

/// Outcome of probing one default model at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreflightResult {
    /// Model probed
    pub model: String,
    /// Whether the probe succeeded
    pub ok: bool,
    /// Failure description
    pub error: Option<String>,
}

/// Model selection policy
pub struct RouterService {
    registry: Arc<ProviderRegistry>,
    fast_model: Option<String>,
    long_context_model: Option<String>,
    vision_model: Option<String>,
    prefer_free: bool,
}

fn is_sentinel(name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || name.eq_ignore_ascii_case("auto") || name.eq_ignore_ascii_case("default")
}

impl RouterService {
    /// Create a router over `registry`
    pub fn new(registry: Arc<ProviderRegistry>, config: &RoutingConfig) -> Self {
        let non_empty = |v: &Option<String>| v.as_ref().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            registry,
            fast_model: non_empty(&config.fast_model),
            long_context_model: non_empty(&config.long_context_model),
            vision_model: non_empty(&config.vision_model),
            prefer_free: config.prefer_free,
        }
    }

    /// Underlying registry
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Resolve `requested` to a concrete model
    pub fn choose_model(&self, requested: &str) -> RouteDecision {
        if let Some(decision) = self.explicit(requested) {
            return decision;
        }
        self.choose_default(requested, Self::unresolved_meta(requested))
    }

    /// Resolve `requested`, letting `hint` reorder the default chain
    pub fn choose_model_with_hint(&self, requested: &str, hint: Option<RouteHint>) -> RouteDecision {
        if let Some(decision) = self.explicit(requested) {
            return decision;
        }
        let Some(hint) = hint else {
            return self.choose_model(requested);
        };

        let mut meta = Self::unresolved_meta(requested);
        meta.insert("hint".into(), serde_json::to_value(hint).unwrap_or(Value::Null));

        let (defaults, reason): (Vec<&Option<String>>, RouteReason) = match hint {
            RouteHint::Fast => (vec![&self.fast_model], RouteReason::HintFast),
            RouteHint::LongContext => (
                vec![&self.long_context_model, &self.fast_model],
                RouteReason::HintLongContext,
            ),
            RouteHint::Vision => (vec![&self.vision_model], RouteReason::HintVision),
        };

        for model in defaults.into_iter().flatten() {
            if let Some(provider) = self.registry.provider_type_for_model(model) {
                return RouteDecision::new(requested, Some(model.clone()), reason, Some(provider), meta);
            }
        }

        // No configured default fits; pick the best available model for the hint
        let best = match hint {
            RouteHint::Fast => None,
            RouteHint::LongContext => self
                .catalogue()
                .into_iter()
                .max_by_key(|(caps, _)| caps.context_window),
            RouteHint::Vision => self.catalogue().into_iter().find(|(caps, _)| caps.supports_images),
        };
        if let Some((caps, provider)) = best {
            return RouteDecision::new(requested, Some(caps.name), reason, Some(provider), meta);
        }

        self.choose_default(requested, meta)
    }

    fn explicit(&self, requested: &str) -> Option<RouteDecision> {
        if is_sentinel(requested) {
            return None;
        }
        let provider = self.registry.provider_type_for_model(requested)?;
        Some(RouteDecision::new(
            requested,
            Some(requested.trim().to_string()),
            RouteReason::Explicit,
            Some(provider),
            Map::new(),
        ))
    }

    fn unresolved_meta(requested: &str) -> Map<String, Value> {
        let mut meta = Map::new();
        if !is_sentinel(requested) {
            meta.insert("unresolved".into(), Value::String(requested.trim().to_string()));
        }
        meta
    }

    fn choose_default(&self, requested: &str, meta: Map<String, Value>) -> RouteDecision {
        let defaults = [
            (&self.fast_model, RouteReason::AutoDefaultFast),
            (&self.long_context_model, RouteReason::AutoDefaultLongContext),
        ];
        for (model, reason) in defaults {
            let Some(model) = model else { continue };
            if let Some(provider) = self.registry.provider_type_for_model(model) {
                return RouteDecision::new(requested, Some(model.clone()), reason, Some(provider), meta);
            }
        }

        if let Some((model, provider)) = self.registry.available_models().into_iter().next() {
            return RouteDecision::new(
                requested,
                Some(model),
                RouteReason::AutoFirstAvailable,
                Some(provider),
                meta,
            );
        }

        RouteDecision::new(requested, None, RouteReason::NoModelsAvailable, None, meta)
    }

    fn catalogue(&self) -> Vec<(ModelCapabilities, ProviderType)> {
        self.registry
            .available_models()
            .into_iter()
            .filter_map(|(model, provider_type)| {
                let caps = self.registry.get_provider(provider_type)?.capabilities(&model)?;
                Some((caps, provider_type))
            })
            .collect()
    }

    /// Available models ordered as fallback candidates
    ///
    /// Ordering, most significant first: hint fit, free tier (when
    /// `prefer_free`), cost tier, observed success rate, registry priority.
    pub fn fallback_candidates(&self, hint: Option<RouteHint>, exclude: &[String]) -> Vec<String> {
        let telemetry = self.registry.telemetry();
        let mut candidates: Vec<(ModelCapabilities, f64)> = self
            .catalogue()
            .into_iter()
            .filter(|(caps, _)| !exclude.iter().any(|e| caps.matches(e)))
            .map(|(caps, _)| {
                let rate = telemetry.success_rate(&caps.name).unwrap_or(1.0);
                (caps, rate)
            })
            .collect();

        let prefer_free = self.prefer_free;
        candidates.sort_by(|(a, rate_a), (b, rate_b)| {
            hint_rank(hint, b)
                .cmp(&hint_rank(hint, a))
                .then_with(|| {
                    if prefer_free {
                        b.is_free().cmp(&a.is_free())
                    } else {
                        Ordering::Equal
                    }
                })
                .then_with(|| a.cost_tier.cmp(&b.cost_tier))
                .then_with(|| rate_b.partial_cmp(rate_a).unwrap_or(Ordering::Equal))
        });

        candidates.into_iter().map(|(caps, _)| caps.name).collect()
    }

    /// Probe each configured default with a trivial generation
    ///
    /// Never fails; outcomes are logged and returned.
    pub async fn preflight(&self) -> Vec<PreflightResult> {
        let mut results = Vec::new();
        let defaults = [&self.fast_model, &self.long_context_model];

        for model in defaults.into_iter().flatten() {
            let request = GenerateRequest::new("ping", model.clone()).with_max_output_tokens(8);
            let outcome = tokio::time::timeout(PREFLIGHT_TIMEOUT, self.registry.generate_content(&request)).await;

            let result = match outcome {
                Ok(Ok(_)) => {
                    tracing::info!(model = %model, "Preflight ok");
                    PreflightResult {
                        model: model.clone(),
                        ok: true,
                        error: None,
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(model = %model, error = %e, "Preflight failed");
                    PreflightResult {
                        model: model.clone(),
                        ok: false,
                        error: Some(e.to_string()),
                    }
                }
                Err(_) => {
                    tracing::warn!(model = %model, "Preflight timed out");
                    PreflightResult {
                        model: model.clone(),
                        ok: false,
                        error: Some("timed out".into()),
                    }
                }
            };
            results.push(result);
        }
        results
    }
}

fn hint_rank(hint: Option<RouteHint>, caps: &ModelCapabilities) -> u32 {
    match hint {
        Some(RouteHint::Vision) => u32::from(caps.supports_images),
        Some(RouteHint::LongContext) => caps.context_window,
        Some(RouteHint::Fast) | None => 0,
    }
}
