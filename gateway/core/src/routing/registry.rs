//! Provider Registry
//!
//! Owns provider registrations in priority order, the lazily constructed
//! provider instances, and the model → provider resolution cache.
//!
//! # Resolution
//!
//! ```text
//! get_provider_for_model("Grok ")
//!        │ normalise → "grok"
//!        ▼
//!   resolution cache ──Positive(xai)──► get_provider(xai)
//!        │          └─Negative───────► None (no re-scan)
//!        │ miss
//!        ▼
//!   scan registrations in priority order
//!   (skip disallowed, unconstructible, optionally open-circuit providers)
//!   first validate_model_name() == true wins
//! ```
//!
//! The registry is an ordinary value: build one at startup and share it via
//! `Arc` with the router, the tools and the dispatcher.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::backends::OpenAiCompatibleProvider;
use super::circuit::CircuitBreakers;
use super::config::{ModelCapabilities, RetryConfig};
use super::provider::{GenerateRequest, ModelResponse, Provider, ProviderError, ProviderType};
use super::resilience::ResilientProvider;
use super::telemetry::Telemetry;
use crate::config::RoutingConfig;

/// Builds a provider instance on first use
pub type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync>;

/// Cached outcome of a model lookup
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Served by this provider
    Positive(ProviderType),
    /// Looked up before and nobody serves it
    Negative,
}

struct Registration {
    provider_type: ProviderType,
    factory: ProviderFactory,
}

/// Registry of model providers
pub struct ProviderRegistry {
    registrations: RwLock<Vec<Registration>>,
    instances: Mutex<HashMap<ProviderType, Arc<dyn Provider>>>,
    resolutions: Mutex<HashMap<String, Resolution>>,
    allowed: Option<HashSet<ProviderType>>,
    circuits: Arc<CircuitBreakers>,
    telemetry: Arc<Telemetry>,
    retry: RetryConfig,
    resilience: bool,
    skip_open_circuits: bool,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new(config: &RoutingConfig) -> Self {
        let allowed = if config.allowed_providers.is_empty() {
            None
        } else {
            let mut set = HashSet::new();
            for name in &config.allowed_providers {
                match ProviderType::parse(name) {
                    Some(p) => {
                        set.insert(p);
                    }
                    None => tracing::warn!(provider = %name, "Ignoring unknown provider in allow-list"),
                }
            }
            Some(set)
        };

        Self {
            registrations: RwLock::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
            resolutions: Mutex::new(HashMap::new()),
            allowed,
            circuits: Arc::new(CircuitBreakers::new(config.circuit.clone())),
            telemetry: Arc::new(Telemetry::new()),
            retry: config.retry.clone(),
            resilience: config.resilience,
            skip_open_circuits: config.skip_open_circuits,
        }
    }

    /// Create a registry with every built-in backend registered in default
    /// priority order, each reading its credentials from the environment
    pub fn from_config(config: &RoutingConfig) -> Self {
        let registry = Self::new(config);
        for provider_type in ProviderType::PRIORITY {
            registry.register(
                provider_type,
                Arc::new(move || {
                    OpenAiCompatibleProvider::from_env(provider_type).map(|p| Arc::new(p) as Arc<dyn Provider>)
                }),
            );
        }
        registry
    }

    /// Register a provider after all existing ones
    ///
    /// Re-registering a type replaces its factory but keeps its position.
    pub fn register(&self, provider_type: ProviderType, factory: ProviderFactory) {
        {
            let mut registrations = self.registrations.write();
            if let Some(existing) = registrations
                .iter_mut()
                .find(|r| r.provider_type == provider_type)
            {
                existing.factory = factory;
            } else {
                registrations.push(Registration {
                    provider_type,
                    factory,
                });
            }
        }
        self.instances.lock().remove(&provider_type);
        self.resolutions.lock().clear();
        tracing::debug!(provider = %provider_type, "Provider registered");
    }

    /// Registered types in priority order
    pub fn registered(&self) -> Vec<ProviderType> {
        self.registrations
            .read()
            .iter()
            .map(|r| r.provider_type)
            .collect()
    }

    /// Whether the allow-list permits `provider_type`
    pub fn is_allowed(&self, provider_type: ProviderType) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |set| set.contains(&provider_type))
    }

    /// Get (constructing on first use) the provider instance for a type
    ///
    /// Construction failures are logged and reported as `None`.
    pub fn get_provider(&self, provider_type: ProviderType) -> Option<Arc<dyn Provider>> {
        if !self.is_allowed(provider_type) {
            return None;
        }

        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(&provider_type) {
            return Some(Arc::clone(existing));
        }

        let factory = self
            .registrations
            .read()
            .iter()
            .find(|r| r.provider_type == provider_type)
            .map(|r| Arc::clone(&r.factory))?;

        match factory() {
            Ok(provider) => {
                let provider = if self.resilience {
                    Arc::new(ResilientProvider::new(
                        provider,
                        self.retry.clone(),
                        Some(Arc::clone(&self.circuits)),
                        Arc::clone(&self.telemetry),
                    )) as Arc<dyn Provider>
                } else {
                    provider
                };
                instances.insert(provider_type, Arc::clone(&provider));
                tracing::info!(provider = %provider_type, "Provider initialised");
                Some(provider)
            }
            Err(e) => {
                tracing::debug!(provider = %provider_type, error = %e, "Provider unavailable");
                None
            }
        }
    }

    /// Provider serving `model_name`, memoised
    pub fn get_provider_for_model(&self, model_name: &str) -> Option<Arc<dyn Provider>> {
        let provider_type = self.provider_type_for_model(model_name)?;
        self.get_provider(provider_type)
    }

    /// Provider type serving `model_name`, memoised
    pub fn provider_type_for_model(&self, model_name: &str) -> Option<ProviderType> {
        let key = normalize_model_name(model_name);
        if key.is_empty() {
            return None;
        }

        let cached = self.resolutions.lock().get(&key).copied();
        if let Some(cached) = cached {
            return match cached {
                Resolution::Positive(provider_type) => Some(provider_type),
                Resolution::Negative => None,
            };
        }

        let mut skipped_open = false;
        let mut found = None;
        for provider_type in self.registered() {
            if !self.is_allowed(provider_type) {
                continue;
            }
            if self.skip_open_circuits && self.circuits.is_open(provider_type.as_str()) {
                skipped_open = true;
                continue;
            }
            let Some(provider) = self.get_provider(provider_type) else {
                continue;
            };
            if provider.validate_model_name(model_name) {
                found = Some(provider_type);
                break;
            }
        }

        // A scan that skipped an open circuit reflects transient state
        if !skipped_open {
            let resolution = found.map_or(Resolution::Negative, Resolution::Positive);
            self.resolutions.lock().insert(key, resolution);
        }

        tracing::debug!(
            model = %model_name,
            provider = ?found,
            cached = !skipped_open,
            "Resolved model"
        );
        found
    }

    /// Cached resolution for `model_name`, if any
    pub fn cached_resolution(&self, model_name: &str) -> Option<Resolution> {
        self.resolutions
            .lock()
            .get(&normalize_model_name(model_name))
            .copied()
    }

    /// Forget every cached resolution
    pub fn reset_resolution_cache(&self) {
        self.resolutions.lock().clear();
    }

    /// Constructible, allowed providers in priority order
    pub fn available_providers(&self) -> Vec<ProviderType> {
        self.registered()
            .into_iter()
            .filter(|p| self.get_provider(*p).is_some())
            .collect()
    }

    /// Every model of every available provider, in priority order
    ///
    /// A model offered by several providers is listed once, under the
    /// highest-priority one.
    pub fn available_models(&self) -> Vec<(String, ProviderType)> {
        let mut seen = HashSet::new();
        let mut models = Vec::new();
        for provider_type in self.available_providers() {
            if let Some(provider) = self.get_provider(provider_type) {
                for model in provider.list_models() {
                    if seen.insert(normalize_model_name(&model)) {
                        models.push((model, provider_type));
                    }
                }
            }
        }
        models
    }

    /// Capabilities of `model_name` from whichever provider serves it
    pub fn capabilities(&self, model_name: &str) -> Option<ModelCapabilities> {
        self.get_provider_for_model(model_name)?
            .capabilities(model_name)
    }

    /// Generate with whichever provider serves `request.model_name`
    ///
    /// # Errors
    ///
    /// [`ProviderError::ModelNotFound`] when no provider serves the model,
    /// otherwise whatever the provider returns after retries.
    pub async fn generate_content(&self, request: &GenerateRequest) -> Result<ModelResponse, ProviderError> {
        let provider = self
            .get_provider_for_model(&request.model_name)
            .ok_or_else(|| ProviderError::ModelNotFound(request.model_name.clone()))?;
        provider.generate_content(request).await
    }

    /// Shared circuit breakers
    pub fn circuits(&self) -> &Arc<CircuitBreakers> {
        &self.circuits
    }

    /// Shared telemetry table
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Whether providers are wrapped in the resilience decorator, which
    /// already reports their outcomes to the circuit breakers
    pub fn is_resilient(&self) -> bool {
        self.resilience
    }
}

/// Cache key for a model name
#[must_use]
pub fn normalize_model_name(model_name: &str) -> String {
    model_name.trim().to_lowercase()
}
