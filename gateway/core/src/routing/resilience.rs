//! Resilience Decorator
//!
//! [`ResilientProvider`] wraps any [`Provider`] and is itself a `Provider`:
//! callers cannot tell it apart from the inner backend. Around every
//! `generate_content` call it measures latency, records telemetry and retries
//! retryable failures with exponential backoff. The circuit breaker hears
//! once per call: one success, or one failure after the last retry when the
//! error [trips the circuit](ProviderError::trips_circuit).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::circuit::CircuitBreakers;
use super::config::{ModelCapabilities, RetryConfig};
use super::provider::{GenerateRequest, ModelResponse, Provider, ProviderError, ProviderType};
use super::telemetry::Telemetry;

/// Retry/telemetry/circuit wrapper around a provider
pub struct ResilientProvider {
    inner: Arc<dyn Provider>,
    retry: RetryConfig,
    circuits: Option<Arc<CircuitBreakers>>,
    telemetry: Arc<Telemetry>,
}

impl ResilientProvider {
    /// Wrap `inner`
    ///
    /// With `circuits` set, outcomes are reported to the breaker keyed by the
    /// provider name.
    pub fn new(
        inner: Arc<dyn Provider>,
        retry: RetryConfig,
        circuits: Option<Arc<CircuitBreakers>>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            inner,
            retry,
            circuits,
            telemetry,
        }
    }
}

#[async_trait]
impl Provider for ResilientProvider {
    fn provider_type(&self) -> ProviderType {
        self.inner.provider_type()
    }

    fn capabilities(&self, model_name: &str) -> Option<ModelCapabilities> {
        self.inner.capabilities(model_name)
    }

    fn validate_model_name(&self, model_name: &str) -> bool {
        self.inner.validate_model_name(model_name)
    }

    fn resolve_model_name(&self, model_name: &str) -> String {
        self.inner.resolve_model_name(model_name)
    }

    fn list_models(&self) -> Vec<String> {
        self.inner.list_models()
    }

    async fn generate_content(&self, request: &GenerateRequest) -> Result<ModelResponse, ProviderError> {
        let provider = self.inner.provider_type();
        let mut attempt = 0;

        loop {
            let started = Instant::now();
            match self.inner.generate_content(request).await {
                Ok(response) => {
                    self.telemetry
                        .record_success(&request.model_name, started.elapsed(), response.usage);
                    if let Some(circuits) = &self.circuits {
                        circuits.record_success(provider.as_str());
                    }
                    return Ok(response);
                }
                Err(e) => {
                    self.telemetry.record_failure(&request.model_name, started.elapsed());

                    if !e.is_retryable() || attempt >= self.retry.max_retries {
                        if let Some(circuits) = self.circuits.as_ref().filter(|_| e.trips_circuit()) {
                            circuits.record_failure(provider.as_str());
                        }
                        tracing::warn!(
                            %provider,
                            model = %request.model_name,
                            attempts = attempt + 1,
                            error = %e,
                            "Provider call failed"
                        );
                        return Err(e);
                    }

                    let backoff = match &e {
                        ProviderError::RateLimited {
                            retry_after_ms: Some(ms),
                            ..
                        } => std::time::Duration::from_millis(*ms)
                            .min(std::time::Duration::from_millis(self.retry.max_backoff_ms)),
                        _ => self.retry.backoff_for_attempt(attempt),
                    };
                    tracing::debug!(
                        %provider,
                        model = %request.model_name,
                        attempt = attempt + 1,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Retrying provider call"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
