//! Backend Providers
//!
//! Every supported backend speaks the OpenAI chat-completions dialect, so a
//! single [`OpenAiCompatibleProvider`] parameterised by [`ProviderType`]
//! covers them all. Each variant carries its own base URL, credential
//! variable and model catalogue.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::config::{CostTier, ModelCapabilities};
use super::provider::{GenerateRequest, ModelResponse, Provider, ProviderError, ProviderType, Usage};

/// Upper bound on a single HTTP exchange; the dispatcher deadline is the real limit
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Longest upstream error body kept in error messages
const MAX_ERROR_BODY: usize = 512;

// ============================================================================
// OpenAI-compatible Provider
// ============================================================================

/// Provider speaking `POST {base_url}/chat/completions`
pub struct OpenAiCompatibleProvider {
    provider_type: ProviderType,
    base_url: String,
    api_key: Option<String>,
    models: Vec<ModelCapabilities>,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    /// Create a provider with an explicit catalogue
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(
        provider_type: ProviderType,
        base_url: impl Into<String>,
        api_key: Option<String>,
        models: Vec<ModelCapabilities>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("http client: {e}")))?;

        Ok(Self {
            provider_type,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            models,
            client,
        })
    }

    /// Create from process environment
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] when credentials are missing.
    pub fn from_env(provider_type: ProviderType) -> Result<Self, ProviderError> {
        Self::from_lookup(provider_type, |key| std::env::var(key).ok())
    }

    /// Create using an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] when credentials are missing.
    pub fn from_lookup<F>(provider_type: ProviderType, lookup: F) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let (default_url, key_var, url_var) = match provider_type {
            ProviderType::OpenAi => ("https://api.openai.com/v1", "OPENAI_API_KEY", "OPENAI_BASE_URL"),
            ProviderType::XAi => ("https://api.x.ai/v1", "XAI_API_KEY", "XAI_BASE_URL"),
            ProviderType::Moonshot => ("https://api.moonshot.ai/v1", "MOONSHOT_API_KEY", "MOONSHOT_BASE_URL"),
            ProviderType::Custom => ("", "CUSTOM_API_KEY", "CUSTOM_API_URL"),
            ProviderType::OpenRouter => ("https://openrouter.ai/api/v1", "OPENROUTER_API_KEY", "OPENROUTER_BASE_URL"),
        };

        let api_key = non_empty(key_var);
        let base_url = non_empty(url_var).unwrap_or_else(|| default_url.to_string());

        if provider_type == ProviderType::Custom {
            // Local endpoints usually need no key, only a URL
            if base_url.is_empty() {
                return Err(ProviderError::Unavailable(format!("{url_var} not set")));
            }
        } else if api_key.is_none() {
            return Err(ProviderError::Unavailable(format!("{key_var} not set")));
        }

        let models = match provider_type {
            ProviderType::Custom => custom_catalogue(non_empty("CUSTOM_MODELS").as_deref()),
            other => catalogue(other),
        };

        Self::new(provider_type, base_url, api_key, models)
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(&self, request: &GenerateRequest, model: &str) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({"model": model, "messages": messages});
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max) = request.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        body
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    fn capabilities(&self, model_name: &str) -> Option<ModelCapabilities> {
        if let Some(found) = self.models.iter().find(|m| m.matches(model_name)) {
            return Some(found.clone());
        }
        // OpenRouter serves any vendor-namespaced model
        let name = model_name.trim();
        if self.provider_type == ProviderType::OpenRouter && is_namespaced(name) {
            let tier = if name.ends_with(":free") { CostTier::Free } else { CostTier::Medium };
            return Some(ModelCapabilities::new(name, 128_000, tier));
        }
        None
    }

    fn list_models(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }

    async fn generate_content(&self, request: &GenerateRequest) -> Result<ModelResponse, ProviderError> {
        let model = self
            .capabilities(&request.model_name)
            .map(|c| c.name)
            .ok_or_else(|| ProviderError::ModelNotFound(request.model_name.clone()))?;

        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&self.request_body(request, &model));
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(map_transport_error)?;
        let status = response.status().as_u16();

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_status(status, retry_after, &body));
        }

        let data: Value = response.json().await.map_err(map_transport_error)?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let usage = Usage {
            input_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };

        Ok(ModelResponse {
            content,
            model_name: data["model"].as_str().unwrap_or(&model).to_string(),
            provider: self.provider_type,
            usage,
        })
    }
}

fn is_namespaced(name: &str) -> bool {
    matches!(name.split_once('/'), Some((vendor, model)) if !vendor.is_empty() && !model.is_empty())
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Map a non-success HTTP status to a typed error
/// `Retry-After` delta-seconds as milliseconds
fn parse_retry_after(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().map(|secs| secs.saturating_mul(1000))
}

pub(crate) fn error_from_status(status: u16, retry_after_ms: Option<u64>, body: &str) -> ProviderError {
    let message: String = body.chars().take(MAX_ERROR_BODY).collect();
    match status {
        429 => ProviderError::RateLimited {
            message,
            retry_after_ms,
        },
        401 | 403 => ProviderError::Authentication(message),
        404 => ProviderError::ModelNotFound(message),
        _ => ProviderError::Upstream { status, message },
    }
}

// ============================================================================
// Catalogues
// ============================================================================

/// Built-in model catalogue for a hosted provider
#[must_use]
pub fn catalogue(provider_type: ProviderType) -> Vec<ModelCapabilities> {
    match provider_type {
        ProviderType::OpenAi => vec![
            ModelCapabilities::new("gpt-5", 400_000, CostTier::High)
                .with_aliases(&["gpt5"])
                .with_images()
                .with_file_upload(),
            ModelCapabilities::new("gpt-5-mini", 400_000, CostTier::Low)
                .with_aliases(&["mini", "gpt5-mini"])
                .with_images(),
            ModelCapabilities::new("o3", 200_000, CostTier::High).with_aliases(&["o3-reasoning"]),
        ],
        ProviderType::XAi => vec![
            ModelCapabilities::new("grok-4", 256_000, CostTier::High)
                .with_aliases(&["grok", "grok4"])
                .with_images()
                .with_websearch(),
            ModelCapabilities::new("grok-code-fast-1", 256_000, CostTier::Low).with_aliases(&["grok-fast"]),
        ],
        ProviderType::Moonshot => vec![
            ModelCapabilities::new("kimi-k2-0905-preview", 256_000, CostTier::Medium)
                .with_aliases(&["kimi-k2", "kimi"])
                .with_websearch()
                .with_file_upload(),
            ModelCapabilities::new("kimi-latest", 128_000, CostTier::Medium).with_images(),
        ],
        ProviderType::Custom => custom_catalogue(None),
        ProviderType::OpenRouter => vec![
            ModelCapabilities::new("openai/gpt-5", 400_000, CostTier::High).with_images(),
            ModelCapabilities::new("meta-llama/llama-3.3-70b-instruct:free", 128_000, CostTier::Free)
                .with_aliases(&["llama-free"]),
        ],
    }
}

/// Catalogue for a self-hosted endpoint from a comma-separated model list
fn custom_catalogue(models: Option<&str>) -> Vec<ModelCapabilities> {
    models
        .unwrap_or("llama3.2")
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| ModelCapabilities::new(m, 32_768, CostTier::Free))
        .collect()
}
