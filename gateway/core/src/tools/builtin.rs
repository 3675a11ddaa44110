//! Built-in tools

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolError};
use crate::routing::{GenerateRequest, RouteHint, RouterService};

// ============================================================================
// chat
// ============================================================================

/// General chat with any routed model
pub struct ChatTool {
    router: Arc<RouterService>,
}

impl ChatTool {
    /// Create a chat tool routing through `router`
    pub fn new(router: Arc<RouterService>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Tool for ChatTool {
    fn name(&self) -> &str {
        "chat"
    }

    fn description(&self) -> &str {
        "General conversation and brainstorming with a routed model"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "What to ask"},
                "model": {"type": "string", "description": "Model name or 'auto'"},
                "hint": {"type": "string", "enum": ["fast", "long_context", "vision"]},
                "system_prompt": {"type": "string"},
                "temperature": {"type": "number", "minimum": 0, "maximum": 2},
                "files": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let prompt = arguments
            .get("prompt")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("'prompt' is required".into()))?;

        if arguments
            .get("files")
            .and_then(Value::as_array)
            .is_some_and(|files| !files.is_empty())
        {
            return Err(ToolError::InvalidArguments(
                "chat does not accept file attachments; inline the content in the prompt".into(),
            ));
        }

        let requested = arguments.get("model").and_then(Value::as_str).unwrap_or("auto");
        let hint = arguments
            .get("hint")
            .and_then(Value::as_str)
            .and_then(RouteHint::parse);

        let decision = self.router.choose_model_with_hint(requested, hint);
        let model = decision
            .chosen()
            .ok_or_else(|| ToolError::NoModel(requested.to_string()))?
            .to_string();

        let mut request = GenerateRequest::new(prompt, model);
        if let Some(system) = arguments.get("system_prompt").and_then(Value::as_str) {
            request = request.with_system_prompt(system);
        }
        if let Some(temperature) = arguments.get("temperature").and_then(Value::as_f64) {
            request = request.with_temperature(temperature as f32);
        }

        let response = self.router.registry().generate_content(&request).await?;

        Ok(json!({
            "status": "success",
            "content": response.content,
            "metadata": {
                "model": response.model_name,
                "provider": response.provider,
                "route_reason": decision.reason().as_str(),
                "usage": response.usage,
            }
        }))
    }
}

// ============================================================================
// listmodels
// ============================================================================

/// Lists every model each available provider serves
pub struct ListModelsTool {
    router: Arc<RouterService>,
}

impl ListModelsTool {
    /// Create over `router`'s registry
    pub fn new(router: Arc<RouterService>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Tool for ListModelsTool {
    fn name(&self) -> &str {
        "listmodels"
    }

    fn description(&self) -> &str {
        "List available providers, their models and circuit state"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: Value) -> Result<Value, ToolError> {
        let registry = self.router.registry();
        let providers: Vec<Value> = registry
            .available_providers()
            .into_iter()
            .filter_map(|provider_type| {
                let provider = registry.get_provider(provider_type)?;
                Some(json!({
                    "provider": provider_type,
                    "circuit": registry.circuits().state(provider_type.as_str()),
                    "models": provider.list_models(),
                }))
            })
            .collect();

        Ok(json!({
            "status": "success",
            "providers": providers,
            "telemetry": registry.telemetry().summaries(),
        }))
    }
}

// ============================================================================
// version
// ============================================================================

/// Reports the gateway version and configured providers
pub struct VersionTool {
    router: Arc<RouterService>,
}

impl VersionTool {
    /// Create over `router`'s registry
    pub fn new(router: Arc<RouterService>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Tool for VersionTool {
    fn name(&self) -> &str {
        "version"
    }

    fn description(&self) -> &str {
        "Gateway version and configured providers"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: Value) -> Result<Value, ToolError> {
        Ok(json!({
            "status": "success",
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "providers": self.router.registry().available_providers(),
        }))
    }
}
