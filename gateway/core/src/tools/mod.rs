//! Tool Contract
//!
//! A tool is the unit clients invoke with `call_tool`. The dispatcher only
//! needs a name, a description, an input schema and an async `execute`;
//! whatever a tool returns is normalised into a list of [`OutputItem`]s.

mod builtin;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::routing::{ProviderError, RouterService};

pub use builtin::{ChatTool, ListModelsTool, VersionTool};

/// Errors a tool may raise
#[derive(Debug, Error)]
pub enum ToolError {
    /// Arguments missing or malformed
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Routing found nothing able to serve the request
    #[error("no model available for '{0}'")]
    NoModel(String),

    /// Provider call failed after retries
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Anything else
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// Wire code reported to the client
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Provider(e) => e.kind().into(),
            Self::InvalidArguments(_) => ErrorCode::Input,
            Self::NoModel(_) | Self::Failed(_) => ErrorCode::ExecError,
        }
    }
}

/// A callable tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name
    fn name(&self) -> &str;

    /// One-line description
    fn description(&self) -> &str;

    /// JSON schema of the arguments object
    fn input_schema(&self) -> Value;

    /// Run the tool
    async fn execute(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// What `list_tools` reports per tool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name
    pub name: String,
    /// Description
    pub description: String,
    /// Argument schema
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Registered tools in registration order
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool of the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        if let Some(slot) = self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            *slot = tool;
        } else {
            self.tools.push(tool);
        }
    }

    /// Registry holding `chat`, `listmodels` and `version`
    #[must_use]
    pub fn builtin(router: &Arc<RouterService>) -> Self {
        Self::new()
            .with(Arc::new(ChatTool::new(Arc::clone(router))))
            .with(Arc::new(ListModelsTool::new(Arc::clone(router))))
            .with(Arc::new(VersionTool::new(Arc::clone(router))))
    }

    /// Builder-style register
    #[must_use]
    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Look up by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Descriptors for `list_tools`
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Registered names
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Number of tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// One element of a normalised tool result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputItem {
    /// Content type, currently always `text`
    #[serde(rename = "type")]
    pub kind: String,
    /// Content
    pub text: String,
}

impl OutputItem {
    /// Text item
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: text.into(),
        }
    }
}

/// Normalise any tool result into output items
///
/// - `null` → no items
/// - string → one text item
/// - array → one item per element (`{type, text}` objects kept as-is)
/// - anything else → one text item holding its JSON
#[must_use]
pub fn normalize_outputs(value: Value) -> Vec<OutputItem> {
    match value {
        Value::Null => Vec::new(),
        Value::String(text) => vec![OutputItem::text(text)],
        Value::Array(items) => items.into_iter().flat_map(normalize_element).collect(),
        other => vec![OutputItem::text(other.to_string())],
    }
}

fn normalize_element(value: Value) -> Vec<OutputItem> {
    match value {
        Value::Object(ref map) => match (map.get("type").and_then(Value::as_str), map.get("text").and_then(Value::as_str)) {
            (Some(kind), Some(text)) => vec![OutputItem {
                kind: kind.to_string(),
                text: text.to_string(),
            }],
            _ => vec![OutputItem::text(value.to_string())],
        },
        Value::Null => Vec::new(),
        Value::String(text) => vec![OutputItem::text(text)],
        other => vec![OutputItem::text(other.to_string())],
    }
}

/// Whether a tool result carries an explicit structured error status
///
/// Only `{"status": "error" | "failed" | ...}` counts; an empty but
/// successful payload is not an error. Text items holding such JSON are
/// inspected too.
#[must_use]
pub fn is_error_status(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .get("status")
            .and_then(Value::as_str)
            .is_some_and(|s| matches!(s.to_ascii_lowercase().as_str(), "error" | "failed" | "failure")),
        Value::String(text) => text.trim_start().starts_with('{')
            && serde_json::from_str::<Value>(text).is_ok_and(|v| is_error_status(&v)),
        Value::Array(items) => !items.is_empty()
            && items.iter().all(|item| match item {
                Value::Object(map) => map.get("text").map_or_else(|| is_error_status(item), is_error_status),
                other => is_error_status(other),
            }),
        _ => false,
    }
}
