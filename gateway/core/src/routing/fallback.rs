//! Fallback Orchestrator
//!
//! Runs a logical request against an ordered chain of tool/model attempts.
//!
//! ```text
//! step 0: primary (tool@model) ──fail──► retry once after a short backoff
//!    │                                        │ fail
//!    ▼                                        ▼
//! step 1 .. n: alternatives (skipped when their provider circuit is open)
//!    │ all failed
//!    ▼
//! local degradation: inline truncated `files` excerpts into `prompt`,
//! run the primary once more
//!    │ failed / not applicable
//!    ▼
//! terminal envelope {"status": "error", "code": "FALLBACK_EXHAUSTED", ...}
//! ```
//!
//! An attempt counts as failed only on an error, a timeout or an explicit
//! structured error status in the result; an empty successful payload is a
//! success. [`FallbackOrchestrator::execute`] never returns an error.
//!
//! Invalid arguments end the chain at once: every alternative would reject
//! them too. Only the degradation step still runs, since it rewrites the
//! arguments. If that is rejected as well the outcome carries the rejection
//! and the envelope code is `INPUT`.
//!
//! Circuits hear about provider faults only: timeouts, panics and provider
//! errors that [trip the circuit](super::ProviderError::trips_circuit).
//! With the resilience decorator in place provider errors are already
//! counted there and are not counted again.
//!
//! `files` are read only from inside `file_root`, and at most
//! `excerpt_bytes` of each.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;

use super::circuit::CircuitBreakers;
use super::config::RouteHint;
use super::router::RouterService;
use crate::config::FallbackConfig;
use crate::tools::{is_error_status, ToolError, ToolRegistry};

// ============================================================================
// Chain Steps
// ============================================================================

/// One link of a fallback chain
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct FallbackStep {
    /// Tool to invoke
    pub tool: String,
    /// Model override written into `arguments.model`
    pub model: Option<String>,
}

impl FallbackStep {
    /// Parse `tool` or `tool@model`
    #[must_use]
    pub fn parse(step: &str) -> Self {
        match step.trim().split_once('@') {
            Some((tool, model)) if !model.trim().is_empty() => Self {
                tool: tool.trim().to_string(),
                model: Some(model.trim().to_string()),
            },
            Some((tool, _)) => Self {
                tool: tool.trim().to_string(),
                model: None,
            },
            None => Self {
                tool: step.trim().to_string(),
                model: None,
            },
        }
    }

    fn new(tool: &str, model: Option<String>) -> Self {
        Self {
            tool: tool.to_string(),
            model,
        }
    }
}

/// How one attempt ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Returned a non-error result
    Success,
    /// Raised, or returned an error status
    Error,
    /// Exceeded the per-attempt timeout
    Timeout,
    /// Provider circuit open, not attempted
    Skipped,
}

/// Record of one attempt
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// Tool invoked
    pub tool: String,
    /// Model override, if any
    pub model: Option<String>,
    /// Circuit key consulted
    pub provider: Option<String>,
    /// Outcome
    pub outcome: AttemptOutcome,
    /// Error text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Wall time
    pub elapsed_ms: u64,
}

/// Final result of an orchestrated call
#[derive(Clone, Debug, PartialEq)]
pub struct FallbackOutcome {
    /// Successful tool result, or the terminal error envelope
    pub value: Value,
    /// Whether some attempt succeeded
    pub succeeded: bool,
    /// Whether success came from local degradation
    pub degraded: bool,
    /// Every attempt made, in order
    pub attempts: Vec<AttemptRecord>,
    /// Invalid-arguments message when the request itself was refused
    pub rejected: Option<String>,
}

enum Attempt {
    Success(Value),
    Failed(AttemptRecord),
    /// Arguments refused by the tool; the message of the refusal
    Rejected(AttemptRecord, String),
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Executes tool calls through fallback chains
pub struct FallbackOrchestrator {
    tools: Arc<ToolRegistry>,
    router: Arc<RouterService>,
    circuits: Arc<CircuitBreakers>,
    config: FallbackConfig,
    chains: HashMap<String, Vec<FallbackStep>>,
}

impl FallbackOrchestrator {
    /// Create an orchestrator sharing the registry's circuit breakers
    pub fn new(tools: Arc<ToolRegistry>, router: Arc<RouterService>, config: FallbackConfig) -> Self {
        let circuits = Arc::clone(router.registry().circuits());
        let chains = config
            .chains
            .iter()
            .map(|(tool, specs)| {
                let steps = specs.iter().map(|s| FallbackStep::parse(s)).collect();
                (tool.clone(), steps)
            })
            .collect();

        Self {
            tools,
            router,
            circuits,
            config,
            chains,
        }
    }

    /// Whether calls to `tool` go through a chain
    pub fn handles(&self, tool: &str) -> bool {
        self.chains.contains_key(tool) || self.config.orchestrated_tools.iter().any(|t| t == tool)
    }

    /// Chain for one call, primary first, without duplicates
    ///
    /// A configured chain is used as-is after the primary; otherwise the
    /// router's candidate ordering supplies `tool@model` alternatives.
    pub fn build_chain(&self, tool: &str, arguments: &Value) -> Vec<FallbackStep> {
        let requested = arguments.get("model").and_then(Value::as_str).unwrap_or("auto");
        let hint = arguments
            .get("hint")
            .and_then(Value::as_str)
            .and_then(RouteHint::parse);

        let mut chain = Vec::new();
        if let Some(configured) = self.chains.get(tool) {
            chain.push(FallbackStep::new(tool, arguments.get("model").and_then(Value::as_str).map(String::from)));
            chain.extend(configured.iter().cloned());
        } else {
            let decision = self.router.choose_model_with_hint(requested, hint);
            let primary = decision.chosen().map(String::from);
            let exclude: Vec<String> = primary.iter().cloned().collect();
            chain.push(FallbackStep::new(tool, primary));
            chain.extend(
                self.router
                    .fallback_candidates(hint, &exclude)
                    .into_iter()
                    .map(|model| FallbackStep::new(tool, Some(model))),
            );
        }

        let mut seen = std::collections::HashSet::new();
        chain.retain(|step| seen.insert(step.clone()));
        chain.truncate(self.config.max_chain_len.max(1));
        chain
    }

    /// Run `tool` through its chain
    pub async fn execute(&self, tool: &str, arguments: Value) -> FallbackOutcome {
        let chain = self.build_chain(tool, &arguments);
        let mut attempts = Vec::new();
        let mut rejected = None;

        'chain: for (index, step) in chain.iter().enumerate() {
            let tries = if index == 0 { 2 } else { 1 };
            for round in 0..tries {
                if round > 0 {
                    tokio::time::sleep(self.config.primary_retry_backoff()).await;
                }
                match self.attempt(step, &arguments, true).await {
                    Attempt::Success(value) => {
                        attempts.push(self.success_record(step, &arguments));
                        return FallbackOutcome {
                            value,
                            succeeded: true,
                            degraded: false,
                            attempts,
                            rejected: None,
                        };
                    }
                    Attempt::Rejected(record, message) => {
                        attempts.push(record);
                        rejected = Some(message);
                        break 'chain;
                    }
                    Attempt::Failed(record) => {
                        let skipped = record.outcome == AttemptOutcome::Skipped;
                        attempts.push(record);
                        if skipped {
                            break;
                        }
                    }
                }
            }
        }

        if let (Some(primary), Some(degraded_args)) = (chain.first(), self.degrade(&arguments).await) {
            tracing::info!(tool = %tool, "Chain exhausted, retrying with inlined file excerpts");
            // Best effort: the open-circuit gate does not apply here
            match self.attempt(primary, &degraded_args, false).await {
                Attempt::Success(value) => {
                    attempts.push(self.success_record(primary, &degraded_args));
                    return FallbackOutcome {
                        value,
                        succeeded: true,
                        degraded: true,
                        attempts,
                        rejected: None,
                    };
                }
                Attempt::Rejected(record, message) => {
                    attempts.push(record);
                    rejected = Some(message);
                }
                Attempt::Failed(record) => {
                    attempts.push(record);
                    rejected = None;
                }
            }
        }

        if let Some(message) = rejected {
            tracing::info!(tool = %tool, reason = %message, "Arguments rejected, chain not attempted");
            return FallbackOutcome {
                value: json!({
                    "status": "error",
                    "code": "INPUT",
                    "message": format!("invalid arguments: {message}"),
                    "attempts": attempts,
                }),
                succeeded: false,
                degraded: false,
                attempts,
                rejected: Some(message),
            };
        }

        tracing::warn!(tool = %tool, attempts = attempts.len(), "Fallback chain exhausted");
        FallbackOutcome {
            value: json!({
                "status": "error",
                "code": "FALLBACK_EXHAUSTED",
                "message": format!("all {} attempts for '{tool}' failed", attempts.len()),
                "attempts": attempts,
            }),
            succeeded: false,
            degraded: false,
            attempts,
            rejected: None,
        }
    }

    fn step_arguments(step: &FallbackStep, arguments: &Value) -> Value {
        let mut arguments = arguments.clone();
        if let (Some(model), Some(map)) = (&step.model, arguments.as_object_mut()) {
            map.insert("model".into(), Value::String(model.clone()));
        }
        arguments
    }

    fn circuit_key(&self, arguments: &Value) -> Option<String> {
        let model = arguments.get("model").and_then(Value::as_str)?;
        self.router
            .registry()
            .provider_type_for_model(model)
            .map(|p| p.as_str().to_string())
    }

    fn success_record(&self, step: &FallbackStep, arguments: &Value) -> AttemptRecord {
        AttemptRecord {
            tool: step.tool.clone(),
            model: step.model.clone(),
            provider: self.circuit_key(&Self::step_arguments(step, arguments)),
            outcome: AttemptOutcome::Success,
            detail: None,
            elapsed_ms: 0,
        }
    }

    async fn attempt(&self, step: &FallbackStep, arguments: &Value, gated: bool) -> Attempt {
        let started = Instant::now();
        let arguments = Self::step_arguments(step, arguments);
        let provider = self.circuit_key(&arguments);
        let record = |outcome: AttemptOutcome, detail: Option<String>| AttemptRecord {
            tool: step.tool.clone(),
            model: step.model.clone(),
            provider: provider.clone(),
            outcome,
            detail,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        let Some(tool) = self.tools.get(&step.tool) else {
            return Attempt::Failed(record(AttemptOutcome::Error, Some(format!("tool '{}' not found", step.tool))));
        };

        if let Some(key) = provider.as_ref().filter(|_| gated) {
            if self.circuits.is_open(key) {
                tracing::debug!(tool = %step.tool, provider = %key, "Skipping attempt, circuit open");
                return Attempt::Failed(record(AttemptOutcome::Skipped, Some("circuit open".into())));
            }
        }

        // Spawned so a panicking tool is contained and a timed-out one is aborted
        let mut handle = tokio::spawn(async move { tool.execute(arguments).await });
        let outcome = tokio::time::timeout(self.config.attempt_timeout(), &mut handle).await;

        let counted_upstream = self.router.registry().is_resilient();
        let failed = |outcome: AttemptOutcome, detail: String, provider_fault: bool| {
            if let Some(key) = provider.as_ref().filter(|_| provider_fault) {
                self.circuits.record_failure(key);
            }
            tracing::debug!(tool = %step.tool, model = ?step.model, outcome = ?outcome, detail = %detail, "Attempt failed");
            Attempt::Failed(record(outcome, Some(detail)))
        };

        match outcome {
            Ok(Ok(Ok(value))) if is_error_status(&value) => {
                let detail = value
                    .get("content")
                    .or_else(|| value.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("error status")
                    .to_string();
                failed(AttemptOutcome::Error, detail, false)
            }
            Ok(Ok(Ok(value))) => {
                if let Some(key) = provider.as_ref().filter(|_| !counted_upstream) {
                    self.circuits.record_success(key);
                }
                Attempt::Success(value)
            }
            Ok(Ok(Err(ToolError::InvalidArguments(message)))) => {
                tracing::debug!(tool = %step.tool, model = ?step.model, reason = %message, "Attempt rejected");
                Attempt::Rejected(
                    record(AttemptOutcome::Error, Some(format!("invalid arguments: {message}"))),
                    message,
                )
            }
            Ok(Ok(Err(e))) => {
                let provider_fault = !counted_upstream && matches!(&e, ToolError::Provider(p) if p.trips_circuit());
                failed(AttemptOutcome::Error, e.to_string(), provider_fault)
            }
            Ok(Err(join_error)) => failed(AttemptOutcome::Error, format!("tool panicked: {join_error}"), true),
            Err(_) => {
                handle.abort();
                failed(
                    AttemptOutcome::Timeout,
                    format!("exceeded {:?}", self.config.attempt_timeout()),
                    true,
                )
            }
        }
    }

    /// Arguments with `files` replaced by truncated excerpts appended to `prompt`
    async fn degrade(&self, arguments: &Value) -> Option<Value> {
        let files: Vec<String> = arguments
            .get("files")?
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect();
        if files.is_empty() {
            return None;
        }

        let limit = self.config.excerpt_bytes;
        let mut prompt = arguments
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let root = match &self.config.file_root {
            Some(root) => match tokio::fs::canonicalize(root).await {
                Ok(root) => Some(root),
                Err(e) => {
                    tracing::warn!(root = ?root, error = %e, "File root unusable");
                    None
                }
            },
            None => None,
        };

        for path in &files {
            match read_excerpt(root.as_deref(), path, limit).await {
                Ok((excerpt, truncated)) => {
                    prompt.push_str(&format!("\n\n--- {path}{} ---\n{excerpt}", if truncated { " (truncated)" } else { "" }));
                }
                Err(reason) => {
                    tracing::warn!(path = %path, reason = %reason, "File not inlined");
                    prompt.push_str(&format!("\n\n--- {path} (not available) ---"));
                }
            }
        }

        let mut degraded = arguments.clone();
        let map = degraded.as_object_mut()?;
        map.remove("files");
        map.insert("prompt".into(), Value::String(prompt));
        Some(degraded)
    }
}

/// Up to `limit` bytes of `path`, which must resolve inside `root`
///
/// Relative paths are taken from `root`. Symlinks and `..` are resolved
/// before the containment check.
async fn read_excerpt(root: Option<&Path>, path: &str, limit: usize) -> Result<(String, bool), String> {
    let root = root.ok_or("no file root configured")?;
    let resolved = tokio::fs::canonicalize(root.join(path))
        .await
        .map_err(|e| e.to_string())?;
    if !resolved.starts_with(root) {
        return Err(format!("{} is outside the file root", resolved.display()));
    }

    let file = tokio::fs::File::open(&resolved).await.map_err(|e| e.to_string())?;
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut bytes = Vec::new();
    file.take(cap)
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| e.to_string())?;

    let truncated = bytes.len() > limit;
    bytes.truncate(limit);
    Ok((String::from_utf8_lossy(&bytes).into_owned(), truncated))
}

impl FallbackConfig {
    /// Per-attempt timeout
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        crate::config::secs(self.attempt_timeout_secs)
    }

    /// Fixed pause before the primary's single retry
    #[must_use]
    pub fn primary_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.primary_retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::routing::{
        CircuitConfig, CircuitState, CostTier, GenerateRequest, ModelCapabilities, ModelResponse, Provider,
        ProviderError, ProviderRegistry, ProviderType,
    };
    use crate::tools::{Tool, ToolError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::path::PathBuf;

    struct Catalogue(ProviderType, &'static [&'static str]);

    #[async_trait]
    impl Provider for Catalogue {
        fn provider_type(&self) -> ProviderType {
            self.0
        }

        fn capabilities(&self, model_name: &str) -> Option<ModelCapabilities> {
            self.1
                .iter()
                .find(|m| **m == model_name)
                .map(|m| ModelCapabilities::new(*m, 8_000, CostTier::Low))
        }

        fn list_models(&self) -> Vec<String> {
            self.1.iter().map(|m| (*m).to_string()).collect()
        }

        async fn generate_content(&self, request: &GenerateRequest) -> Result<ModelResponse, ProviderError> {
            Err(ProviderError::ModelNotFound(request.model_name.clone()))
        }
    }

    /// Records every call's model; behaviour chosen per model
    struct Scripted {
        calls: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Tool for Scripted {
        fn name(&self) -> &str {
            "chat"
        }

        fn description(&self) -> &str {
            "scripted"
        }

        fn input_schema(&self) -> Value {
            json!({})
        }

        async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
            self.calls.lock().push(arguments.clone());
            if arguments.get("prompt").and_then(Value::as_str) == Some("") {
                return Err(ToolError::InvalidArguments("'prompt' is required".into()));
            }
            if arguments.get("files").is_some() {
                return Err(ToolError::InvalidArguments("no uploads".into()));
            }
            match arguments.get("model").and_then(Value::as_str) {
                Some("good") => Ok(json!({"status": "success", "content": ""})),
                Some("rejects-input") => Err(ProviderError::InvalidInput("context too long".into()).into()),
                Some("unreachable") => Err(ProviderError::Network("connection refused".into()).into()),
                Some("soft-error") => Ok(json!({"status": "error", "content": "quota"})),
                Some("slow") => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("late"))
                }
                Some("panics") => panic!("tool bug"),
                _ if arguments.get("prompt").and_then(Value::as_str).is_some_and(|p| p.contains("---")) => {
                    Ok(json!({"status": "success", "content": "inlined"}))
                }
                _ => Err(ToolError::Failed("boom".into())),
            }
        }
    }

    fn setup(chain: &[&str]) -> (FallbackOrchestrator, Arc<Scripted>) {
        setup_with_root(chain, None)
    }

    fn setup_with_root(chain: &[&str], file_root: Option<PathBuf>) -> (FallbackOrchestrator, Arc<Scripted>) {
        let routing = RoutingConfig {
            resilience: false,
            skip_open_circuits: false,
            circuit: CircuitConfig {
                failure_threshold: 2,
                reset_threshold: 1,
                cooloff_ms: 60_000,
            },
            ..RoutingConfig::default()
        };
        let registry = Arc::new(ProviderRegistry::new(&routing));
        registry.register(
            ProviderType::XAi,
            Arc::new(|| Ok(Arc::new(Catalogue(ProviderType::XAi, &["bad", "soft-error", "slow", "panics", "rejects-input", "unreachable"])) as Arc<dyn Provider>)),
        );
        registry.register(
            ProviderType::Custom,
            Arc::new(|| Ok(Arc::new(Catalogue(ProviderType::Custom, &["good"])) as Arc<dyn Provider>)),
        );
        let router = Arc::new(RouterService::new(registry, &routing));

        let tool = Arc::new(Scripted {
            calls: Mutex::new(Vec::new()),
        });
        let tools = Arc::new(ToolRegistry::new().with(Arc::clone(&tool) as Arc<dyn Tool>));

        let mut chains = HashMap::new();
        if !chain.is_empty() {
            chains.insert("chat".to_string(), chain.iter().map(|s| (*s).to_string()).collect());
        }
        let config = FallbackConfig {
            chains,
            attempt_timeout_secs: 0.2,
            primary_retry_backoff_ms: 1,
            max_chain_len: 4,
            file_root,
            ..FallbackConfig::default()
        };
        (FallbackOrchestrator::new(tools, router, config), tool)
    }

    #[test]
    fn test_step_parse() {
        assert_eq!(
            FallbackStep::parse("chat@grok-4"),
            FallbackStep {
                tool: "chat".into(),
                model: Some("grok-4".into())
            }
        );
        assert_eq!(FallbackStep::parse(" chat@ ").model, None);
        assert_eq!(FallbackStep::parse("listmodels").tool, "listmodels");
    }

    #[tokio::test]
    async fn test_primary_gets_one_retry_then_chain_moves_on() {
        let (orchestrator, tool) = setup(&["chat@good"]);
        let outcome = orchestrator.execute("chat", json!({"model": "bad", "prompt": "x"})).await;

        assert!(outcome.succeeded);
        assert!(!outcome.degraded);
        let models: Vec<_> = tool.calls.lock().iter().map(|a| a["model"].clone()).collect();
        assert_eq!(models, vec![json!("bad"), json!("bad"), json!("good")]);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.attempts[2].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn test_empty_success_is_not_an_error_but_status_error_is() {
        let (orchestrator, _) = setup(&["chat@good"]);
        let outcome = orchestrator
            .execute("chat", json!({"model": "soft-error", "prompt": "x"}))
            .await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Error);
        assert_eq!(outcome.attempts[0].detail.as_deref(), Some("quota"));
        assert_eq!(outcome.value["content"], "");
    }

    #[tokio::test]
    async fn test_open_circuit_skips_and_failures_feed_breaker() {
        let (orchestrator, tool) = setup(&["chat@bad", "chat@good"]);
        // Two primary tries open the xai circuit (threshold 2)
        let outcome = orchestrator.execute("chat", json!({"model": "slow", "prompt": "x"})).await;

        assert!(outcome.succeeded);
        let outcomes: Vec<_> = outcome.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::Timeout,
                AttemptOutcome::Timeout,
                AttemptOutcome::Skipped,
                AttemptOutcome::Success
            ]
        );
        assert!(tool.calls.lock().iter().all(|a| a["model"] != "bad"));
    }

    #[tokio::test]
    async fn test_panicking_tool_is_contained() {
        let (orchestrator, _) = setup(&["chat@good"]);
        let outcome = orchestrator.execute("chat", json!({"model": "panics", "prompt": "x"})).await;
        assert!(outcome.succeeded);
        assert!(outcome.attempts[0].detail.as_deref().unwrap_or("").contains("panicked"));
    }

    #[tokio::test]
    async fn test_degradation_inlines_files() {
        let root = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(root.path().join("big.txt")).unwrap();
        write!(file, "{}", "x".repeat(10_000)).unwrap();

        let (orchestrator, tool) = setup_with_root(&["chat@bad"], Some(root.path().to_path_buf()));
        let outcome = orchestrator
            .execute("chat", json!({"model": "bad", "prompt": "review", "files": ["big.txt"]}))
            .await;

        assert!(outcome.succeeded);
        assert!(outcome.degraded);
        assert_eq!(outcome.value["content"], "inlined");

        let last = tool.calls.lock().last().cloned().unwrap();
        assert!(last.get("files").is_none());
        let prompt = last["prompt"].as_str().unwrap();
        assert!(prompt.starts_with("review"));
        assert!(prompt.contains("(truncated)"));
        assert!(prompt.len() < 10_000);
    }

    #[tokio::test]
    async fn test_files_outside_root_are_refused() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("shared");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("secret.txt"), "TOPSECRET").unwrap();
        std::fs::write(root.join("notes.txt"), "visible").unwrap();

        let (orchestrator, tool) = setup_with_root(&["chat@bad"], Some(root));
        let outcome = orchestrator
            .execute(
                "chat",
                json!({"model": "bad", "prompt": "hi", "files": ["/etc/passwd", "../secret.txt", "notes.txt"]}),
            )
            .await;
        assert!(outcome.degraded);

        let last = tool.calls.lock().last().cloned().unwrap();
        let prompt = last["prompt"].as_str().unwrap();
        assert!(!prompt.contains("root:"));
        assert!(!prompt.contains("TOPSECRET"));
        assert!(prompt.contains("--- /etc/passwd (not available) ---"));
        assert!(prompt.contains("--- ../secret.txt (not available) ---"));
        assert!(prompt.contains("--- notes.txt ---\nvisible"));
    }

    #[tokio::test]
    async fn test_files_refused_without_root() {
        let (orchestrator, tool) = setup(&["chat@bad"]);
        orchestrator
            .execute("chat", json!({"model": "bad", "prompt": "hi", "files": ["/etc/hostname"]}))
            .await;

        let last = tool.calls.lock().last().cloned().unwrap();
        assert_eq!(last["prompt"], "hi\n\n--- /etc/hostname (not available) ---");
    }

    #[tokio::test]
    async fn test_excerpt_reads_at_most_limit() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), "abcdef").unwrap();
        let canonical = std::fs::canonicalize(root.path()).unwrap();

        let (excerpt, truncated) = read_excerpt(Some(&canonical), "a.txt", 4).await.unwrap();
        assert_eq!((excerpt.as_str(), truncated), ("abcd", true));
        let (excerpt, truncated) = read_excerpt(Some(&canonical), "a.txt", 6).await.unwrap();
        assert_eq!((excerpt.as_str(), truncated), ("abcdef", false));
        assert!(read_excerpt(None, "a.txt", 4).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_arguments_end_chain_without_tripping_circuit() {
        let (orchestrator, tool) = setup(&["chat@good"]);
        for _ in 0..3 {
            let outcome = orchestrator.execute("chat", json!({"model": "bad", "prompt": ""})).await;
            assert!(!outcome.succeeded);
            assert_eq!(outcome.rejected.as_deref(), Some("'prompt' is required"));
            assert_eq!(outcome.value["code"], "INPUT");
            assert_eq!(outcome.attempts.len(), 1);
        }
        assert_eq!(tool.calls.lock().len(), 3);
        assert_eq!(orchestrator.circuits.state("xai"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_only_provider_faults_feed_breaker() {
        let (orchestrator, _) = setup(&["chat@good"]);
        // Input-class provider errors and plain tool failures leave the circuit alone
        for model in ["rejects-input", "bad"] {
            let outcome = orchestrator.execute("chat", json!({"model": model, "prompt": "x"})).await;
            assert!(outcome.succeeded);
        }
        assert_eq!(orchestrator.circuits.state("xai"), CircuitState::Closed);

        // Two network failures on the primary reach the threshold of 2
        orchestrator
            .execute("chat", json!({"model": "unreachable", "prompt": "x"}))
            .await;
        assert_eq!(orchestrator.circuits.state("xai"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_exhausted_chain_returns_envelope() {
        let (orchestrator, _) = setup(&["chat@bad", "missing-tool"]);
        let outcome = orchestrator.execute("chat", json!({"model": "bad", "prompt": "x"})).await;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.value["status"], "error");
        assert_eq!(outcome.value["code"], "FALLBACK_EXHAUSTED");
        assert_eq!(outcome.value["attempts"].as_array().unwrap().len(), outcome.attempts.len());
    }

    #[tokio::test]
    async fn test_unconfigured_chain_uses_router_candidates() {
        let (orchestrator, _) = setup(&[]);
        let chain = orchestrator.build_chain("chat", &json!({"model": "bad"}));
        assert_eq!(chain[0].model.as_deref(), Some("bad"));
        assert!(chain.iter().any(|s| s.model.as_deref() == Some("good")));
        assert!(chain.len() <= 4);

        let outcome = orchestrator.execute("chat", json!({"model": "bad", "prompt": "x"})).await;
        assert!(outcome.succeeded);
    }
}
