//! Dispatcher
//!
//! Serves the operations of an authenticated session. `call_tool` is the
//! core path:
//!
//! ```text
//! call_tool(request)
//!   │ tool lookup ───────────────────────────────► TOOL_NOT_FOUND
//!   │ resolve provider (gate only)
//!   │ result cached for request_id? ─────────────► replay
//!   │ call_key = sha256(tool, canonical arguments)
//!   │ result cached for call_key? ───────────────► replay
//!   │ request_id in flight? ─────────────────────► progress "still processing"
//!   │ call_key in flight? ───────────────────────► wait for leader, replay
//!   │ admit global → provider → session ─────────► OVER_CAPACITY
//!   │ call_tool_ack
//!   │ spawn tool; every progress interval ───────► progress
//!   │ deadline passed ───────────────────────────► abort, TIMEOUT
//!   ▼
//! normalise, cache (successes only), release permits, wake followers
//! ```

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::admission::AdmissionController;
use super::cache::ResultCache;
use super::inflight::{Claim, InFlightTable};
use super::protocol::{CallToolRequest, ServerMessage};
use crate::config::{secs, DispatchConfig, GatewayConfig};
use crate::error::{ErrorBody, ErrorCode};
use crate::routing::{FallbackOrchestrator, RouterService};
use crate::session::{Session, SessionManager};
use crate::tools::{normalize_outputs, ToolError, ToolRegistry};

/// Shared state behind every connection
pub struct Dispatcher {
    tools: Arc<ToolRegistry>,
    router: Arc<RouterService>,
    orchestrator: Option<Arc<FallbackOrchestrator>>,
    sessions: Arc<SessionManager>,
    admission: AdmissionController,
    results: ResultCache,
    inflight: Arc<InFlightTable>,
    auth_token: RwLock<Option<String>>,
    config: DispatchConfig,
    started_at: Instant,
}

impl Dispatcher {
    /// Build from configuration
    pub fn new(config: &GatewayConfig, tools: Arc<ToolRegistry>, router: Arc<RouterService>) -> Self {
        let dispatch = config.dispatch.clone();
        Self {
            tools,
            router,
            orchestrator: None,
            sessions: Arc::new(SessionManager::new(dispatch.session_max_inflight)),
            admission: AdmissionController::new(&dispatch),
            results: ResultCache::new(secs(dispatch.result_ttl_secs), dispatch.result_cache_max),
            inflight: Arc::new(InFlightTable::new()),
            auth_token: RwLock::new(config.auth_token.clone().filter(|t| !t.is_empty())),
            config: dispatch,
            started_at: Instant::now(),
        }
    }

    /// Route orchestrated tools through `orchestrator`
    #[must_use]
    pub fn with_orchestrator(mut self, orchestrator: Arc<FallbackOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Live sessions
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Admission pools
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Dispatch settings
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Time since construction
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Drop expired cached results
    pub fn purge_results(&self) -> usize {
        self.results.purge_expired()
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    /// Whether `token` opens a session
    ///
    /// With no configured token every hello is accepted.
    pub fn authenticate(&self, token: Option<&str>) -> bool {
        match self.auth_token.read().as_deref() {
            None => true,
            Some(expected) => token.is_some_and(|t| tokens_match(t, expected)),
        }
    }

    /// Replace the shared secret after checking the current one
    pub fn rotate_token(&self, old: &str, new: &str) -> ServerMessage {
        let new = new.trim();
        if new.is_empty() {
            return ServerMessage::RotateTokenRes {
                ok: false,
                error: Some("new token must not be empty".into()),
            };
        }

        let mut current = self.auth_token.write();
        let authorised = match current.as_deref() {
            Some(expected) => tokens_match(old, expected),
            None => old.is_empty(),
        };
        if !authorised {
            tracing::warn!("Token rotation rejected");
            return ServerMessage::RotateTokenRes {
                ok: false,
                error: Some(ErrorCode::Unauthorized.to_string()),
            };
        }

        *current = Some(new.to_string());
        tracing::info!("Auth token rotated");
        ServerMessage::RotateTokenRes { ok: true, error: None }
    }

    // ------------------------------------------------------------------
    // Simple operations
    // ------------------------------------------------------------------

    /// `list_tools_res`
    pub fn list_tools(&self) -> ServerMessage {
        ServerMessage::ListToolsRes {
            tools: self.tools.descriptors(),
        }
    }

    /// `health_res`
    pub fn health(&self) -> ServerMessage {
        ServerMessage::HealthRes {
            sessions: self.sessions.count(),
            inflight: self.admission.inflight(),
            capacity: self.admission.capacity(),
            uptime_secs: self.uptime().as_secs_f64(),
        }
    }

    // ------------------------------------------------------------------
    // call_tool
    // ------------------------------------------------------------------

    /// Provider whose pool gates a call, if one can be resolved
    fn resolve_provider(&self, arguments: &Value) -> Option<String> {
        let model = arguments
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.config.default_model);

        let registry = self.router.registry();
        let provider = registry.provider_type_for_model(model).or_else(|| {
            let sentinel = ["", "auto", "default"].contains(&model.trim().to_lowercase().as_str());
            if sentinel {
                self.router.choose_model(model).provider()
            } else {
                None
            }
        });
        provider.map(|p| p.as_str().to_string())
    }

    /// Semantic identity of a call
    ///
    /// Tools listed in `no_coalesce` get a unique key per call.
    pub fn call_key(&self, tool: &str, arguments: &Value) -> String {
        if self.config.no_coalesce.iter().any(|t| t == tool) {
            return format!("unique:{}", Uuid::new_v4());
        }
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(arguments).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Run one `call_tool`
    ///
    /// Acks and progress go out through `replies`; the terminal
    /// `call_tool_res` is returned. `None` means nothing terminal is owed
    /// (the request is a duplicate of one still running).
    pub async fn call_tool(
        &self,
        session: &Arc<Session>,
        request: CallToolRequest,
        replies: &mpsc::Sender<ServerMessage>,
    ) -> Option<ServerMessage> {
        let request_id = request
            .request_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let name = request.name;

        let Some(tool) = self.tools.get(&name) else {
            return Some(ServerMessage::call_error(
                request_id,
                ErrorBody::new(ErrorCode::ToolNotFound, format!("unknown tool '{name}'")),
            ));
        };

        let arguments = match request.arguments {
            Value::Null => Value::Object(Map::new()),
            object @ Value::Object(_) => object,
            _ => {
                return Some(ServerMessage::call_error(
                    request_id,
                    ErrorBody::new(ErrorCode::InvalidRequest, "'arguments' must be an object"),
                ))
            }
        };

        let provider = self.resolve_provider(&arguments);

        let request_cache_key = format!("req:{request_id}");
        if let Some(cached) = self.results.get(&request_cache_key) {
            tracing::debug!(request_id = %request_id, "Replaying cached result");
            return Some(cached);
        }

        let call_key = self.call_key(&name, &arguments);
        let key_cache_key = format!("key:{call_key}");
        if let Some(cached) = self.results.get(&key_cache_key) {
            tracing::debug!(request_id = %request_id, tool = %name, "Replaying result for identical call");
            return Some(cached.readdressed(&request_id));
        }

        let wait_deadline = tokio::time::Instant::now() + secs(self.config.call_timeout_secs);
        let guard = loop {
            match self.inflight.claim(&request_id, &call_key) {
                Claim::DuplicateRequest => {
                    let _ = replies
                        .send(ServerMessage::Progress {
                            request_id: request_id.clone(),
                            name: name.clone(),
                            t: 0.0,
                            note: Some("still processing".into()),
                        })
                        .await;
                    return None;
                }
                Claim::Follower { mut done, guard } => {
                    tracing::debug!(request_id = %request_id, tool = %name, "Awaiting identical in-flight call");
                    let _ = tokio::time::timeout_at(wait_deadline, done.changed()).await;
                    drop(guard);
                    if let Some(cached) = self.results.get(&key_cache_key) {
                        return Some(cached.readdressed(&request_id));
                    }
                    if tokio::time::Instant::now() >= wait_deadline {
                        return Some(ServerMessage::call_error(
                            request_id,
                            ErrorBody::new(ErrorCode::Timeout, "timed out waiting for identical call"),
                        ));
                    }
                    // Leader failed or timed out; contend again
                }
                Claim::Leader(guard) => break guard,
            }
        };

        let ticket = match self.admission.admit(provider.as_deref(), session.permits()) {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::warn!(request_id = %request_id, tool = %name, reason = %e, "Call rejected");
                return Some(ServerMessage::call_error(
                    request_id,
                    ErrorBody::new(ErrorCode::OverCapacity, e.to_string()),
                ));
            }
        };

        let use_websearch = arguments
            .get("use_websearch")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let deadline = self.config.deadline_for(&name, use_websearch);

        let _ = replies
            .send(ServerMessage::CallToolAck {
                request_id: request_id.clone(),
                accepted: true,
                timeout: deadline.as_secs_f64(),
                name: name.clone(),
            })
            .await;

        tracing::info!(
            request_id = %request_id,
            session_id = %session.id(),
            tool = %name,
            provider = provider.as_deref().unwrap_or("-"),
            "Call started"
        );

        let orchestrator = self.orchestrator.clone().filter(|o| o.handles(&name));
        let task_name = name.clone();
        let mut handle = tokio::spawn(async move {
            match orchestrator {
                Some(orchestrator) => {
                    let outcome = orchestrator.execute(&task_name, arguments).await;
                    match (outcome.succeeded, outcome.rejected) {
                        (true, _) => Finished::Value(outcome.value),
                        (false, Some(message)) => Finished::Failed(ToolError::InvalidArguments(message)),
                        (false, None) => Finished::Exhausted(outcome.value),
                    }
                }
                None => match tool.execute(arguments).await {
                    Ok(value) => Finished::Value(value),
                    Err(error) => Finished::Failed(error),
                },
            }
        });

        let _abort = AbortOnDrop(handle.abort_handle());

        let started = tokio::time::Instant::now();
        let interval = secs(self.config.progress_interval_secs);
        let mut ticker = tokio::time::interval_at(started + interval, interval);
        let sleep = tokio::time::sleep_until(started + deadline);
        tokio::pin!(sleep);
        let mut escalation = Escalation::Normal;

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break Some(joined),
                _ = ticker.tick() => {
                    let elapsed = started.elapsed().as_secs_f64();
                    let note = self.progress_note(&mut escalation, &request_id, &name, elapsed);
                    let _ = replies
                        .send(ServerMessage::Progress {
                            request_id: request_id.clone(),
                            name: name.clone(),
                            t: elapsed,
                            note: Some(note),
                        })
                        .await;
                }
                () = &mut sleep => {
                    handle.abort();
                    break None;
                }
            }
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let response = match joined {
            None => {
                tracing::warn!(request_id = %request_id, tool = %name, elapsed_ms, "Call timed out");
                ServerMessage::call_error(
                    &request_id,
                    ErrorBody::new(
                        ErrorCode::Timeout,
                        format!("'{name}' exceeded its {:.0}s deadline", deadline.as_secs_f64()),
                    ),
                )
            }
            Some(Err(join_error)) => {
                tracing::error!(request_id = %request_id, tool = %name, error = %join_error, "Tool task failed");
                ServerMessage::call_error(&request_id, ErrorBody::new(ErrorCode::ExecError, "tool task failed"))
            }
            Some(Ok(Finished::Failed(error))) => {
                let code = error.code();
                tracing::warn!(request_id = %request_id, tool = %name, code = %code, error = %error, elapsed_ms, "Call failed");
                ServerMessage::call_error(&request_id, ErrorBody::new(code, error.to_string()))
            }
            Some(Ok(Finished::Exhausted(envelope))) => {
                let message = envelope
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("fallback chain exhausted")
                    .to_string();
                tracing::warn!(request_id = %request_id, tool = %name, elapsed_ms, "Fallback chain exhausted");
                ServerMessage::CallToolRes {
                    request_id: request_id.clone(),
                    outputs: Some(normalize_outputs(envelope)),
                    error: Some(ErrorBody::new(ErrorCode::Timeout, message)),
                }
            }
            Some(Ok(Finished::Value(value))) => {
                tracing::info!(request_id = %request_id, tool = %name, elapsed_ms, "Call completed");
                let response = ServerMessage::outputs(&request_id, normalize_outputs(value));
                self.results.insert(request_cache_key, response.clone());
                self.results.insert(key_cache_key, response.clone());
                response
            }
        };

        // Results are visible before followers wake
        drop(ticket);
        drop(guard);
        Some(response)
    }

    fn progress_note(&self, escalation: &mut Escalation, request_id: &str, tool: &str, elapsed: f64) -> String {
        if elapsed >= self.config.slow_error_secs {
            if *escalation != Escalation::Error {
                tracing::error!(request_id = %request_id, tool = %tool, elapsed_secs = elapsed, "Call running far longer than expected");
                *escalation = Escalation::Error;
            }
            format!("still running after {elapsed:.0}s (very slow)")
        } else if elapsed >= self.config.slow_warn_secs {
            if *escalation == Escalation::Normal {
                tracing::warn!(request_id = %request_id, tool = %tool, elapsed_secs = elapsed, "Call running slowly");
                *escalation = Escalation::Warn;
            }
            format!("still running after {elapsed:.0}s (slow)")
        } else {
            format!("running for {elapsed:.0}s")
        }
    }
}

/// Stops the tool task if `call_tool` itself is dropped mid-call
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Finished {
    Value(Value),
    Failed(ToolError),
    Exhausted(Value),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Escalation {
    Normal,
    Warn,
    Error,
}

fn tokens_match(given: &str, expected: &str) -> bool {
    Sha256::digest(given.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// JSON with object keys sorted at every level
fn canonical_json(value: &Value) -> String {
    fn canonical(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut sorted = Map::new();
                for key in keys {
                    sorted.insert(key.clone(), canonical(&map[key.as_str()]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
            other => other.clone(),
        }
    }
    canonical(value).to_string()
}
