//! Routing scenarios: registry + router + built-in tools + fallback chains

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use gateway_core::config::{FallbackConfig, GatewayConfig, RoutingConfig};
use gateway_core::routing::{
    AttemptOutcome, CircuitConfig, CircuitState, CostTier, GenerateRequest, ModelCapabilities, ModelResponse,
    Provider, ProviderError, ProviderFactory, ProviderRegistry, ProviderType, RetryConfig, RouteHint, RouteReason,
    RouterService, Usage,
};
use gateway_core::server::{CallToolRequest, ServerMessage};
use gateway_core::{Dispatcher, ErrorCode, FallbackOrchestrator, ToolRegistry};

// ============================================================================
// Stub provider
// ============================================================================

struct Stub {
    provider_type: ProviderType,
    models: Vec<ModelCapabilities>,
    healthy: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Provider for Stub {
    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    fn capabilities(&self, model_name: &str) -> Option<ModelCapabilities> {
        self.models.iter().find(|m| m.matches(model_name)).cloned()
    }

    fn list_models(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }

    async fn generate_content(&self, request: &GenerateRequest) -> Result<ModelResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.healthy {
            return Err(ProviderError::Network("connection reset".into()));
        }
        Ok(ModelResponse {
            content: format!("{} says hi", request.model_name),
            model_name: request.model_name.clone(),
            provider: self.provider_type,
            usage: Usage {
                input_tokens: 3,
                output_tokens: 3,
            },
        })
    }
}

fn stub(provider_type: ProviderType, models: Vec<ModelCapabilities>, healthy: bool, calls: &Arc<AtomicUsize>) -> ProviderFactory {
    let calls = Arc::clone(calls);
    Arc::new(move || {
        Ok(Arc::new(Stub {
            provider_type,
            models: models.clone(),
            healthy,
            calls: Arc::clone(&calls),
        }) as Arc<dyn Provider>)
    })
}

struct World {
    router: Arc<RouterService>,
    xai_calls: Arc<AtomicUsize>,
    openrouter_calls: Arc<AtomicUsize>,
}

/// xAI serves `grok-fast` (unhealthy unless `xai_healthy`), OpenRouter
/// serves the free `llama:free` and the vision-capable `vision-pro`
fn world(routing: RoutingConfig, xai_healthy: bool, openrouter_healthy: bool) -> World {
    let registry = Arc::new(ProviderRegistry::new(&routing));
    let xai_calls = Arc::new(AtomicUsize::new(0));
    let openrouter_calls = Arc::new(AtomicUsize::new(0));

    registry.register(
        ProviderType::XAi,
        stub(
            ProviderType::XAi,
            vec![ModelCapabilities::new("grok-fast", 128_000, CostTier::Low).with_aliases(&["grok"])],
            xai_healthy,
            &xai_calls,
        ),
    );
    registry.register(
        ProviderType::OpenRouter,
        stub(
            ProviderType::OpenRouter,
            vec![
                ModelCapabilities::new("llama:free", 32_000, CostTier::Free),
                ModelCapabilities::new("vision-pro", 1_000_000, CostTier::High).with_images(),
            ],
            openrouter_healthy,
            &openrouter_calls,
        ),
    );

    World {
        router: Arc::new(RouterService::new(registry, &routing)),
        xai_calls,
        openrouter_calls,
    }
}

fn plain_routing() -> RoutingConfig {
    RoutingConfig {
        resilience: false,
        skip_open_circuits: false,
        ..RoutingConfig::default()
    }
}

fn fast_fallback() -> FallbackConfig {
    FallbackConfig {
        primary_retry_backoff_ms: 1,
        attempt_timeout_secs: 2.0,
        ..FallbackConfig::default()
    }
}

fn orchestrator(world: &World, config: FallbackConfig) -> FallbackOrchestrator {
    let tools = Arc::new(ToolRegistry::builtin(&world.router));
    FallbackOrchestrator::new(tools, Arc::clone(&world.router), config)
}

// ============================================================================
// Model selection
// ============================================================================

#[test]
fn auto_uses_configured_fast_default() {
    let routing = RoutingConfig {
        fast_model: Some("llama:free".into()),
        ..plain_routing()
    };
    let world = world(routing, true, true);

    let decision = world.router.choose_model("auto");
    assert_eq!(decision.chosen(), Some("llama:free"));
    assert_eq!(decision.reason(), RouteReason::AutoDefaultFast);
    assert_eq!(decision.provider(), Some(ProviderType::OpenRouter));
}

#[test]
fn explicit_alias_resolves_to_its_provider() {
    let world = world(plain_routing(), true, true);
    let decision = world.router.choose_model("GROK");
    assert_eq!(decision.reason(), RouteReason::Explicit);
    assert_eq!(decision.provider(), Some(ProviderType::XAi));
}

#[test]
fn unknown_model_falls_back_to_first_available() {
    let world = world(plain_routing(), true, true);

    let decision = world.router.choose_model("gpt-99");
    assert_eq!(decision.reason(), RouteReason::AutoFirstAvailable);
    assert_eq!(decision.chosen(), Some("grok-fast"));
    assert_eq!(decision.meta().get("unresolved"), Some(&json!("gpt-99")));
}

#[test]
fn vision_hint_picks_an_image_capable_model() {
    let world = world(plain_routing(), true, true);
    let decision = world.router.choose_model_with_hint("auto", Some(RouteHint::Vision));
    assert_eq!(decision.chosen(), Some("vision-pro"));
    assert_eq!(decision.reason(), RouteReason::HintVision);
}

#[test]
fn free_models_lead_candidates_when_preferred() {
    let routing = RoutingConfig {
        prefer_free: true,
        ..plain_routing()
    };
    let world = world(routing, true, true);
    let candidates = world.router.fallback_candidates(None, &["grok-fast".to_string()]);
    assert_eq!(candidates, vec!["llama:free".to_string(), "vision-pro".to_string()]);
}

#[tokio::test]
async fn empty_registry_reports_no_model() {
    let routing = plain_routing();
    let router = Arc::new(RouterService::new(Arc::new(ProviderRegistry::new(&routing)), &routing));
    assert_eq!(router.choose_model("auto").reason(), RouteReason::NoModelsAvailable);

    let tools = ToolRegistry::builtin(&router);
    let chat = tools.get("chat").unwrap();
    let err = chat.execute(json!({"prompt": "hello"})).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ExecError);
}

#[tokio::test]
async fn preflight_probes_each_default() {
    let routing = RoutingConfig {
        fast_model: Some("grok-fast".into()),
        long_context_model: Some("llama:free".into()),
        ..plain_routing()
    };
    let world = world(routing, false, true);

    let results = world.router.preflight().await;
    let outcomes: Vec<(&str, bool)> = results.iter().map(|r| (r.model.as_str(), r.ok)).collect();
    assert_eq!(outcomes, vec![("grok-fast", false), ("llama:free", true)]);
}

// ============================================================================
// Fallback chains
// ============================================================================

#[tokio::test]
async fn failing_primary_falls_back_to_next_candidate() {
    let world = world(plain_routing(), false, true);
    let orchestrator = orchestrator(&world, fast_fallback());

    let outcome = orchestrator
        .execute("chat", json!({"prompt": "hi", "model": "grok-fast"}))
        .await;
    assert!(outcome.succeeded);
    assert!(!outcome.degraded);
    assert_eq!(outcome.value["content"], "llama:free says hi");

    let outcomes: Vec<AttemptOutcome> = outcome.attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Error, AttemptOutcome::Error, AttemptOutcome::Success]
    );
    assert_eq!(world.xai_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn open_circuit_skips_provider() {
    let routing = RoutingConfig {
        circuit: CircuitConfig {
            failure_threshold: 1,
            reset_threshold: 1,
            cooloff_ms: 60_000,
        },
        ..plain_routing()
    };
    let world = world(routing, false, true);
    let orchestrator = orchestrator(&world, fast_fallback());

    let outcome = orchestrator
        .execute("chat", json!({"prompt": "hi", "model": "grok-fast"}))
        .await;
    let outcomes: Vec<AttemptOutcome> = outcome.attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Error, AttemptOutcome::Skipped, AttemptOutcome::Success]
    );
    assert_eq!(world.router.registry().circuits().state("xai"), CircuitState::Open);
    assert_eq!(world.xai_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn configured_chain_is_followed_in_order() {
    let world = world(plain_routing(), false, true);
    let mut config = fast_fallback();
    config
        .chains
        .insert("chat".into(), vec!["chat@vision-pro".into(), "chat@llama:free".into()]);
    let orchestrator = orchestrator(&world, config);

    let steps: Vec<String> = orchestrator
        .build_chain("chat", &json!({"model": "grok-fast"}))
        .iter()
        .map(|s| format!("{}@{}", s.tool, s.model.as_deref().unwrap_or("-")))
        .collect();
    assert_eq!(steps, vec!["chat@grok-fast", "chat@vision-pro", "chat@llama:free"]);

    let outcome = orchestrator
        .execute("chat", json!({"prompt": "hi", "model": "grok-fast"}))
        .await;
    assert_eq!(outcome.value["content"], "vision-pro says hi");
}

#[tokio::test]
async fn exhausted_chain_reports_timeout_with_attempts() {
    let world = world(plain_routing(), false, false);
    let tools = Arc::new(ToolRegistry::builtin(&world.router));
    let orchestrator = Arc::new(FallbackOrchestrator::new(
        Arc::clone(&tools),
        Arc::clone(&world.router),
        fast_fallback(),
    ));
    let dispatcher = Dispatcher::new(&GatewayConfig::default(), tools, Arc::clone(&world.router))
        .with_orchestrator(orchestrator);
    let session = dispatcher.sessions().create();
    let (tx, _rx) = mpsc::channel(16);

    let request = CallToolRequest {
        request_id: Some("r1".into()),
        name: "chat".into(),
        arguments: json!({"prompt": "hi", "model": "grok-fast"}),
    };
    let Some(ServerMessage::CallToolRes { outputs, error, .. }) = dispatcher.call_tool(&session, request, &tx).await
    else {
        panic!("expected call_tool_res");
    };

    assert_eq!(error.unwrap().code, ErrorCode::Timeout);
    let envelope: Value = serde_json::from_str(&outputs.unwrap()[0].text).unwrap();
    assert_eq!(envelope["code"], "FALLBACK_EXHAUSTED");
    assert!(envelope["attempts"].as_array().unwrap().len() >= 3);
    assert!(world.openrouter_calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn invalid_chat_arguments_report_input_and_leave_circuit_closed() {
    let routing = RoutingConfig {
        circuit: CircuitConfig {
            failure_threshold: 2,
            reset_threshold: 1,
            cooloff_ms: 60_000,
        },
        ..plain_routing()
    };
    let world = world(routing, true, true);
    let tools = Arc::new(ToolRegistry::builtin(&world.router));
    let orchestrator = Arc::new(FallbackOrchestrator::new(
        Arc::clone(&tools),
        Arc::clone(&world.router),
        fast_fallback(),
    ));
    let dispatcher = Dispatcher::new(&GatewayConfig::default(), tools, Arc::clone(&world.router))
        .with_orchestrator(orchestrator);
    let session = dispatcher.sessions().create();
    let (tx, _rx) = mpsc::channel(16);

    for i in 0..3 {
        let request = CallToolRequest {
            request_id: Some(format!("empty-{i}")),
            name: "chat".into(),
            arguments: json!({"prompt": "", "model": "grok-fast"}),
        };
        let Some(ServerMessage::CallToolRes { error: Some(error), .. }) =
            dispatcher.call_tool(&session, request, &tx).await
        else {
            panic!("expected an error response");
        };
        assert_eq!(error.code, ErrorCode::Input);
    }

    assert_eq!(world.router.registry().circuits().state("xai"), CircuitState::Closed);
    assert_eq!(world.xai_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resilient_registry_records_telemetry() {
    let routing = RoutingConfig {
        resilience: true,
        retry: RetryConfig::disabled(),
        ..plain_routing()
    };
    let world = world(routing, true, true);
    let registry = world.router.registry();

    registry
        .generate_content(&GenerateRequest::new("hi", "llama:free"))
        .await
        .unwrap();
    let summary = registry.telemetry().summary("llama:free").unwrap();
    assert_eq!(summary.success, 1);
    assert_eq!(registry.circuits().state("openrouter"), CircuitState::Closed);
}
