//! Fault injection: permits and in-flight state must balance no matter how
//! calls end

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use gateway_core::config::{GatewayConfig, RoutingConfig};
use gateway_core::server::{CallToolRequest, ServerMessage};
use gateway_core::{Dispatcher, ErrorCode, ProviderRegistry, RouterService, Tool, ToolError, ToolRegistry};

/// Misbehaves according to `arguments.mode`
struct Chaos;

#[async_trait]
impl Tool for Chaos {
    fn name(&self) -> &str {
        "chaos"
    }

    fn description(&self) -> &str {
        "fails in assorted ways"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let delay = arguments.get("delay_ms").and_then(Value::as_u64).unwrap_or(5);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        match arguments.get("mode").and_then(Value::as_str).unwrap_or("ok") {
            "error" => Err(ToolError::Failed("injected".into())),
            "panic" => panic!("injected panic"),
            "hang" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
            _ => Ok(json!("fine")),
        }
    }
}

fn dispatcher(config: &GatewayConfig) -> Arc<Dispatcher> {
    let routing = RoutingConfig {
        resilience: false,
        ..RoutingConfig::default()
    };
    let router = Arc::new(RouterService::new(Arc::new(ProviderRegistry::new(&routing)), &routing));
    let tools = Arc::new(ToolRegistry::new().with(Arc::new(Chaos)));
    Arc::new(Dispatcher::new(config, tools, router))
}

fn request(id: usize, mode: &str) -> CallToolRequest {
    CallToolRequest {
        request_id: Some(format!("req-{id}")),
        name: "chaos".into(),
        arguments: json!({"mode": mode, "n": id}),
    }
}

fn error_code(response: &ServerMessage) -> Option<ErrorCode> {
    match response {
        ServerMessage::CallToolRes { error, .. } => error.as_ref().map(|e| e.code),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn permits_balance_under_mixed_failures() {
    let mut config = GatewayConfig::default();
    config.dispatch.call_timeout_secs = 0.3;
    config.dispatch.progress_interval_secs = 0.1;
    config.dispatch.global_max_inflight = 8;
    config.dispatch.session_max_inflight = 3;
    let dispatcher = dispatcher(&config);

    let sessions: Vec<_> = (0..4).map(|_| dispatcher.sessions().create()).collect();
    let (tx, mut rx) = mpsc::channel(1024);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let modes = ["ok", "error", "panic", "hang"];
    let mut tasks = Vec::new();
    for i in 0..64 {
        let dispatcher = Arc::clone(&dispatcher);
        let session = Arc::clone(&sessions[i % sessions.len()]);
        let tx = tx.clone();
        let mode = modes[i % modes.len()];
        tasks.push(tokio::spawn(async move {
            dispatcher.call_tool(&session, request(i, mode), &tx).await
        }));
    }

    let mut codes = Vec::new();
    for task in tasks {
        let response = task.await.unwrap().expect("every call gets a terminal response");
        codes.push(error_code(&response));
    }

    // Every failure mode surfaced, overload included
    assert!(codes.contains(&None));
    assert!(codes.contains(&Some(ErrorCode::ExecError)));
    assert!(codes.contains(&Some(ErrorCode::Timeout)));
    assert!(codes.contains(&Some(ErrorCode::OverCapacity)));

    assert_eq!(dispatcher.admission().inflight(), 0);
    let global = dispatcher.admission().global_stats();
    assert_eq!(global.acquired, global.released);
    for session in &sessions {
        assert_eq!(session.inflight(), 0);
    }
}

#[tokio::test]
async fn cancelled_call_releases_permits_and_key() {
    let config = GatewayConfig::default();
    let dispatcher = dispatcher(&config);
    let session = dispatcher.sessions().create();
    let (tx, _rx) = mpsc::channel(64);

    let running = {
        let dispatcher = Arc::clone(&dispatcher);
        let session = Arc::clone(&session);
        let tx = tx.clone();
        tokio::spawn(async move { dispatcher.call_tool(&session, request(1, "hang"), &tx).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.admission().inflight(), 1);

    running.abort();
    let _ = running.await;
    assert_eq!(dispatcher.admission().inflight(), 0);
    assert_eq!(session.inflight(), 0);

    // The request id is free again
    let mut retry = request(1, "hang");
    retry.arguments["mode"] = json!("ok");
    let response = dispatcher.call_tool(&session, retry, &tx).await.unwrap();
    assert_eq!(error_code(&response), None);
}

#[tokio::test]
async fn closed_session_does_not_leak_permits() {
    let config = GatewayConfig::default();
    let dispatcher = dispatcher(&config);
    let session = dispatcher.sessions().create();
    let (tx, rx) = mpsc::channel(1);
    // Receiver gone: acks and progress go nowhere
    drop(rx);

    let response = dispatcher.call_tool(&session, request(7, "ok"), &tx).await.unwrap();
    assert_eq!(error_code(&response), None);

    dispatcher.sessions().remove(session.id());
    assert!(session.is_closed());
    assert_eq!(dispatcher.admission().inflight(), 0);
    assert_eq!(dispatcher.sessions().count(), 0);
}
