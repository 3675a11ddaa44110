//! Gateway Core - Concurrent Tool Dispatch and Provider Routing
//!
//! This crate is the engine of ai-gateway: a WebSocket tool server that
//! admits, de-duplicates and supervises tool calls, and a routing layer that
//! picks a model, tracks provider health and falls back when a provider
//! misbehaves. The daemon binary only wires these pieces together.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        WebSocket clients                         │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ hello / list_tools / call_tool
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │  server                       │                                  │
//! │  ┌────────────────┐   ┌───────┴────────┐   ┌──────────────────┐  │
//! │  │ GatewayServer  │──▶│   Dispatcher   │──▶│ Admission        │  │
//! │  │ (accept loop)  │   │ (call_tool)    │   │ global→prov→sess │  │
//! │  └────────────────┘   └───────┬────────┘   └──────────────────┘  │
//! │          InFlightTable ───────┤─────── ResultCache               │
//! └───────────────────────────────┼──────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │  tools / routing              ▼                                  │
//! │  ToolRegistry ──▶ FallbackOrchestrator ──▶ RouterService         │
//! │                                               │                  │
//! │                 CircuitBreakers ◀── ProviderRegistry ──▶ Telemetry│
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`config`]: TOML + environment configuration
//! - [`error`]: Wire error codes
//! - [`process`]: PID lock and health snapshot
//! - [`routing`]: Providers, registry, router, circuits, fallback chains
//! - [`server`]: WebSocket server, dispatcher, admission, de-duplication
//! - [`session`]: Per-connection sessions
//! - [`tools`]: Tool contract and built-in tools

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod process;
pub mod routing;
pub mod server;
pub mod session;
pub mod tools;

// Re-exports for convenience
pub use config::{load_config, load_config_from_path, ConfigError, ConfigOverrides, GatewayConfig};
pub use error::{ErrorBody, ErrorCode};
pub use process::{spawn_snapshot_task, HealthSnapshot, LivenessProbe, LockError, ProcessLock};
pub use routing::{FallbackOrchestrator, ProviderRegistry, RouteDecision, RouterService};
pub use server::{ClientMessage, ConnectionId, Dispatcher, GatewayServer, ServerMessage};
pub use session::{Session, SessionManager};
pub use tools::{Tool, ToolError, ToolRegistry};
