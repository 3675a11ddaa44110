//! Provider Routing
//!
//! Decides which backend serves a logical model name, wraps every provider
//! call in retry and circuit-breaking, and degrades through fallback chains.
//!
//! # Architecture
//!
//! ```text
//! +---------------------+
//! | FallbackOrchestrator|  <-- chains of tool@model attempts
//! +----------+----------+
//!            |
//!            v
//! +---------------------+
//! |    RouterService    |  <-- "auto" -> concrete model, candidate order
//! +----------+----------+
//!            |
//!            v
//! +---------------------+
//! |  ProviderRegistry   |  <-- priority order, lazy instances, resolution cache
//! +----------+----------+
//!            |
//!            v
//! +---------------------+     +-----------------+   +-----------+
//! |  ResilientProvider  | --> | CircuitBreakers |   | Telemetry |
//! +----------+----------+     +-----------------+   +-----------+
//!            |
//!      +-----+-----+-----+-----+
//!      v     v     v     v     v
//!   openai  xai moonshot custom openrouter   <-- OpenAI-compatible backends
//! ```

pub mod backends;
pub mod circuit;
pub mod config;
pub mod fallback;
pub mod provider;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod telemetry;

pub use backends::OpenAiCompatibleProvider;
pub use circuit::{CircuitBreakers, CircuitSnapshot, CircuitState};
pub use config::*;
pub use fallback::*;
pub use provider::*;
pub use registry::{normalize_model_name, ProviderFactory, ProviderRegistry, Resolution};
pub use resilience::ResilientProvider;
pub use router::*;
pub use telemetry::{Telemetry, TelemetrySummary};
