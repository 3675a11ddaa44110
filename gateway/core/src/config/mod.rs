//! TOML Configuration File Support
//!
//! Centralised configuration for the gateway, loaded from
//! `~/.config/ai-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments (applied by the daemon through [`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! auth_token = "s3cret"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8765
//! ping_interval_secs = 45
//!
//! [dispatch]
//! call_timeout_secs = 90
//! progress_interval_secs = 8
//! global_max_inflight = 24
//! provider_max_inflight = 5
//! session_max_inflight = 8
//! no_coalesce = ["version"]
//!
//! [dispatch.tool_timeouts_secs]
//! thinkdeep = 600
//!
//! [routing]
//! fast_model = "grok-code-fast-1"
//! long_context_model = "kimi-k2-0905-preview"
//! allowed_providers = ["xai", "moonshot"]
//!
//! [routing.circuit]
//! failure_threshold = 5
//!
//! [fallback.chains]
//! chat = ["chat@grok-4", "chat@kimi-k2"]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::{CircuitConfig, RetryConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Sections
// =============================================================================

/// Listener and connection settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Largest accepted frame
    pub max_message_bytes: usize,
    /// Interval between server pings
    pub ping_interval_secs: f64,
    /// Grace after a missed pong before the connection is dropped
    pub ping_timeout_secs: f64,
    /// Time allowed for the first `hello`
    pub hello_timeout_secs: f64,
    /// Concurrent connections accepted
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            max_message_bytes: 32 * 1024 * 1024,
            ping_interval_secs: 45.0,
            ping_timeout_secs: 30.0,
            hello_timeout_secs: 15.0,
            max_connections: 256,
        }
    }
}

/// `call_tool` admission, deadlines and caching
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Default hard deadline per call
    pub call_timeout_secs: f64,
    /// Interval between `progress` heartbeats
    pub progress_interval_secs: f64,
    /// Concurrent calls per session
    pub session_max_inflight: usize,
    /// Concurrent calls per provider
    pub provider_max_inflight: usize,
    /// Per-provider overrides of `provider_max_inflight`
    pub provider_limits: HashMap<String, usize>,
    /// Concurrent calls process-wide
    pub global_max_inflight: usize,
    /// How long completed results stay replayable
    pub result_ttl_secs: f64,
    /// Cached results kept before the oldest are evicted
    pub result_cache_max: usize,
    /// Tools never coalesced by call key
    pub no_coalesce: Vec<String>,
    /// Per-tool deadline overrides
    pub tool_timeouts_secs: HashMap<String, f64>,
    /// Deadline for calls with `use_websearch = true`
    pub websearch_timeout_secs: f64,
    /// Elapsed time after which progress notes turn to warnings
    pub slow_warn_secs: f64,
    /// Elapsed time after which progress notes turn to errors
    pub slow_error_secs: f64,
    /// Model assumed when a call names none
    pub default_model: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 90.0,
            progress_interval_secs: 8.0,
            session_max_inflight: 8,
            provider_max_inflight: 5,
            provider_limits: HashMap::new(),
            global_max_inflight: 24,
            result_ttl_secs: 180.0,
            result_cache_max: 1024,
            no_coalesce: Vec::new(),
            tool_timeouts_secs: HashMap::new(),
            websearch_timeout_secs: 300.0,
            slow_warn_secs: 60.0,
            slow_error_secs: 120.0,
            default_model: "auto".to_string(),
        }
    }
}

impl DispatchConfig {
    /// Cap for `provider`, honouring overrides
    pub fn provider_limit(&self, provider: &str) -> usize {
        self.provider_limits
            .get(provider)
            .copied()
            .unwrap_or(self.provider_max_inflight)
    }

    /// Hard deadline for one call of `tool`
    pub fn deadline_for(&self, tool: &str, use_websearch: bool) -> Duration {
        let mut secs_total = self.call_timeout_secs;
        if let Some(tool_secs) = self.tool_timeouts_secs.get(tool) {
            secs_total = secs_total.max(*tool_secs);
        }
        if use_websearch {
            secs_total = secs_total.max(self.websearch_timeout_secs);
        }
        secs(secs_total)
    }
}

/// PID lock and health snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// PID lock file; defaults under the runtime directory
    pub lock_path: Option<PathBuf>,
    /// Health snapshot file; defaults under the runtime directory
    pub health_path: Option<PathBuf>,
    /// Snapshot age after which a lock counts as abandoned
    pub stale_lock_secs: f64,
    /// Interval between snapshot writes
    pub snapshot_interval_secs: f64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            lock_path: None,
            health_path: None,
            stale_lock_secs: 60.0,
            snapshot_interval_secs: 10.0,
        }
    }
}

impl ProcessConfig {
    /// Lock file path, explicit or default
    pub fn lock_path(&self) -> PathBuf {
        self.lock_path
            .clone()
            .unwrap_or_else(|| default_runtime_dir().join("gateway.pid"))
    }

    /// Snapshot file path, explicit or default
    pub fn health_path(&self) -> PathBuf {
        self.health_path
            .clone()
            .unwrap_or_else(|| default_runtime_dir().join("health.json"))
    }
}

/// Model routing and provider resilience
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Preferred model for "auto"
    pub fast_model: Option<String>,
    /// Second choice for "auto", first for long-context hints
    pub long_context_model: Option<String>,
    /// First choice for vision hints
    pub vision_model: Option<String>,
    /// Probe the defaults at startup
    pub preflight: bool,
    /// Rank free-tier models first among fallback candidates
    pub prefer_free: bool,
    /// Restrict to these providers; empty allows all
    pub allowed_providers: Vec<String>,
    /// Wrap providers in retry + circuit breaking
    pub resilience: bool,
    /// Skip open-circuit providers while resolving models
    pub skip_open_circuits: bool,
    /// Retry policy
    pub retry: RetryConfig,
    /// Breaker thresholds
    pub circuit: CircuitConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fast_model: None,
            long_context_model: None,
            vision_model: None,
            preflight: false,
            prefer_free: false,
            allowed_providers: Vec::new(),
            resilience: true,
            skip_open_circuits: true,
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

/// Fallback chains
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Tool → ordered `tool` / `tool@model` alternatives
    pub chains: HashMap<String, Vec<String>>,
    /// Tools routed through the orchestrator even without a configured chain
    pub orchestrated_tools: Vec<String>,
    /// Budget per attempt
    pub attempt_timeout_secs: f64,
    /// Pause before the primary's retry
    pub primary_retry_backoff_ms: u64,
    /// Longest chain built from router candidates
    pub max_chain_len: usize,
    /// Bytes of each file inlined when degrading
    pub excerpt_bytes: usize,
    /// Directory that `files` arguments must resolve inside; `None` refuses every path
    pub file_root: Option<PathBuf>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            chains: HashMap::new(),
            orchestrated_tools: vec!["chat".to_string()],
            attempt_timeout_secs: 60.0,
            primary_retry_backoff_ms: 250,
            max_chain_len: 3,
            excerpt_bytes: 4000,
            file_root: None,
        }
    }
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Complete gateway configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Shared secret required in `hello`; `None` disables auth
    pub auth_token: Option<String>,
    /// Listener
    pub server: ServerConfig,
    /// Dispatcher
    pub dispatch: DispatchConfig,
    /// Process guards
    pub process: ProcessConfig,
    /// Routing
    pub routing: RoutingConfig,
    /// Fallback
    pub fallback: FallbackConfig,
    /// Path the configuration was read from
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
}

impl GatewayConfig {
    /// Check limits and timeouts
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let caps = [
            ("dispatch.global_max_inflight", self.dispatch.global_max_inflight),
            ("dispatch.provider_max_inflight", self.dispatch.provider_max_inflight),
            ("dispatch.session_max_inflight", self.dispatch.session_max_inflight),
            ("dispatch.result_cache_max", self.dispatch.result_cache_max),
            ("server.max_connections", self.server.max_connections),
            ("server.max_message_bytes", self.server.max_message_bytes),
            ("fallback.max_chain_len", self.fallback.max_chain_len),
        ];
        for (name, value) in caps {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be greater than 0")));
            }
        }
        for (provider, limit) in &self.dispatch.provider_limits {
            if *limit == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "dispatch.provider_limits.{provider} must be greater than 0"
                )));
            }
        }

        let timeouts = [
            ("dispatch.call_timeout_secs", self.dispatch.call_timeout_secs),
            ("dispatch.progress_interval_secs", self.dispatch.progress_interval_secs),
            ("dispatch.result_ttl_secs", self.dispatch.result_ttl_secs),
            ("server.ping_interval_secs", self.server.ping_interval_secs),
            ("server.ping_timeout_secs", self.server.ping_timeout_secs),
            ("server.hello_timeout_secs", self.server.hello_timeout_secs),
            ("process.stale_lock_secs", self.process.stale_lock_secs),
            ("process.snapshot_interval_secs", self.process.snapshot_interval_secs),
            ("fallback.attempt_timeout_secs", self.fallback.attempt_timeout_secs),
        ];
        for (name, value) in timeouts {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::ValidationError(format!("{name} must be a positive number")));
            }
            if value > MAX_SECS {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be at most {MAX_SECS} seconds"
                )));
            }
        }

        if self.dispatch.progress_interval_secs >= self.dispatch.call_timeout_secs {
            return Err(ConfigError::ValidationError(format!(
                "dispatch.progress_interval_secs ({}) must be shorter than dispatch.call_timeout_secs ({})",
                self.dispatch.progress_interval_secs, self.dispatch.call_timeout_secs
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/ai-gateway/gateway.toml`, typically
/// `~/.config/ai-gateway/gateway.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ai-gateway").join("gateway.toml"))
}

/// Per-user runtime directory for the lock and snapshot
///
/// `$XDG_RUNTIME_DIR/ai-gateway`, or `/tmp/ai-gateway-$UID`.
#[must_use]
pub fn default_runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("ai-gateway")
    } else {
        // SAFETY: getuid() is always safe to call and has no side effects
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/ai-gateway-{uid}"))
    }
}

/// Load from the default path plus the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load from `path` (a missing file is not an error) plus the environment
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_from_path(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let mut config = match path {
        Some(config_path) if config_path.exists() => {
            let content = std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                path: config_path.to_path_buf(),
                source: e,
            })?;
            let mut config: GatewayConfig = toml::from_str(&content)?;
            config.config_file_path = Some(config_path.to_path_buf());
            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
            config
        }
        Some(config_path) => {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
            GatewayConfig::default()
        }
        None => GatewayConfig::default(),
    };

    config.apply_env_from(|key| std::env::var(key).ok());
    Ok(config)
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparseable environment value");
            None
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparseable boolean");
            None
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl GatewayConfig {
    /// Apply `GATEWAY_*` overrides read through `lookup`
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        macro_rules! env_parse {
            ($key:literal => $field:expr) => {
                if let Some(raw) = lookup($key) {
                    if let Some(v) = parse_env($key, &raw) {
                        $field = v;
                    }
                }
            };
        }
        macro_rules! env_bool {
            ($key:literal => $field:expr) => {
                if let Some(raw) = lookup($key) {
                    if let Some(v) = parse_bool($key, &raw) {
                        $field = v;
                    }
                }
            };
        }
        macro_rules! env_string {
            ($key:literal => $field:expr) => {
                if let Some(raw) = lookup($key).filter(|s| !s.trim().is_empty()) {
                    $field = Some(raw.trim().to_string());
                }
            };
        }

        // Server
        if let Some(host) = lookup("GATEWAY_HOST").filter(|s| !s.trim().is_empty()) {
            self.server.host = host.trim().to_string();
        }
        env_parse!("GATEWAY_PORT" => self.server.port);
        env_parse!("GATEWAY_MAX_MSG_BYTES" => self.server.max_message_bytes);
        env_parse!("GATEWAY_PING_INTERVAL" => self.server.ping_interval_secs);
        env_parse!("GATEWAY_PING_TIMEOUT" => self.server.ping_timeout_secs);
        env_parse!("GATEWAY_HELLO_TIMEOUT" => self.server.hello_timeout_secs);
        env_parse!("GATEWAY_MAX_CONNECTIONS" => self.server.max_connections);

        // Dispatch
        env_parse!("GATEWAY_CALL_TIMEOUT" => self.dispatch.call_timeout_secs);
        env_parse!("GATEWAY_PROGRESS_INTERVAL" => self.dispatch.progress_interval_secs);
        env_parse!("GATEWAY_SESSION_MAX_INFLIGHT" => self.dispatch.session_max_inflight);
        env_parse!("GATEWAY_PROVIDER_MAX_INFLIGHT" => self.dispatch.provider_max_inflight);
        env_parse!("GATEWAY_GLOBAL_MAX_INFLIGHT" => self.dispatch.global_max_inflight);
        env_parse!("GATEWAY_RESULT_TTL" => self.dispatch.result_ttl_secs);
        env_parse!("GATEWAY_RESULT_CACHE_MAX" => self.dispatch.result_cache_max);
        env_parse!("GATEWAY_WEBSEARCH_TIMEOUT" => self.dispatch.websearch_timeout_secs);
        env_parse!("GATEWAY_SLOW_WARN_SECS" => self.dispatch.slow_warn_secs);
        env_parse!("GATEWAY_SLOW_ERROR_SECS" => self.dispatch.slow_error_secs);
        if let Some(raw) = lookup("GATEWAY_NO_COALESCE") {
            self.dispatch.no_coalesce = parse_list(&raw);
        }
        if let Some(model) = lookup("GATEWAY_DEFAULT_MODEL").filter(|s| !s.trim().is_empty()) {
            self.dispatch.default_model = model.trim().to_string();
        }
        env_string!("GATEWAY_AUTH_TOKEN" => self.auth_token);

        // Process
        env_parse!("GATEWAY_STALE_LOCK_SECS" => self.process.stale_lock_secs);
        env_parse!("GATEWAY_SNAPSHOT_INTERVAL" => self.process.snapshot_interval_secs);
        if let Some(raw) = lookup("GATEWAY_LOCK_PATH").filter(|s| !s.trim().is_empty()) {
            self.process.lock_path = Some(PathBuf::from(raw.trim()));
        }
        if let Some(raw) = lookup("GATEWAY_HEALTH_PATH").filter(|s| !s.trim().is_empty()) {
            self.process.health_path = Some(PathBuf::from(raw.trim()));
        }

        // Routing
        env_string!("GATEWAY_FAST_MODEL" => self.routing.fast_model);
        env_string!("GATEWAY_LONG_CONTEXT_MODEL" => self.routing.long_context_model);
        env_string!("GATEWAY_VISION_MODEL" => self.routing.vision_model);
        if let Some(raw) = lookup("GATEWAY_ALLOWED_PROVIDERS") {
            self.routing.allowed_providers = parse_list(&raw.to_lowercase());
        }
        env_bool!("GATEWAY_PREFLIGHT" => self.routing.preflight);
        env_bool!("GATEWAY_PREFER_FREE" => self.routing.prefer_free);
        env_bool!("GATEWAY_RESILIENCE" => self.routing.resilience);
        env_parse!("GATEWAY_RETRY_MAX" => self.routing.retry.max_retries);
        env_parse!("GATEWAY_RETRY_BASE_MS" => self.routing.retry.initial_backoff_ms);
        env_parse!("GATEWAY_RETRY_MAX_MS" => self.routing.retry.max_backoff_ms);
        env_parse!("GATEWAY_CIRCUIT_THRESHOLD" => self.routing.circuit.failure_threshold);
        env_parse!("GATEWAY_CIRCUIT_RESET" => self.routing.circuit.reset_threshold);
        if let Some(raw) = lookup("GATEWAY_CIRCUIT_COOLOFF_SECS") {
            if let Some(secs_value) = parse_env::<f64>("GATEWAY_CIRCUIT_COOLOFF_SECS", &raw) {
                self.routing.circuit.cooloff_ms = secs(secs_value).as_millis().try_into().unwrap_or(u64::MAX);
            }
        }

        // Fallback
        env_parse!("GATEWAY_FALLBACK_ATTEMPT_TIMEOUT" => self.fallback.attempt_timeout_secs);
        if let Some(raw) = lookup("GATEWAY_FILE_ROOT").filter(|s| !s.trim().is_empty()) {
            self.fallback.file_root = Some(PathBuf::from(raw.trim()));
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied last
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Bind address
    pub host: Option<String>,
    /// Bind port
    pub port: Option<u16>,
    /// Shared secret
    pub auth_token: Option<String>,
    /// PID lock file
    pub lock_path: Option<PathBuf>,
    /// Health snapshot file
    pub health_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Apply every set override to `config`
    pub fn apply(&self, config: &mut GatewayConfig) {
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(token) = &self.auth_token {
            config.auth_token = Some(token.clone());
        }
        if let Some(path) = &self.lock_path {
            config.process.lock_path = Some(path.clone());
        }
        if let Some(path) = &self.health_path {
            config.process.health_path = Some(path.clone());
        }
    }
}

/// Longest configurable duration, one year
pub const MAX_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Seconds to a `Duration`
///
/// Negative and NaN values become zero; anything above [`MAX_SECS`] is
/// clamped so deadlines computed from it never overflow an `Instant`.
#[must_use]
pub fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(value.min(MAX_SECS))
}

// =============================================================================
// Tests
// =============================================================================
