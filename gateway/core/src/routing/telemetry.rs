//! Provider Telemetry
//!
//! Per-model success/failure counts, token sums and latency samples, kept in a
//! single table behind one mutex. The router reads it to order fallback
//! candidates by observed reliability.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use super::provider::Usage;

/// Latency samples retained per model
const MAX_LATENCY_SAMPLES: usize = 512;

/// Counters for one model
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct ModelTelemetry {
    success: u64,
    failure: u64,
    latency_ms: VecDeque<u64>,
    input_tokens: u64,
    output_tokens: u64,
}

impl ModelTelemetry {
    fn push_latency(&mut self, latency: Duration) {
        if self.latency_ms.len() == MAX_LATENCY_SAMPLES {
            self.latency_ms.pop_front();
        }
        self.latency_ms
            .push_back(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
    }
}

/// Aggregated view of one model
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetrySummary {
    /// Model name
    pub model: String,
    /// Successful calls
    pub success: u64,
    /// Failed calls
    pub failure: u64,
    /// Input tokens consumed
    pub input_tokens: u64,
    /// Output tokens produced
    pub output_tokens: u64,
    /// Median latency of retained samples
    pub p50_latency_ms: Option<u64>,
    /// Success ratio, `None` before the first call
    pub success_rate: Option<f64>,
}

/// Append-only telemetry table
#[derive(Default)]
pub struct Telemetry {
    models: Mutex<HashMap<String, ModelTelemetry>>,
}

impl Telemetry {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful call
    pub fn record_success(&self, model: &str, latency: Duration, usage: Usage) {
        let mut models = self.models.lock();
        let entry = models.entry(model.to_string()).or_default();
        entry.success += 1;
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.push_latency(latency);
    }

    /// Record a failed call
    pub fn record_failure(&self, model: &str, latency: Duration) {
        let mut models = self.models.lock();
        let entry = models.entry(model.to_string()).or_default();
        entry.failure += 1;
        entry.push_latency(latency);
    }

    /// Summary for one model
    pub fn summary(&self, model: &str) -> Option<TelemetrySummary> {
        self.models.lock().get(model).map(|t| summarize(model, t))
    }

    /// Summaries of every model, sorted by name
    pub fn summaries(&self) -> Vec<TelemetrySummary> {
        let models = self.models.lock();
        let mut all: Vec<_> = models.iter().map(|(m, t)| summarize(m, t)).collect();
        all.sort_by(|a, b| a.model.cmp(&b.model));
        all
    }

    /// Success ratio for `model`, `None` when never called
    pub fn success_rate(&self, model: &str) -> Option<f64> {
        self.summary(model).and_then(|s| s.success_rate)
    }

    /// Drop everything
    pub fn reset(&self) {
        self.models.lock().clear();
    }
}

fn summarize(model: &str, t: &ModelTelemetry) -> TelemetrySummary {
    let total = t.success + t.failure;
    let p50_latency_ms = if t.latency_ms.is_empty() {
        None
    } else {
        let mut sorted: Vec<u64> = t.latency_ms.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    };

    TelemetrySummary {
        model: model.to_string(),
        success: t.success,
        failure: t.failure,
        input_tokens: t.input_tokens,
        output_tokens: t.output_tokens,
        p50_latency_ms,
        success_rate: (total > 0).then(|| t.success as f64 / total as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_records_accumulate() {
        let telemetry = Telemetry::new();
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 4,
        };
        telemetry.record_success("gpt-5", Duration::from_millis(100), usage);
        telemetry.record_success("gpt-5", Duration::from_millis(300), usage);
        telemetry.record_failure("gpt-5", Duration::from_millis(200));

        let summary = telemetry.summary("gpt-5").unwrap();
        assert_eq!(summary.success, 2);
        assert_eq!(summary.failure, 1);
        assert_eq!(summary.input_tokens, 20);
        assert_eq!(summary.output_tokens, 8);
        assert_eq!(summary.p50_latency_ms, Some(200));
        assert!((summary.success_rate.unwrap() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_model_has_no_rate() {
        let telemetry = Telemetry::new();
        assert_eq!(telemetry.success_rate("nope"), None);
        assert!(telemetry.summaries().is_empty());
    }

    #[test]
    fn test_latency_samples_are_bounded() {
        let telemetry = Telemetry::new();
        for i in 0..(MAX_LATENCY_SAMPLES as u64 + 10) {
            telemetry.record_failure("m", Duration::from_millis(i));
        }
        let models = telemetry.models.lock();
        assert_eq!(models["m"].latency_ms.len(), MAX_LATENCY_SAMPLES);
        assert_eq!(models["m"].failure, MAX_LATENCY_SAMPLES as u64 + 10);
    }
}
