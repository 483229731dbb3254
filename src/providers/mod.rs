//! Provider registry and composite-score selector, with per-provider
//! circuit breaking.
//!
//! Scoring mirrors the system this was distilled from: a success-rate
//! base, a failure penalty, and latency/cost/recency/operation-affinity
//! bonuses, clamped to [0, 1]. Five consecutive failures opens the
//! breaker for a fixed cooldown, after which one probe request is allowed
//! through (half-open) before the breaker fully recloses.
//!
//! Selection runs a fixed chain of preference steps before ever falling
//! back to the composite score: an explicit `preferred_provider` wins if
//! it's in good standing, then a per-operation affinity configured on the
//! registry, then `cost_optimization` or `performance_priority` if the
//! caller asked for one, then the balanced composite score. If no enabled
//! provider survives the excluded/circuit filter, selection fails with the
//! last observed error from every configured provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::adapters::LlmAdapter;
use crate::models::{CircuitState, ProviderConfig, ProviderHealth, ProviderKind, ProviderStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FunctionTranslation,
    ImportExplanation,
    StringInterpretation,
    OverallSummary,
}

/// Preferences a caller may supply for one selection; all optional.
#[derive(Debug, Clone, Default)]
pub struct SelectionOptions {
    pub operation: Option<Operation>,
    pub excluded: Vec<String>,
    pub preferred_provider: Option<String>,
    pub cost_optimization: bool,
    pub performance_priority: bool,
}

impl SelectionOptions {
    pub fn for_operation(operation: Operation) -> Self {
        Self { operation: Some(operation), ..Default::default() }
    }
}

/// Raised when every enabled provider is excluded, circuit-open, or
/// otherwise unavailable. Carries the last error seen from each configured
/// provider so the caller can surface a useful 503.
#[derive(Debug, thiserror::Error)]
#[error("all {provider_count} provider(s) unavailable")]
pub struct AllProvidersUnavailable {
    pub provider_count: usize,
    pub last_errors: HashMap<String, String>,
}

pub struct ProviderEntry {
    pub config: ProviderConfig,
    pub adapter: Box<dyn LlmAdapter>,
    pub health: Mutex<ProviderHealth>,
    pub stats: Mutex<ProviderStats>,
}

pub struct ProviderRegistry {
    entries: HashMap<String, Arc<ProviderEntry>>,
    circuit_breaker_threshold: u32,
    circuit_breaker_timeout: Duration,
    operation_preferences: HashMap<Operation, String>,
}

impl ProviderRegistry {
    pub fn new(circuit_breaker_threshold: u32, circuit_breaker_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            circuit_breaker_threshold,
            circuit_breaker_timeout,
            operation_preferences: HashMap::new(),
        }
    }

    pub fn register(&mut self, config: ProviderConfig, adapter: Box<dyn LlmAdapter>) {
        let id = config.id.clone();
        let entry = Arc::new(ProviderEntry {
            health: Mutex::new(ProviderHealth::new(id.clone())),
            stats: Mutex::new(ProviderStats::default()),
            config,
            adapter,
        });
        self.entries.insert(id, entry);
    }

    /// Bias selection for a given operation kind toward a specific
    /// provider, ahead of the composite score but behind an explicit
    /// `preferred_provider` on the request.
    pub fn set_operation_preference(&mut self, operation: Operation, provider_id: String) {
        self.operation_preferences.insert(operation, provider_id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.get(id).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<ProviderEntry>> {
        self.entries.values()
    }

    /// Record a successful call, closing the circuit if it was half-open.
    pub fn record_success(&self, id: &str, latency_ms: u64, cost_usd: f64) {
        let Some(entry) = self.entries.get(id) else { return };
        let mut health = entry.health.lock();
        health.consecutive_failures = 0;
        health.circuit_state = CircuitState::Closed;
        health.last_success_at = Some(Utc::now());
        health.opened_at = None;
        drop(health);

        let mut stats = entry.stats.lock();
        stats.total_requests += 1;
        stats.successful_requests += 1;
        stats.avg_latency_ms = ema(stats.avg_latency_ms, latency_ms as f64, stats.total_requests);
        stats.last_used_at = Some(Utc::now());
        stats.total_cost_usd += cost_usd;
    }

    /// Record a failed call, opening the circuit once the threshold is hit.
    pub fn record_failure(&self, id: &str, error: impl Into<String>) {
        let Some(entry) = self.entries.get(id) else { return };
        let mut health = entry.health.lock();
        health.consecutive_failures += 1;
        health.last_failure_at = Some(Utc::now());
        health.last_error = Some(error.into());
        if health.consecutive_failures >= self.circuit_breaker_threshold {
            health.circuit_state = CircuitState::Open;
            health.opened_at = Some(Utc::now());
        }
        drop(health);

        let mut stats = entry.stats.lock();
        stats.total_requests += 1;
        stats.failed_requests += 1;
    }

    fn is_available(&self, entry: &ProviderEntry) -> bool {
        let mut health = entry.health.lock();
        match health.circuit_state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = match health.opened_at {
                    Some(t) => t,
                    None => return true,
                };
                let elapsed = Utc::now() - opened_at;
                if elapsed.to_std().unwrap_or_default() >= self.circuit_breaker_timeout {
                    health.circuit_state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Composite score in [0, 1]; higher is preferred.
    fn score(&self, entry: &ProviderEntry, operation: Option<Operation>) -> f64 {
        let stats = entry.stats.lock();
        let health = entry.health.lock();

        let base = stats.success_rate() / 100.0;
        let failure_penalty = (health.consecutive_failures as f64 * 0.1).min(0.3);
        let latency_bonus = (1000.0 - stats.avg_latency_ms).max(0.0) / 1000.0 * 0.2;

        let cost_per_token = entry.config.cost_per_token();
        let cost_bonus = (0.0001 - cost_per_token).max(0.0) / 0.0001 * 0.1;

        let hours_since_last_use = stats
            .last_used_at
            .map(|t| (Utc::now() - t).num_minutes() as f64 / 60.0)
            .unwrap_or(f64::MAX);
        let recency_bonus = (24.0 - hours_since_last_use).max(0.0) / 24.0 * 0.05;

        let operation_bonus = operation
            .map(|op| operation_affinity_bonus(entry.config.kind, op))
            .unwrap_or(0.0);

        (base - failure_penalty + latency_bonus + cost_bonus + recency_bonus + operation_bonus).clamp(0.0, 1.0)
    }

    fn candidates(&self, excluded: &[String]) -> Vec<Arc<ProviderEntry>> {
        self.entries
            .values()
            .filter(|e| e.config.enabled && !excluded.contains(&e.config.id) && self.is_available(e))
            .cloned()
            .collect()
    }

    fn unavailable_error(&self) -> AllProvidersUnavailable {
        let last_errors = self
            .entries
            .values()
            .filter_map(|e| e.health.lock().last_error.clone().map(|err| (e.config.id.clone(), err)))
            .collect();
        AllProvidersUnavailable { provider_count: self.entries.len(), last_errors }
    }

    /// Pick a provider following the preference chain: excluded/circuit
    /// filter, explicit `preferred_provider`, per-operation affinity,
    /// `cost_optimization`, `performance_priority`, then the balanced
    /// composite score.
    pub fn select(&self, opts: SelectionOptions) -> Result<Arc<ProviderEntry>, AllProvidersUnavailable> {
        let candidates = self.candidates(&opts.excluded);
        if candidates.is_empty() {
            return Err(self.unavailable_error());
        }

        if let Some(preferred) = &opts.preferred_provider {
            if let Some(entry) = candidates.iter().find(|e| &e.config.id == preferred) {
                return Ok(Arc::clone(entry));
            }
        }

        if let Some(operation) = opts.operation {
            if let Some(preferred_id) = self.operation_preferences.get(&operation) {
                if let Some(entry) = candidates.iter().find(|e| &e.config.id == preferred_id) {
                    return Ok(Arc::clone(entry));
                }
            }
        }

        if opts.cost_optimization {
            if let Some(entry) = candidates.iter().min_by(|a, b| {
                a.config
                    .cost_per_token()
                    .partial_cmp(&b.config.cost_per_token())
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) {
                return Ok(Arc::clone(entry));
            }
        }

        if opts.performance_priority {
            if let Some(entry) = candidates.iter().min_by(|a, b| {
                a.stats
                    .lock()
                    .avg_latency_ms
                    .partial_cmp(&b.stats.lock().avg_latency_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) {
                return Ok(Arc::clone(entry));
            }
        }

        candidates
            .iter()
            .max_by(|a, b| {
                self.score(a, opts.operation)
                    .partial_cmp(&self.score(b, opts.operation))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .ok_or_else(|| self.unavailable_error())
    }

    /// Ranked fallback chain excluding `exclude`, best first by composite
    /// score only — the preference chain only applies to the primary pick.
    pub fn fallback_chain(&self, exclude: &[String]) -> Vec<Arc<ProviderEntry>> {
        let mut candidates = self.candidates(exclude);
        candidates.sort_by(|a, b| {
            self.score(b, None)
                .partial_cmp(&self.score(a, None))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }
}

/// Exact per-operation scoring bonus, one decimal tier of affinity per
/// provider kind. Providers outside this table (e.g. a local Ollama
/// deployment) get no operation bonus.
fn operation_affinity_bonus(kind: ProviderKind, operation: Operation) -> f64 {
    use Operation::*;
    use ProviderKind::*;
    match (operation, kind) {
        (FunctionTranslation, Anthropic) => 0.10,
        (FunctionTranslation, OpenAi) => 0.05,
        (FunctionTranslation, Gemini) => 0.03,
        (ImportExplanation, Anthropic) => 0.08,
        (ImportExplanation, OpenAi) => 0.06,
        (ImportExplanation, Gemini) => 0.04,
        (StringInterpretation, Gemini) => 0.10,
        (StringInterpretation, OpenAi) => 0.06,
        (StringInterpretation, Anthropic) => 0.04,
        (OverallSummary, Anthropic) => 0.12,
        (OverallSummary, OpenAi) => 0.08,
        (OverallSummary, Gemini) => 0.06,
        _ => 0.0,
    }
}

fn ema(prev_avg: f64, sample: f64, count: u64) -> f64 {
    if count <= 1 {
        return sample;
    }
    // Weight recent samples more heavily than a plain running mean, same
    // intent as the system this was distilled from (recency matters more
    // for latency-based routing decisions than ancient history).
    const ALPHA: f64 = 0.2;
    prev_avg * (1.0 - ALPHA) + sample * ALPHA
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::openai::OpenAiAdapter;
    use crate::models::ProviderKind;

    fn cfg(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            kind: ProviderKind::OpenAi,
            display_name: id.to_string(),
            api_key: Some("test".into()),
            base_url: Some("https://example.invalid".into()),
            default_model: "gpt-4o-mini".into(),
            enabled: true,
            cost_per_1k_input: 0.001,
            cost_per_1k_output: 0.002,
            max_concurrent_requests: 4,
        }
    }

    #[test]
    fn circuit_opens_after_threshold_failures() {
        let mut registry = ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(cfg("p1"), Box::new(OpenAiAdapter::new("https://example.invalid")));

        for _ in 0..5 {
            registry.record_failure("p1", "timeout");
        }

        let entry = registry.get("p1").unwrap();
        assert_eq!(entry.health.lock().circuit_state, CircuitState::Open);

        let err = registry.select(SelectionOptions::default()).unwrap_err();
        assert_eq!(err.provider_count, 1);
        assert_eq!(err.last_errors.get("p1").map(String::as_str), Some("timeout"));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut registry = ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(cfg("p1"), Box::new(OpenAiAdapter::new("https://example.invalid")));

        registry.record_failure("p1", "boom");
        registry.record_failure("p1", "boom again");
        registry.record_success("p1", 100, 0.001);

        let entry = registry.get("p1").unwrap();
        assert_eq!(entry.health.lock().consecutive_failures, 0);
        assert_eq!(entry.health.lock().circuit_state, CircuitState::Closed);
    }

    #[test]
    fn selects_among_enabled_providers() {
        let mut registry = ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(cfg("p1"), Box::new(OpenAiAdapter::new("https://example.invalid")));
        registry.register(cfg("p2"), Box::new(OpenAiAdapter::new("https://example.invalid")));

        let selected = registry.select(SelectionOptions::default());
        assert!(selected.is_ok());
    }

    #[test]
    fn preferred_provider_wins_over_composite_score() {
        let mut registry = ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(cfg("p1"), Box::new(OpenAiAdapter::new("https://example.invalid")));
        registry.register(cfg("p2"), Box::new(OpenAiAdapter::new("https://example.invalid")));

        let opts = SelectionOptions { preferred_provider: Some("p2".into()), ..Default::default() };
        let selected = registry.select(opts).unwrap();
        assert_eq!(selected.config.id, "p2");
    }

    #[test]
    fn operation_preference_is_consulted_before_composite_score() {
        let mut registry = ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(cfg("p1"), Box::new(OpenAiAdapter::new("https://example.invalid")));
        registry.register(cfg("p2"), Box::new(OpenAiAdapter::new("https://example.invalid")));
        registry.set_operation_preference(Operation::OverallSummary, "p1".into());

        let selected = registry.select(SelectionOptions::for_operation(Operation::OverallSummary)).unwrap();
        assert_eq!(selected.config.id, "p1");
    }

    #[test]
    fn excluded_providers_are_never_selected() {
        let mut registry = ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(cfg("p1"), Box::new(OpenAiAdapter::new("https://example.invalid")));

        let opts = SelectionOptions { excluded: vec!["p1".into()], ..Default::default() };
        assert!(registry.select(opts).is_err());
    }
}
