//! Core data model shared across components — jobs, fingerprints, cached
//! results, translation artifacts, provider configuration/health/stats,
//! rate limit state, and alert records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Job lifecycle ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    /// Terminal states never transition again except `Failed` → `Pending` via
    /// the explicit retry control operation, which bypasses the generic
    /// update path entirely.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub file_hash: String,
    pub config: AnalysisConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_pct: f32,
    pub progress_stage: Option<String>,
    pub retries: u32,
    pub max_retries: u32,
    pub callback_url: Option<String>,
    pub error: Option<String>,
    pub caller_id: String,
    pub result_cache_key: Option<String>,
    /// Set iff `status == processing`; cleared on every terminal transition
    /// and on retry.
    pub worker_id: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Job {
    pub fn new(file_hash: String, config: AnalysisConfig, caller_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            file_hash,
            config,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            progress_pct: 0.0,
            progress_stage: None,
            retries: 0,
            max_retries: 3,
            callback_url: None,
            error: None,
            caller_id,
            result_cache_key: None,
            worker_id: None,
            correlation_id: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisDepth {
    Quick,
    Standard,
    Comprehensive,
    Deep,
}

impl AnalysisDepth {
    /// TTL multiplier applied to the cache's base TTL for this depth.
    pub fn ttl_multiplier(self) -> f64 {
        match self {
            AnalysisDepth::Quick => 0.5,
            AnalysisDepth::Standard => 1.0,
            AnalysisDepth::Comprehensive => 2.0,
            AnalysisDepth::Deep => 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub decompilation_depth: AnalysisDepth,
    pub timeout_seconds: u64,
    pub extract_functions: bool,
    pub extract_imports: bool,
    pub extract_strings: bool,
    pub max_functions: usize,
    pub max_strings: usize,
    pub llm_provider: String,
    pub llm_model: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

// ── Fingerprinting / caching ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompilationFingerprint {
    pub file_hash: String,
    pub config_hash: String,
}

impl DecompilationFingerprint {
    pub fn cache_key(&self) -> String {
        format!("result:{}:{}", &self.file_hash[..self.file_hash.len().min(16)], self.config_hash)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub fingerprint: DecompilationFingerprint,
    pub schema_version: String,
    pub artifacts: Vec<TranslationArtifact>,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub tags: Vec<String>,
}

impl CachedResult {
    pub fn is_expired(&self) -> bool {
        let age = (Utc::now() - self.created_at).num_seconds().max(0) as u64;
        age > self.ttl_seconds
    }

    pub fn age_seconds(&self) -> u64 {
        (Utc::now() - self.created_at).num_seconds().max(0) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranslationArtifact {
    FunctionExplanation {
        function_name: String,
        address: String,
        explanation: String,
        confidence: f32,
    },
    ImportExplanation {
        import_name: String,
        library: String,
        explanation: String,
        confidence: f32,
    },
    StringInterpretation {
        value: String,
        interpretation: String,
        confidence: f32,
    },
    OverallSummary {
        summary: String,
        risk_indicators: Vec<String>,
        confidence: f32,
    },
}

// ── Provider model ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: String,
    pub enabled: bool,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    pub max_concurrent_requests: usize,
}

impl ProviderConfig {
    /// Blended per-token cost used by the composite scorer's cost bonus.
    pub fn cost_per_token(&self) -> f64 {
        (self.cost_per_1k_input + self.cost_per_1k_output) / 2.0 / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProviderHealth {
    pub fn new(provider_id: String) -> Self {
        Self {
            provider_id,
            circuit_state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub total_cost_usd: f64,
}

impl ProviderStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }
}

// ── Rate limiting ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitTier {
    Free,
    Standard,
    Premium,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitState {
    pub identifier: String,
    pub tier: RateLimitTier,
    pub minute_count: u64,
    pub hour_count: u64,
    pub day_count: u64,
    pub burst_tokens_remaining: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: Option<u64>,
}

// ── Alerts ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Silenced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Deterministic, keyed by rule name — repeated evaluations of the same
    /// rule update this record rather than appending a new one.
    pub id: Uuid,
    pub name: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub metric: String,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub context: HashMap<String, String>,
}

// ── API keys (ambient — caller auth, not an LLM provider key) ───────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    SubmitJob,
    ReadJob,
    CancelJob,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub key_hash: String,
    pub prefix: String,
    pub scopes: Vec<Scope>,
    pub tier: RateLimitTier,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl ApiKeyRecord {
    pub fn is_valid_now(&self) -> bool {
        if self.revoked {
            return false;
        }
        match self.expires_at {
            Some(exp) => exp > Utc::now(),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderDailyMetrics {
    pub provider_id: String,
    pub model: String,
    pub date: String,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_rate: f64,
    pub total_requests: u64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cost_usd: f64,
    pub quota_exhaustion_count: u64,
}
