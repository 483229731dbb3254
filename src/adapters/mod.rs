//! Universal LLM adapter trait — provider-agnostic translation interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionContext {
    pub name: String,
    pub address: String,
    pub disassembly: String,
    pub callees: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportContext {
    pub name: String,
    pub library: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringContext {
    pub value: String,
    pub reference_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResponse {
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub provider: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub provider: String,
    pub input_token_limit: u64,
    pub output_token_limit: u64,
    pub is_deprecated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthProbe {
    pub valid: bool,
    pub quota_remaining_pct: Option<f64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub error: Option<ProbeError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub rpm_limit: Option<u32>,
    pub rpm_remaining: Option<u32>,
    pub tpm_limit: Option<u64>,
    pub tpm_remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after_secs: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeError {
    pub http_status: u16,
    pub error_type: String,
    pub error_message: String,
    pub reset_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEstimate {
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub total_cost_usd: f64,
}

/// One operation per translation-pipeline stage.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    fn provider_id(&self) -> &str;
    fn display_name(&self) -> &str;

    async fn translate_function(
        &self,
        req: &TranslationRequest,
        key: &str,
    ) -> anyhow::Result<TranslationResponse>;

    async fn explain_imports(
        &self,
        req: &TranslationRequest,
        key: &str,
    ) -> anyhow::Result<TranslationResponse>;

    async fn interpret_strings(
        &self,
        req: &TranslationRequest,
        key: &str,
    ) -> anyhow::Result<TranslationResponse>;

    async fn generate_overall_summary(
        &self,
        req: &TranslationRequest,
        key: &str,
    ) -> anyhow::Result<TranslationResponse>;

    async fn check_health(&self, key: &str) -> anyhow::Result<ProviderHealthProbe>;

    fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> CostEstimate;

    fn parse_rate_limit_headers(&self, headers: &reqwest::header::HeaderMap) -> Option<RateLimitInfo>;

    fn parse_error_response(&self, status: u16, body: &str) -> ProbeError;
}

/// Shared helper for adapters whose four translation operations are really
/// the same chat-completion call with a different prompt pair — which is
/// true for every provider this service supports.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    &s[..s.len().min(max)]
}
