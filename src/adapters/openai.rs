//! OpenAI-compatible chat-completions adapter.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;

use super::{
    truncate, CostEstimate, LlmAdapter, ProbeError, ProviderHealthProbe, RateLimitInfo,
    TranslationRequest, TranslationResponse,
};

pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn generate(&self, req: &TranslationRequest, key: &str) -> anyhow::Result<TranslationResponse> {
        let body = serde_json::json!({
            "model": &req.model,
            "messages": [
                {"role": "system", "content": &req.system_prompt},
                {"role": "user", "content": &req.user_prompt},
            ],
            "temperature": req.temperature.unwrap_or(0.2),
            "max_tokens": req.max_tokens.unwrap_or(2048),
        });

        let start = Instant::now();
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;
        let latency = start.elapsed().as_millis() as u64;

        let status = resp.status().as_u16();
        if status != 200 {
            let err_body = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI request failed ({}): {}", status, truncate(&err_body, 500));
        }

        let body: Value = resp.json().await?;
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let usage = &body["usage"];

        Ok(TranslationResponse {
            text,
            model: req.model.clone(),
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            latency_ms: latency,
            provider: "openai".to_string(),
            confidence: 0.8,
        })
    }
}

#[async_trait]
impl LlmAdapter for OpenAiAdapter {
    fn provider_id(&self) -> &str { "openai" }
    fn display_name(&self) -> &str { "OpenAI" }

    async fn translate_function(&self, req: &TranslationRequest, key: &str) -> anyhow::Result<TranslationResponse> {
        self.generate(req, key).await
    }

    async fn explain_imports(&self, req: &TranslationRequest, key: &str) -> anyhow::Result<TranslationResponse> {
        self.generate(req, key).await
    }

    async fn interpret_strings(&self, req: &TranslationRequest, key: &str) -> anyhow::Result<TranslationResponse> {
        self.generate(req, key).await
    }

    async fn generate_overall_summary(&self, req: &TranslationRequest, key: &str) -> anyhow::Result<TranslationResponse> {
        self.generate(req, key).await
    }

    async fn check_health(&self, key: &str) -> anyhow::Result<ProviderHealthProbe> {
        let resp = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(key)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 200 {
            Ok(ProviderHealthProbe { valid: true, quota_remaining_pct: Some(100.0), reset_at: None, error: None })
        } else {
            let body = resp.text().await.unwrap_or_default();
            let err = self.parse_error_response(status, &body);
            Ok(ProviderHealthProbe {
                valid: status != 401,
                quota_remaining_pct: if status == 429 { Some(0.0) } else { Some(50.0) },
                reset_at: err.reset_time,
                error: Some(err),
            })
        }
    }

    fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> CostEstimate {
        let (in_rate, out_rate) = match model {
            m if m.contains("gpt-4o-mini") => (0.15 / 1_000_000.0, 0.60 / 1_000_000.0),
            m if m.contains("gpt-4o") => (2.50 / 1_000_000.0, 10.0 / 1_000_000.0),
            m if m.contains("gpt-4") => (30.0 / 1_000_000.0, 60.0 / 1_000_000.0),
            _ => (0.50 / 1_000_000.0, 1.50 / 1_000_000.0),
        };
        let input_cost_usd = input_tokens as f64 * in_rate;
        let output_cost_usd = output_tokens as f64 * out_rate;
        CostEstimate { input_cost_usd, output_cost_usd, total_cost_usd: input_cost_usd + output_cost_usd }
    }

    fn parse_rate_limit_headers(&self, headers: &reqwest::header::HeaderMap) -> Option<RateLimitInfo> {
        let get_u32 = |name: &str| -> Option<u32> { headers.get(name)?.to_str().ok()?.parse().ok() };
        let rpm_limit = get_u32("x-ratelimit-limit-requests");
        let rpm_remaining = get_u32("x-ratelimit-remaining-requests");
        if rpm_limit.is_none() && rpm_remaining.is_none() {
            return None;
        }
        Some(RateLimitInfo { rpm_limit, rpm_remaining, tpm_limit: None, tpm_remaining: None, reset_at: None, retry_after_secs: None })
    }

    fn parse_error_response(&self, status: u16, body: &str) -> ProbeError {
        let parsed: Value = serde_json::from_str(body).unwrap_or_default();
        let message = parsed["error"]["message"].as_str().unwrap_or(body).to_string();
        let error_type = parsed["error"]["type"].as_str().unwrap_or("unknown").to_string();
        ProbeError {
            http_status: status,
            error_type,
            error_message: truncate(&message, 500).to_string(),
            reset_time: None,
        }
    }
}
