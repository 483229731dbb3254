//! Google Gemini adapter.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;

use super::{
    truncate, CostEstimate, LlmAdapter, ProbeError, ProviderHealthProbe, RateLimitInfo,
    TranslationRequest, TranslationResponse,
};

pub struct GeminiAdapter {
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    async fn generate(&self, req: &TranslationRequest, key: &str) -> anyhow::Result<TranslationResponse> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            req.model, key
        );

        let body = serde_json::json!({
            "systemInstruction": {"parts": [{"text": &req.system_prompt}]},
            "contents": [{"role": "user", "parts": [{"text": &req.user_prompt}]}],
            "generationConfig": {
                "temperature": req.temperature.unwrap_or(0.2),
                "maxOutputTokens": req.max_tokens.unwrap_or(2048),
            },
        });

        let start = Instant::now();
        let resp = self.client.post(&url).json(&body).send().await?;
        let latency = start.elapsed().as_millis() as u64;

        let status = resp.status().as_u16();
        if status != 200 {
            let err_body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Gemini request failed ({}): {}", status, truncate(&err_body, 500));
        }

        let body: Value = resp.json().await?;
        let text = body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let usage = &body["usageMetadata"];

        Ok(TranslationResponse {
            text,
            model: req.model.clone(),
            input_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0),
            latency_ms: latency,
            provider: "gemini".to_string(),
            confidence: 0.78,
        })
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl LlmAdapter for GeminiAdapter {
    fn provider_id(&self) -> &str { "gemini" }
    fn display_name(&self) -> &str { "Google Gemini" }

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
        let url = format!("https://generativelanguage.googleapis.com/v1beta/models?key={}", key);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status().as_u16();
        if status == 200 {
            Ok(ProviderHealthProbe { valid: true, quota_remaining_pct: Some(100.0), reset_at: None, error: None })
        } else {
            let body = resp.text().await.unwrap_or_default();
            let err = self.parse_error_response(status, &body);
            Ok(ProviderHealthProbe {
                valid: status != 400 && status != 401,
                quota_remaining_pct: if status == 429 { Some(0.0) } else { Some(50.0) },
                reset_at: err.reset_time,
                error: Some(err),
            })
        }
    }

    fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> CostEstimate {
        let (in_rate, out_rate) = match model {
            m if m.contains("flash-lite") => (0.075 / 1_000_000.0, 0.30 / 1_000_000.0),
            m if m.contains("flash") => (0.15 / 1_000_000.0, 0.60 / 1_000_000.0),
            m if m.contains("pro") => (1.25 / 1_000_000.0, 5.0 / 1_000_000.0),
            _ => (0.15 / 1_000_000.0, 0.60 / 1_000_000.0),
        };
        let input_cost_usd = input_tokens as f64 * in_rate;
        let output_cost_usd = output_tokens as f64 * out_rate;
        CostEstimate { input_cost_usd, output_cost_usd, total_cost_usd: input_cost_usd + output_cost_usd }
    }

    fn parse_rate_limit_headers(&self, _headers: &reqwest::header::HeaderMap) -> Option<RateLimitInfo> {
        // Gemini does not expose standard rate-limit headers; capacity is
        // tracked purely from 429 responses via parse_error_response.
        None
    }

    fn parse_error_response(&self, status: u16, body: &str) -> ProbeError {
        let parsed: Value = serde_json::from_str(body).unwrap_or_default();
        let message = parsed["error"]["message"].as_str().unwrap_or(body).to_string();
        let error_type = parsed["error"]["status"].as_str().unwrap_or("UNKNOWN").to_string();
        ProbeError {
            http_status: status,
            error_type,
            error_message: truncate(&message, 500).to_string(),
            reset_time: None,
        }
    }
}
