//! Local Ollama adapter — native `/api/chat` surface, no API key required,
//! zero reported cost.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;

use super::{
    truncate, CostEstimate, LlmAdapter, ProbeError, ProviderHealthProbe, RateLimitInfo,
    TranslationRequest, TranslationResponse,
};

pub struct OllamaAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }

    async fn generate(&self, req: &TranslationRequest, _key: &str) -> anyhow::Result<TranslationResponse> {
        let body = serde_json::json!({
            "model": &req.model,
            "messages": [
                {"role": "system", "content": &req.system_prompt},
                {"role": "user", "content": &req.user_prompt},
            ],
            "stream": false,
            "options": {
                "temperature": req.temperature.unwrap_or(0.2),
                "num_predict": req.max_tokens.unwrap_or(2048),
            },
        });

        let start = Instant::now();
        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;
        let latency = start.elapsed().as_millis() as u64;

        let status = resp.status().as_u16();
        if status != 200 {
            let err_body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Ollama request failed ({}): {}", status, truncate(&err_body, 500));
        }

        let body: Value = resp.json().await?;
        let text = body["message"]["content"].as_str().unwrap_or("").to_string();

        Ok(TranslationResponse {
            text,
            model: req.model.clone(),
            input_tokens: body["prompt_eval_count"].as_u64().unwrap_or(0),
            output_tokens: body["eval_count"].as_u64().unwrap_or(0),
            latency_ms: latency,
            provider: "ollama".to_string(),
            confidence: 0.6,
        })
    }
}

#[async_trait]
impl LlmAdapter for OllamaAdapter {
    fn provider_id(&self) -> &str { "ollama" }
    fn display_name(&self) -> &str { "Ollama (local)" }

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

    async fn check_health(&self, _key: &str) -> anyhow::Result<ProviderHealthProbe> {
        let resp = self.client.get(format!("{}/api/tags", self.base_url)).send().await;
        match resp {
            Ok(r) if r.status().is_success() => {
                Ok(ProviderHealthProbe { valid: true, quota_remaining_pct: Some(100.0), reset_at: None, error: None })
            }
            Ok(r) => {
                let status = r.status().as_u16();
                let body = r.text().await.unwrap_or_default();
                let err = self.parse_error_response(status, &body);
                Ok(ProviderHealthProbe { valid: false, quota_remaining_pct: Some(0.0), reset_at: None, error: Some(err) })
            }
            Err(e) => Ok(ProviderHealthProbe {
                valid: false,
                quota_remaining_pct: Some(0.0),
                reset_at: None,
                error: Some(ProbeError {
                    http_status: 0,
                    error_type: "connection_error".into(),
                    error_message: truncate(&e.to_string(), 500).to_string(),
                    reset_time: None,
                }),
            }),
        }
    }

    fn estimate_cost(&self, _model: &str, _input_tokens: u64, _output_tokens: u64) -> CostEstimate {
        CostEstimate { input_cost_usd: 0.0, output_cost_usd: 0.0, total_cost_usd: 0.0 }
    }

    fn parse_rate_limit_headers(&self, _headers: &reqwest::header::HeaderMap) -> Option<RateLimitInfo> {
        None
    }

    fn parse_error_response(&self, status: u16, body: &str) -> ProbeError {
        ProbeError {
            http_status: status,
            error_type: "ollama_error".into(),
            error_message: truncate(body, 500).to_string(),
            reset_time: None,
        }
    }
}
