//! Binary decompilation + LLM translation service.
//!
//! Decompiled artifacts come in through the job API already extracted
//! upstream (this service owns translation, caching, rate limiting, and
//! provider orchestration, not the decompiler itself); each submitted job
//! is queued, picked up by a worker, run through the translation
//! pipeline, and cached by fingerprint.

mod adapters;
mod auth;
mod cache;
mod config;
mod context;
mod error;
mod http;
mod jobs;
mod kv;
mod metrics;
mod models;
mod pipeline;
mod providers;
mod ratelimit;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::adapters::anthropic::AnthropicAdapter;
use crate::adapters::gemini::GeminiAdapter;
use crate::adapters::ollama::OllamaAdapter;
use crate::adapters::openai::OpenAiAdapter;
use crate::auth::AuthState;
use crate::cache::ResultCache;
use crate::config::Config;
use crate::context::{ContextBuilder, QualityLevel};
use crate::http::AppState;
use crate::jobs::worker::{self, WorkerContext};
use crate::jobs::JobEngine;
use crate::kv::RedisKvStore;
use crate::metrics::MetricsRegistry;
use crate::models::{ProviderConfig, ProviderKind};
use crate::pipeline::TranslationPipeline;
use crate::providers::ProviderRegistry;
use crate::ratelimit::RateLimiter;

fn register_providers(registry: &mut ProviderRegistry) {
    let configured: &[(&str, ProviderKind, &str, &str)] = &[
        ("openai", ProviderKind::OpenAi, "OPENAI_API_KEY", "gpt-4o-mini"),
        ("anthropic", ProviderKind::Anthropic, "ANTHROPIC_API_KEY", "claude-3-5-haiku-20241022"),
        ("gemini", ProviderKind::Gemini, "GEMINI_API_KEY", "gemini-1.5-flash"),
        ("ollama", ProviderKind::Ollama, "OLLAMA_API_KEY", "llama3.1"),
    ];

    for (id, kind, key_env, default_model) in configured {
        let api_key = std::env::var(key_env).ok();
        if *kind != ProviderKind::Ollama && api_key.is_none() {
            tracing::info!(provider = %id, "no API key configured, skipping registration");
            continue;
        }

        let base_url = match kind {
            ProviderKind::Ollama => Some(
                std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            ),
            ProviderKind::OpenAi => Some(
                std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            ),
            _ => None,
        };

        let config = ProviderConfig {
            id: id.to_string(),
            kind: *kind,
            display_name: id.to_string(),
            api_key,
            base_url: base_url.clone(),
            default_model: default_model.to_string(),
            enabled: true,
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            max_concurrent_requests: 8,
        };

        let adapter: Box<dyn adapters::LlmAdapter> = match kind {
            ProviderKind::OpenAi => Box::new(OpenAiAdapter::new(base_url.unwrap())),
            ProviderKind::Anthropic => Box::new(AnthropicAdapter::new()),
            ProviderKind::Gemini => Box::new(GeminiAdapter::new()),
            ProviderKind::Ollama => Box::new(OllamaAdapter::new(base_url.unwrap())),
        };

        registry.register(config, adapter);
        tracing::info!(provider = %id, "registered provider");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bin2insight=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting bin2insight server");

    let config = Arc::new(Config::from_env());

    let kv = RedisKvStore::connect(&config.redis_url)?.into_shared();
    tracing::info!(redis_url = %config.redis_url, "connected to kv store");

    let mut provider_registry = ProviderRegistry::new(config.circuit_breaker_threshold, config.circuit_breaker_timeout);
    register_providers(&mut provider_registry);
    let providers = Arc::new(provider_registry);

    let context_builder = Arc::new(ContextBuilder::new(QualityLevel::High));
    let pipeline = Arc::new(TranslationPipeline::new(
        Arc::clone(&providers),
        context_builder,
        16,
        2,
    ));

    let cache = Arc::new(ResultCache::new(
        Arc::clone(&kv),
        config.cache_schema_version.clone(),
        config.cache_default_ttl_secs,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(Arc::clone(&kv)));
    let metrics = Arc::new(MetricsRegistry::new(Arc::clone(&kv)));
    let jobs = Arc::new(JobEngine::new(Arc::clone(&kv)));

    let worker_ctx = Arc::new(WorkerContext {
        engine: Arc::clone(&jobs),
        cache: Arc::clone(&cache),
        pipeline,
        metrics: Arc::clone(&metrics),
    });

    for worker_id in 0..config.job_worker_count.max(1) {
        let ctx = Arc::clone(&worker_ctx);
        let worker_label = format!("worker-{}", worker_id);
        tokio::spawn(async move {
            tracing::info!(worker_id, "job worker started");
            worker::run(ctx, worker_label).await;
        });
    }

    if config.metrics_enabled {
        let metrics_for_alerts = Arc::clone(&metrics);
        let providers_for_alerts = Arc::clone(&providers);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                match metrics_for_alerts.evaluate_alerts(&providers_for_alerts).await {
                    Ok(alerts) if !alerts.is_empty() => {
                        for alert in alerts {
                            tracing::warn!(metric = %alert.metric, severity = ?alert.severity, "{}", alert.message);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "alert evaluation failed"),
                }
            }
        });
    }

    let app_state = AppState {
        jobs,
        cache,
        rate_limiter,
        providers,
        metrics,
        config: Arc::clone(&config),
        kv: Arc::clone(&kv),
    };
    let auth_state = AuthState { kv: Arc::clone(&kv) };

    let app = http::build_router(app_state, auth_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
