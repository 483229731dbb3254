//! HTTP surface — axum router, shared application state, and wiring for
//! auth/CORS/tracing middleware. Handlers live in [`handlers`].

mod handlers;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{self, AuthState};
use crate::cache::ResultCache;
use crate::config::Config;
use crate::jobs::JobEngine;
use crate::kv::KvStore;
use crate::metrics::MetricsRegistry;
use crate::providers::ProviderRegistry;
use crate::ratelimit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobEngine>,
    pub cache: Arc<ResultCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub providers: Arc<ProviderRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: Arc<Config>,
    pub kv: Arc<dyn KvStore>,
}

pub fn build_router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let authenticated = Router::new()
        .route("/v1/upload", post(handlers::upload))
        .route("/v1/jobs", post(handlers::submit_job).get(handlers::list_jobs))
        .route("/v1/jobs/:id", get(handlers::get_job))
        .route("/v1/jobs/:id/result", get(handlers::job_result))
        .route("/v1/jobs/:id/actions", post(handlers::job_actions))
        .route("/v1/llm-providers", get(handlers::list_providers))
        .route("/v1/llm-providers/:id", get(handlers::provider_detail))
        .route("/v1/llm-providers/:id/health-check", post(handlers::provider_health_check))
        .route_layer(middleware::from_fn_with_state(auth_state.clone(), auth::require_auth))
        .with_state(state.clone());

    let public = Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/healthz", get(handlers::healthz))
        .with_state(state);

    Router::new()
        .merge(authenticated)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::openai::OpenAiAdapter;
    use crate::kv::{BurstConsumption, KvError, KvResult, KvStore, WindowUsage};
    use crate::models::{ApiKeyRecord, ProviderConfig, ProviderKind, RateLimitTier, Scope};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tower::ServiceExt;

    struct InMemoryKv {
        data: StdMutex<HashMap<String, String>>,
    }

    impl InMemoryKv {
        fn new() -> Self {
            Self { data: StdMutex::new(HashMap::new()) }
        }
    }

    #[async_trait::async_trait]
    impl KvStore for InMemoryKv {
        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }
        async fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) -> KvResult<()> {
            self.data.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn delete(&self, key: &str) -> KvResult<bool> {
            Ok(self.data.lock().unwrap().remove(key).is_some())
        }
        async fn exists(&self, key: &str) -> KvResult<bool> {
            Ok(self.data.lock().unwrap().contains_key(key))
        }
        async fn incr(&self, _key: &str, _by: i64) -> KvResult<i64> { Ok(0) }
        async fn expire(&self, _key: &str, _ttl: Duration) -> KvResult<()> { Ok(()) }
        async fn sadd(&self, key: &str, member: &str) -> KvResult<()> {
            let mut data = self.data.lock().unwrap();
            let entry = data.entry(key.to_string()).or_insert_with(String::new);
            if entry.is_empty() {
                *entry = member.to_string();
            } else {
                entry.push(',');
                entry.push_str(member);
            }
            Ok(())
        }
        async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
            Ok(match self.data.lock().unwrap().get(key) {
                Some(s) if !s.is_empty() => s.split(',').map(str::to_string).collect(),
                _ => vec![],
            })
        }
        async fn sismember(&self, _key: &str, _member: &str) -> KvResult<bool> { Ok(false) }
        async fn window_count(&self, _key: &str, _now_millis: i64, _window_secs: u64) -> KvResult<WindowUsage> {
            Ok(WindowUsage { count: 0, oldest_entry_secs_ago: None })
        }
        async fn window_record(&self, _key: &str, _now_millis: i64, _window_secs: u64) -> KvResult<()> {
            Ok(())
        }
        async fn burst_consume(&self, _key: &str, capacity: u64, _refill_window_secs: u64, _cost: u64, _now_millis: i64) -> KvResult<BurstConsumption> {
            Ok(BurstConsumption { granted: true, remaining: capacity })
        }
        async fn pipeline(&self, ops: Vec<crate::kv::PipelineOp>) -> KvResult<()> {
            for op in ops {
                match op {
                    crate::kv::PipelineOp::Set { key, value, ttl } => {
                        self.set(&key, &value, ttl).await?;
                    }
                    crate::kv::PipelineOp::SaddWithTtl { key, member, .. } => {
                        self.sadd(&key, &member).await?;
                    }
                }
            }
            Ok(())
        }
    }

    async fn build_test_app() -> (Router, Arc<InMemoryKv>, String) {
        let kv: Arc<InMemoryKv> = Arc::new(InMemoryKv::new());
        let kv_dyn: Arc<dyn KvStore> = kv.clone();

        let raw_key = "test-key-123";
        let hash = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(raw_key.as_bytes());
            hex::encode(hasher.finalize())
        };
        let record = ApiKeyRecord {
            id: "caller-1".to_string(),
            key_hash: hash.clone(),
            prefix: "sk_test_".to_string(),
            scopes: vec![Scope::SubmitJob, Scope::ReadJob, Scope::CancelJob],
            tier: RateLimitTier::Standard,
            created_at: chrono::Utc::now(),
            last_used_at: None,
            expires_at: None,
            revoked: false,
        };
        kv_dyn
            .set(&format!("apikey:{}", hash), &serde_json::to_string(&record).unwrap(), None)
            .await
            .unwrap();

        let mut providers = ProviderRegistry::new(5, Duration::from_secs(600));
        providers.register(
            ProviderConfig {
                id: "openai".to_string(),
                kind: ProviderKind::OpenAi,
                display_name: "openai".to_string(),
                api_key: Some("sk-test".to_string()),
                base_url: Some("https://example.invalid".to_string()),
                default_model: "gpt-4o-mini".to_string(),
                enabled: true,
                cost_per_1k_input: 0.001,
                cost_per_1k_output: 0.002,
                max_concurrent_requests: 4,
            },
            Box::new(OpenAiAdapter::new("https://example.invalid")),
        );

        let state = AppState {
            jobs: Arc::new(JobEngine::new(kv_dyn.clone())),
            cache: Arc::new(ResultCache::new(kv_dyn.clone(), "1.0".to_string(), 3600)),
            rate_limiter: Arc::new(RateLimiter::new(kv_dyn.clone())),
            providers: Arc::new(providers),
            metrics: Arc::new(MetricsRegistry::new(kv_dyn.clone())),
            config: Arc::new(Config::from_env()),
            kv: kv_dyn.clone(),
        };
        let auth_state = AuthState { kv: kv_dyn };

        (build_router(state, auth_state), kv, raw_key.to_string())
    }

    #[tokio::test]
    async fn submit_without_bearer_token_is_rejected() {
        let (app, _kv, _raw_key) = build_test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"file_hash":"abc","config":{"decompilation_depth":"standard","timeout_seconds":60,"extract_functions":true,"extract_imports":true,"extract_strings":true,"max_functions":10,"max_strings":10,"llm_provider":"openai","llm_model":"gpt-4o-mini","tags":[]}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn submit_then_fetch_job_roundtrips_through_router() {
        let (app, _kv, raw_key) = build_test_app().await;

        let submit_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/jobs")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {}", raw_key))
                    .body(Body::from(r#"{"file_hash":"abc123","config":{"decompilation_depth":"standard","timeout_seconds":60,"extract_functions":true,"extract_imports":true,"extract_strings":true,"max_functions":10,"max_strings":10,"llm_provider":"openai","llm_model":"gpt-4o-mini","tags":[]}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(submit_response.status(), StatusCode::OK);

        let body = submit_response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let job_id = parsed["job_id"].as_str().unwrap();

        let get_response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/v1/jobs/{}", job_id))
                    .header("authorization", format!("Bearer {}", raw_key))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(get_response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn pause_action_is_rejected_as_unsupported() {
        let (app, _kv, raw_key) = build_test_app().await;

        let submit_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/jobs")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {}", raw_key))
                    .body(Body::from(r#"{"file_hash":"abc123","config":{"decompilation_depth":"standard","timeout_seconds":60,"extract_functions":true,"extract_imports":true,"extract_strings":true,"max_functions":10,"max_strings":10,"llm_provider":"openai","llm_model":"gpt-4o-mini","tags":[]}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = submit_response.into_body().collect().await.unwrap().to_bytes();
        let job_id = serde_json::from_slice::<serde_json::Value>(&body).unwrap()["job_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/jobs/{}/actions", job_id))
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {}", raw_key))
                    .body(Body::from(r#"{"action":"pause"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn result_of_an_incomplete_job_is_a_conflict() {
        let (app, _kv, raw_key) = build_test_app().await;

        let submit_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/jobs")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {}", raw_key))
                    .body(Body::from(r#"{"file_hash":"abc123","config":{"decompilation_depth":"standard","timeout_seconds":60,"extract_functions":true,"extract_imports":true,"extract_strings":true,"max_functions":10,"max_strings":10,"llm_provider":"openai","llm_model":"gpt-4o-mini","tags":[]}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = submit_response.into_body().collect().await.unwrap().to_bytes();
        let job_id = serde_json::from_slice::<serde_json::Value>(&body).unwrap()["job_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/v1/jobs/{}/result", job_id))
                    .header("authorization", format!("Bearer {}", raw_key))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn list_jobs_is_scoped_to_the_caller_and_paginated() {
        let (app, _kv, raw_key) = build_test_app().await;

        for _ in 0..3 {
            app.clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/v1/jobs")
                        .header("content-type", "application/json")
                        .header("authorization", format!("Bearer {}", raw_key))
                        .body(Body::from(r#"{"file_hash":"abc123","config":{"decompilation_depth":"standard","timeout_seconds":60,"extract_functions":true,"extract_imports":true,"extract_strings":true,"max_functions":10,"max_strings":10,"llm_provider":"openai","llm_model":"gpt-4o-mini","tags":[]}}"#))
                        .unwrap(),
                )
                .await
                .unwrap();
        }

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/jobs?page=1&page_size=2")
                    .header("authorization", format!("Bearer {}", raw_key))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["total"], 3);
        assert_eq!(parsed["jobs"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn healthz_requires_no_auth() {
        let (app, _kv, _raw_key) = build_test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
