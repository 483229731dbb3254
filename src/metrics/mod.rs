//! In-process metrics registry, Prometheus text exposition, and a small
//! alert threshold evaluator.
//!
//! Counters/gauges live behind a single `RwLock<HashMap<..>>`, mirroring
//! the rate tracker pattern the rest of this codebase uses for shared
//! mutable aggregate state. A background evaluator compares the latest
//! snapshot against fixed thresholds and records `AlertRecord`s through
//! the same KV store everything else is persisted through.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::kv::KvStore;
use crate::models::{AlertRecord, AlertSeverity, AlertStatus};
use crate::providers::ProviderRegistry;

/// Set of every alert id ever raised, so a re-evaluation can find alerts
/// that stopped firing and resolve them.
const ALERT_INDEX_KEY: &str = "alerts:index";

#[derive(Debug, Clone, Default)]
struct Counters {
    jobs_submitted: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    jobs_cancelled: u64,
    cache_hits: u64,
    cache_misses: u64,
    rate_limit_rejections: u64,
}

pub struct MetricsRegistry {
    counters: RwLock<Counters>,
    kv: Arc<dyn KvStore>,
}

impl MetricsRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { counters: RwLock::new(Counters::default()), kv }
    }

    pub fn record_job_submitted(&self) {
        self.counters.write().jobs_submitted += 1;
    }

    pub fn record_job_completed(&self) {
        self.counters.write().jobs_completed += 1;
    }

    pub fn record_job_failed(&self) {
        self.counters.write().jobs_failed += 1;
    }

    pub fn record_job_cancelled(&self) {
        self.counters.write().jobs_cancelled += 1;
    }

    pub fn record_cache_hit(&self) {
        self.counters.write().cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.counters.write().cache_misses += 1;
    }

    pub fn record_rate_limit_rejection(&self) {
        self.counters.write().rate_limit_rejections += 1;
    }

    fn cache_hit_ratio(&self) -> f64 {
        let c = self.counters.read();
        let total = c.cache_hits + c.cache_misses;
        if total == 0 {
            return 1.0;
        }
        c.cache_hits as f64 / total as f64
    }

    /// Render the current snapshot (plus live provider stats) as
    /// Prometheus text exposition format.
    pub fn render_prometheus(&self, registry: &ProviderRegistry) -> String {
        let c = self.counters.read().clone();
        let mut out = String::new();

        let _ = writeln!(out, "# HELP bin2insight_jobs_submitted_total Jobs submitted.");
        let _ = writeln!(out, "# TYPE bin2insight_jobs_submitted_total counter");
        let _ = writeln!(out, "bin2insight_jobs_submitted_total {}", c.jobs_submitted);

        let _ = writeln!(out, "# HELP bin2insight_jobs_completed_total Jobs completed successfully.");
        let _ = writeln!(out, "# TYPE bin2insight_jobs_completed_total counter");
        let _ = writeln!(out, "bin2insight_jobs_completed_total {}", c.jobs_completed);

        let _ = writeln!(out, "# HELP bin2insight_jobs_failed_total Jobs that exhausted retries.");
        let _ = writeln!(out, "# TYPE bin2insight_jobs_failed_total counter");
        let _ = writeln!(out, "bin2insight_jobs_failed_total {}", c.jobs_failed);

        let _ = writeln!(out, "# HELP bin2insight_jobs_cancelled_total Jobs cancelled by caller.");
        let _ = writeln!(out, "# TYPE bin2insight_jobs_cancelled_total counter");
        let _ = writeln!(out, "bin2insight_jobs_cancelled_total {}", c.jobs_cancelled);

        let _ = writeln!(out, "# HELP bin2insight_cache_hit_ratio Fraction of lookups served from cache.");
        let _ = writeln!(out, "# TYPE bin2insight_cache_hit_ratio gauge");
        let _ = writeln!(out, "bin2insight_cache_hit_ratio {:.4}", self.cache_hit_ratio());

        let _ = writeln!(out, "# HELP bin2insight_rate_limit_rejections_total Requests rejected by the rate limiter.");
        let _ = writeln!(out, "# TYPE bin2insight_rate_limit_rejections_total counter");
        let _ = writeln!(out, "bin2insight_rate_limit_rejections_total {}", c.rate_limit_rejections);

        let _ = writeln!(out, "# HELP bin2insight_provider_success_rate Per-provider success rate, 0-100.");
        let _ = writeln!(out, "# TYPE bin2insight_provider_success_rate gauge");
        for entry in registry.all() {
            let stats = entry.stats.lock();
            let _ = writeln!(
                out,
                "bin2insight_provider_success_rate{{provider=\"{}\"}} {:.2}",
                entry.config.id,
                stats.success_rate()
            );
        }

        let _ = writeln!(out, "# HELP bin2insight_provider_avg_latency_ms Per-provider average latency.");
        let _ = writeln!(out, "# TYPE bin2insight_provider_avg_latency_ms gauge");
        for entry in registry.all() {
            let stats = entry.stats.lock();
            let _ = writeln!(
                out,
                "bin2insight_provider_avg_latency_ms{{provider=\"{}\"}} {:.2}",
                entry.config.id,
                stats.avg_latency_ms
            );
        }

        out
    }

    /// Build the panel tree consumed by a dashboard UI: one panel group
    /// per concern, each with a small set of named scalar values.
    pub fn dashboard_panels(&self, registry: &ProviderRegistry) -> HashMap<String, HashMap<String, f64>> {
        let c = self.counters.read().clone();
        let mut panels = HashMap::new();

        let mut jobs = HashMap::new();
        jobs.insert("submitted".to_string(), c.jobs_submitted as f64);
        jobs.insert("completed".to_string(), c.jobs_completed as f64);
        jobs.insert("failed".to_string(), c.jobs_failed as f64);
        jobs.insert("cancelled".to_string(), c.jobs_cancelled as f64);
        panels.insert("jobs".to_string(), jobs);

        let mut cache = HashMap::new();
        cache.insert("hit_ratio".to_string(), self.cache_hit_ratio());
        cache.insert("hits".to_string(), c.cache_hits as f64);
        cache.insert("misses".to_string(), c.cache_misses as f64);
        panels.insert("cache".to_string(), cache);

        let mut providers = HashMap::new();
        for entry in registry.all() {
            let stats = entry.stats.lock();
            providers.insert(format!("{}_success_rate", entry.config.id), stats.success_rate());
            providers.insert(format!("{}_avg_latency_ms", entry.config.id), stats.avg_latency_ms);
        }
        panels.insert("providers".to_string(), providers);

        panels
    }

    /// Evaluate fixed alert thresholds against the current snapshot and the
    /// live provider registry. Each rule maps to a deterministic alert id,
    /// so a rule that keeps firing updates its existing record instead of
    /// minting a new one, and a rule that stops firing moves its alert to
    /// `resolved`. Returns every alert touched this evaluation (both still
    /// active and newly resolved).
    pub async fn evaluate_alerts(&self, registry: &ProviderRegistry) -> anyhow::Result<Vec<AlertRecord>> {
        let mut firing_rules = HashSet::new();
        let mut touched = Vec::new();

        let hit_ratio = self.cache_hit_ratio();
        if hit_ratio < 0.3 {
            let rule = "cache_hit_ratio_low";
            firing_rules.insert(rule.to_string());
            touched.push(
                self.upsert_alert(
                    rule,
                    AlertSeverity::Medium,
                    "cache_hit_ratio".to_string(),
                    format!("Cache hit ratio is {:.1}%, below the 30% floor", hit_ratio * 100.0),
                    HashMap::new(),
                )
                .await?,
            );
        }

        for entry in registry.all() {
            let stats = entry.stats.lock();
            let success_rate = stats.success_rate();
            let total = stats.total_requests;
            drop(stats);

            if total >= 10 && success_rate < 50.0 {
                let rule = format!("provider_success_rate_low:{}", entry.config.id);
                let mut context = HashMap::new();
                context.insert("provider".to_string(), entry.config.id.clone());
                firing_rules.insert(rule.clone());
                touched.push(
                    self.upsert_alert(
                        &rule,
                        AlertSeverity::Critical,
                        "provider_success_rate".to_string(),
                        format!(
                            "Provider {} success rate is {:.1}%, below the 50% floor over {} requests",
                            entry.config.id, success_rate, total
                        ),
                        context,
                    )
                    .await?,
                );
            }
        }

        let known_ids = self.kv.smembers(ALERT_INDEX_KEY).await?;
        for raw_id in known_ids {
            let Ok(id) = raw_id.parse::<Uuid>() else { continue };
            let key = format!("alert:{}", id);
            let Some(raw) = self.kv.get(&key).await? else { continue };
            let record: AlertRecord = serde_json::from_str(&raw)?;
            if record.status == AlertStatus::Active && !firing_rules.contains(&record.name) {
                if let Some(resolved) = self.resolve_alert(id).await? {
                    touched.push(resolved);
                }
            }
        }

        Ok(touched)
    }

    /// Deterministic id for a rule name — stable across evaluations so
    /// repeated firings update the same record.
    fn alert_id(rule: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, rule.as_bytes())
    }

    async fn upsert_alert(
        &self,
        rule: &str,
        severity: AlertSeverity,
        metric: String,
        message: String,
        context: HashMap<String, String>,
    ) -> anyhow::Result<AlertRecord> {
        let id = Self::alert_id(rule);
        let key = format!("alert:{}", id);

        let existing: Option<AlertRecord> = match self.kv.get(&key).await? {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        let record = match existing {
            Some(mut record) if record.status != AlertStatus::Resolved => {
                record.severity = severity;
                record.metric = metric;
                record.message = message;
                record.context = context;
                record
            }
            _ => AlertRecord {
                id,
                name: rule.to_string(),
                severity,
                status: AlertStatus::Active,
                metric,
                message,
                triggered_at: chrono::Utc::now(),
                resolved_at: None,
                acknowledged_by: None,
                context,
            },
        };

        self.kv.set(&key, &serde_json::to_string(&record)?, Some(Duration::from_secs(86400))).await?;
        self.kv.sadd(ALERT_INDEX_KEY, &id.to_string()).await?;
        Ok(record)
    }

    async fn resolve_alert(&self, id: Uuid) -> anyhow::Result<Option<AlertRecord>> {
        let key = format!("alert:{}", id);
        let Some(raw) = self.kv.get(&key).await? else { return Ok(None) };
        let mut record: AlertRecord = serde_json::from_str(&raw)?;
        if record.status != AlertStatus::Resolved {
            record.status = AlertStatus::Resolved;
            record.resolved_at = Some(chrono::Utc::now());
            self.kv.set(&key, &serde_json::to_string(&record)?, Some(Duration::from_secs(86400))).await?;
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::openai::OpenAiAdapter;
    use crate::kv::{BurstConsumption, KvError, KvResult, WindowUsage};
    use crate::models::{ProviderConfig, ProviderKind};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct NullKv {
        data: StdMutex<StdHashMap<String, String>>,
    }

    #[async_trait::async_trait]
    impl KvStore for NullKv {
        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }
        async fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) -> KvResult<()> {
            self.data.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn delete(&self, _key: &str) -> KvResult<bool> { Ok(false) }
        async fn exists(&self, _key: &str) -> KvResult<bool> { Ok(false) }
        async fn incr(&self, _key: &str, _by: i64) -> KvResult<i64> { Ok(0) }
        async fn expire(&self, _key: &str, _ttl: Duration) -> KvResult<()> { Ok(()) }
        async fn sadd(&self, key: &str, member: &str) -> KvResult<()> {
            let mut data = self.data.lock().unwrap();
            let entry = data.entry(key.to_string()).or_insert_with(String::new);
            if !entry.split(',').any(|m| m == member) {
                if entry.is_empty() {
                    *entry = member.to_string();
                } else {
                    entry.push(',');
                    entry.push_str(member);
                }
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
            Err(KvError::Unavailable("n/a".into()))
        }
        async fn window_record(&self, _key: &str, _now_millis: i64, _window_secs: u64) -> KvResult<()> {
            Err(KvError::Unavailable("n/a".into()))
        }
        async fn burst_consume(&self, _key: &str, _capacity: u64, _refill_window_secs: u64, _cost: u64, _now_millis: i64) -> KvResult<BurstConsumption> {
            Err(KvError::Unavailable("n/a".into()))
        }
        async fn pipeline(&self, _ops: Vec<crate::kv::PipelineOp>) -> KvResult<()> { Ok(()) }
    }

    fn kv() -> Arc<dyn KvStore> {
        Arc::new(NullKv { data: StdMutex::new(StdHashMap::new()) })
    }

    #[test]
    fn prometheus_output_includes_counters() {
        let metrics = MetricsRegistry::new(kv());
        metrics.record_job_submitted();
        metrics.record_cache_hit();
        let registry = ProviderRegistry::new(5, Duration::from_secs(600));
        let text = metrics.render_prometheus(&registry);
        assert!(text.contains("bin2insight_jobs_submitted_total 1"));
        assert!(text.contains("bin2insight_cache_hit_ratio 1.0000"));
    }

    #[tokio::test]
    async fn low_success_rate_fires_critical_alert() {
        let metrics = MetricsRegistry::new(kv());
        let mut registry = ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(
            ProviderConfig {
                id: "flaky".into(),
                kind: ProviderKind::OpenAi,
                display_name: "flaky".into(),
                api_key: Some("k".into()),
                base_url: Some("https://example.invalid".into()),
                default_model: "gpt-4o-mini".into(),
                enabled: true,
                cost_per_1k_input: 0.001,
                cost_per_1k_output: 0.002,
                max_concurrent_requests: 4,
            },
            Box::new(OpenAiAdapter::new("https://example.invalid")),
        );
        for _ in 0..9 {
            registry.record_failure("flaky", "simulated failure");
        }
        registry.record_success("flaky", 100, 0.0);

        let alerts = metrics.evaluate_alerts(&registry).await.unwrap();
        assert!(alerts.iter().any(|a| a.metric == "provider_success_rate"));
    }

    #[tokio::test]
    async fn healthy_provider_fires_no_alert() {
        let metrics = MetricsRegistry::new(kv());
        let mut registry = ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(
            ProviderConfig {
                id: "solid".into(),
                kind: ProviderKind::OpenAi,
                display_name: "solid".into(),
                api_key: Some("k".into()),
                base_url: Some("https://example.invalid".into()),
                default_model: "gpt-4o-mini".into(),
                enabled: true,
                cost_per_1k_input: 0.001,
                cost_per_1k_output: 0.002,
                max_concurrent_requests: 4,
            },
            Box::new(OpenAiAdapter::new("https://example.invalid")),
        );
        for _ in 0..20 {
            registry.record_success("solid", 50, 0.0);
        }

        let alerts = metrics.evaluate_alerts(&registry).await.unwrap();
        assert!(alerts.is_empty());
    }

    fn flaky_provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            kind: ProviderKind::OpenAi,
            display_name: id.to_string(),
            api_key: Some("k".into()),
            base_url: Some("https://example.invalid".into()),
            default_model: "gpt-4o-mini".into(),
            enabled: true,
            cost_per_1k_input: 0.001,
            cost_per_1k_output: 0.002,
            max_concurrent_requests: 4,
        }
    }

    #[tokio::test]
    async fn repeated_evaluation_updates_the_same_alert_instead_of_duplicating() {
        let metrics = MetricsRegistry::new(kv());
        let mut registry = ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(flaky_provider("flaky"), Box::new(OpenAiAdapter::new("https://example.invalid")));
        for _ in 0..10 {
            registry.record_failure("flaky", "simulated failure");
        }

        let first = metrics.evaluate_alerts(&registry).await.unwrap();
        let second = metrics.evaluate_alerts(&registry).await.unwrap();

        let first_alert = first.iter().find(|a| a.metric == "provider_success_rate").unwrap();
        let second_alert = second.iter().find(|a| a.metric == "provider_success_rate").unwrap();
        assert_eq!(first_alert.id, second_alert.id);
        assert_eq!(first_alert.triggered_at, second_alert.triggered_at);
        assert_eq!(second_alert.status, AlertStatus::Active);
    }

    #[tokio::test]
    async fn alert_resolves_once_the_condition_clears() {
        let metrics = MetricsRegistry::new(kv());
        let mut registry = ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(flaky_provider("flaky"), Box::new(OpenAiAdapter::new("https://example.invalid")));
        for _ in 0..10 {
            registry.record_failure("flaky", "simulated failure");
        }

        let first = metrics.evaluate_alerts(&registry).await.unwrap();
        let alert_id = first.iter().find(|a| a.metric == "provider_success_rate").unwrap().id;

        for _ in 0..20 {
            registry.record_success("flaky", 50, 0.0);
        }
        let second = metrics.evaluate_alerts(&registry).await.unwrap();

        let resolved = second.iter().find(|a| a.id == alert_id).unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
    }
}
