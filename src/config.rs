//! Environment-variable configuration, loaded eagerly at startup.
//!
//! Follows the teacher's `Config::from_env` pattern: read once into a
//! plain struct, fail loud (`expect`) on anything required for the
//! process to run at all, fall back to sane defaults for everything else.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub redis_url: String,
    pub job_worker_count: usize,
    pub job_queue_capacity: usize,
    pub default_job_timeout: Duration,
    pub max_upload_bytes: usize,
    pub cache_schema_version: String,
    pub cache_default_ttl_secs: u64,
    pub rate_limit_burst_allowance: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub metrics_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("BIN2INSIGHT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            redis_url: env::var("BIN2INSIGHT_REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            job_worker_count: env_parse("BIN2INSIGHT_JOB_WORKERS", 4),
            job_queue_capacity: env_parse("BIN2INSIGHT_QUEUE_CAPACITY", 1024),
            default_job_timeout: Duration::from_secs(env_parse("BIN2INSIGHT_JOB_TIMEOUT_SECS", 600)),
            max_upload_bytes: env_parse("BIN2INSIGHT_MAX_UPLOAD_BYTES", 100 * 1024 * 1024),
            cache_schema_version: env::var("BIN2INSIGHT_CACHE_SCHEMA_VERSION")
                .unwrap_or_else(|_| "1.0".into()),
            cache_default_ttl_secs: env_parse("BIN2INSIGHT_CACHE_TTL_SECS", 86_400),
            rate_limit_burst_allowance: env_parse("BIN2INSIGHT_RATE_BURST", 10),
            circuit_breaker_threshold: env_parse("BIN2INSIGHT_CIRCUIT_THRESHOLD", 5),
            circuit_breaker_timeout: Duration::from_secs(env_parse(
                "BIN2INSIGHT_CIRCUIT_TIMEOUT_SECS",
                600,
            )),
            metrics_enabled: env_parse("BIN2INSIGHT_METRICS_ENABLED", true),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
