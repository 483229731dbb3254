//! Fingerprint-based result cache.
//!
//! A cache key is derived from two hashes: the caller-supplied file hash
//! (identifies the binary) and a config hash computed over the subset of
//! `AnalysisConfig` fields that actually affect the translation output
//! (not every field — e.g. `callback_url` never changes the result and
//! must not bust the cache). TTL scales with analysis depth; tags let a
//! caller invalidate every cached result that touched a given file or
//! provider without knowing every individual cache key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::kv::{KvStore, PipelineOp};
use crate::models::{AnalysisConfig, CachedResult, DecompilationFingerprint, TranslationArtifact};

const MAX_KEY_LENGTH: usize = 250;

pub struct ResultCache {
    kv: Arc<dyn KvStore>,
    schema_version: String,
    base_ttl_secs: u64,
}

impl ResultCache {
    pub fn new(kv: Arc<dyn KvStore>, schema_version: String, base_ttl_secs: u64) -> Self {
        Self { kv, schema_version, base_ttl_secs }
    }

    pub fn fingerprint(&self, file_hash: &str, config: &AnalysisConfig) -> DecompilationFingerprint {
        DecompilationFingerprint {
            file_hash: file_hash.to_string(),
            config_hash: config_hash(config),
        }
    }

    fn cache_key(&self, fp: &DecompilationFingerprint) -> String {
        let key = fp.cache_key();
        if key.len() <= MAX_KEY_LENGTH {
            key
        } else {
            // Degenerate fallback for pathologically long file hashes.
            format!("result:sha256:{}", sha256_hex(&key))
        }
    }

    pub async fn get(
        &self,
        file_hash: &str,
        config: &AnalysisConfig,
    ) -> anyhow::Result<Option<CachedResult>> {
        let fp = self.fingerprint(file_hash, config);
        let key = self.cache_key(&fp);

        let raw = self.kv.get(&key).await?;
        let Some(raw) = raw else { return Ok(None) };

        let cached: CachedResult = serde_json::from_str(&raw)?;
        if cached.schema_version != self.schema_version {
            return Ok(None);
        }
        if cached.is_expired() {
            return Ok(None);
        }
        Ok(Some(cached))
    }

    /// Fetch a cached result directly by its cache key, as stored on a
    /// completed job's `result_cache_key` — skips fingerprint recomputation
    /// since the caller already has the exact key.
    pub async fn get_by_key(&self, key: &str) -> anyhow::Result<Option<CachedResult>> {
        let raw = self.kv.get(key).await?;
        let Some(raw) = raw else { return Ok(None) };

        let cached: CachedResult = serde_json::from_str(&raw)?;
        if cached.schema_version != self.schema_version || cached.is_expired() {
            return Ok(None);
        }
        Ok(Some(cached))
    }

    pub async fn put(
        &self,
        file_hash: &str,
        config: &AnalysisConfig,
        artifacts: Vec<TranslationArtifact>,
        tags: Vec<String>,
    ) -> anyhow::Result<DecompilationFingerprint> {
        let fp = self.fingerprint(file_hash, config);
        let key = self.cache_key(&fp);
        let ttl_secs = (self.base_ttl_secs as f64 * config.decompilation_depth.ttl_multiplier()) as u64;

        let entry = CachedResult {
            fingerprint: fp.clone(),
            schema_version: self.schema_version.clone(),
            artifacts,
            created_at: Utc::now(),
            ttl_seconds: ttl_secs,
            tags: tags.clone(),
        };

        let serialized = serde_json::to_string(&entry)?;
        let ttl = Duration::from_secs(ttl_secs);

        let mut ops = vec![
            PipelineOp::Set { key: key.clone(), value: serialized, ttl: Some(ttl) },
            PipelineOp::SaddWithTtl { key: format!("file:results:{}", file_hash), member: key.clone(), ttl: Some(ttl) },
        ];
        for tag in &tags {
            ops.push(PipelineOp::SaddWithTtl { key: format!("tag:results:{}", tag), member: key.clone(), ttl: Some(ttl) });
        }
        self.kv.pipeline(ops).await?;

        Ok(fp)
    }

    /// Invalidate every cached result tagged with `tag`.
    pub async fn invalidate_tag(&self, tag: &str) -> anyhow::Result<u64> {
        let tag_key = format!("tag:results:{}", tag);
        let keys = self.kv.smembers(&tag_key).await?;
        let mut removed = 0u64;
        for key in &keys {
            if self.kv.delete(key).await? {
                removed += 1;
            }
        }
        self.kv.delete(&tag_key).await?;
        Ok(removed)
    }

    /// Invalidate every cached result derived from `file_hash`.
    pub async fn invalidate_file(&self, file_hash: &str) -> anyhow::Result<u64> {
        let file_key = format!("file:results:{}", file_hash);
        let keys = self.kv.smembers(&file_key).await?;
        let mut removed = 0u64;
        for key in &keys {
            if self.kv.delete(key).await? {
                removed += 1;
            }
        }
        self.kv.delete(&file_key).await?;
        Ok(removed)
    }
}

/// Canonical (sorted-key) JSON over the fields that affect the translation
/// output, MD5-hashed and truncated to 16 hex characters. Mirrors the
/// field set and truncation length of the system this was distilled from.
fn config_hash(config: &AnalysisConfig) -> String {
    let mut tags = config.tags.clone();
    tags.sort();

    let canonical = serde_json::json!({
        "decompilation_depth": format!("{:?}", config.decompilation_depth),
        "timeout_seconds": config.timeout_seconds,
        "extract_functions": config.extract_functions,
        "extract_imports": config.extract_imports,
        "extract_strings": config.extract_strings,
        "max_functions": config.max_functions,
        "max_strings": config.max_strings,
        "llm_provider": &config.llm_provider,
        "llm_model": &config.llm_model,
        "tags": tags,
    });

    // serde_json::Map preserves insertion order; `json!` macro with string
    // literal keys above is already written in a fixed, sorted order so the
    // hash is stable across process runs.
    let serialized = canonical.to_string();
    let digest = md5::compute(serialized.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
