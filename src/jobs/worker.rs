//! Background job workers — one task per configured worker slot, each
//! pulling from the shared priority queue, claiming a lease, running the
//! translation pipeline, and recording the terminal outcome.

use std::sync::Arc;

use tokio::select;

use super::{JobEngine, JobInput};
use crate::cache::ResultCache;
use crate::context::QualityLevel;
use crate::metrics::MetricsRegistry;
use crate::pipeline::{DecompiledInput, TranslationPipeline};

pub struct WorkerContext {
    pub engine: Arc<JobEngine>,
    pub cache: Arc<ResultCache>,
    pub pipeline: Arc<TranslationPipeline>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Runs forever, processing jobs as they're queued. Spawn `worker_count`
/// copies of this to get bounded parallel dispatch.
pub async fn run(ctx: Arc<WorkerContext>, worker_id: String) {
    let queue = ctx.engine.queue();
    loop {
        let id = queue.pop_or_wait().await;

        match ctx.engine.try_claim(id).await {
            Ok(true) => {}
            Ok(false) => continue, // another worker already holds the lease
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "failed to claim job lease");
                continue;
            }
        }

        if let Err(e) = process_one(&ctx, id, &worker_id).await {
            tracing::error!(job_id = %id, error = %e, "job processing failed unexpectedly");
            let _ = ctx.engine.fail(id, e.to_string()).await;
            ctx.metrics.record_job_failed();
        }

        let _ = ctx.engine.release_lease(id).await;
    }
}

async fn process_one(ctx: &Arc<WorkerContext>, id: uuid::Uuid, worker_id: &str) -> anyhow::Result<()> {
    let Some(job) = ctx.engine.get(id).await? else { return Ok(()) };
    if job.status.is_terminal() {
        return Ok(());
    }

    let Some(token) = ctx.engine.cancellation_token(id).await else { return Ok(()) };

    if let Some(cached) = ctx.cache.get(&job.file_hash, &job.config).await? {
        ctx.engine.mark_completed(id, Some(cached.fingerprint.cache_key())).await?;
        ctx.metrics.record_cache_hit();
        ctx.metrics.record_job_completed();
        return Ok(());
    }
    ctx.metrics.record_cache_miss();

    let Some(JobInput { functions, imports, strings }) = ctx.engine.load_input(id).await? else {
        anyhow::bail!("job has no stored decompiled input");
    };

    ctx.engine.mark_processing(id, worker_id.to_string()).await?;

    let timeout = std::time::Duration::from_secs(job.config.timeout_seconds);
    let input = DecompiledInput { functions, imports, strings };

    let outcome = select! {
        biased;
        _ = token.cancelled() => {
            ctx.engine.cancel(id, true).await?;
            ctx.metrics.record_job_cancelled();
            return Ok(());
        }
        result = tokio::time::timeout(timeout, ctx.pipeline.run(input, QualityLevel::Standard)) => {
            match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    ctx.engine.mark_timeout(id).await?;
                    return Ok(());
                }
            }
        }
    };

    if !outcome.failed_functions.is_empty() {
        tracing::warn!(
            job_id = %id,
            failed = outcome.failed_functions.len(),
            "job completed with partial function translation failures"
        );
    }

    let fp = ctx
        .cache
        .put(&job.file_hash, &job.config, outcome.artifacts, job.config.tags.clone())
        .await?;

    ctx.engine.mark_completed(id, Some(fp.cache_key())).await?;
    ctx.metrics.record_job_completed();

    if let Some(url) = &job.callback_url {
        deliver_callback(url, id).await;
    }

    Ok(())
}

/// Best-effort callback delivery with a small fixed retry cascade.
async fn deliver_callback(url: &str, job_id: uuid::Uuid) {
    const MAX_ATTEMPTS: u32 = 3;
    let client = reqwest::Client::new();
    let body = serde_json::json!({ "job_id": job_id.to_string(), "status": "completed" });

    for attempt in 0..MAX_ATTEMPTS {
        match client.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => {
                tracing::warn!(job_id = %job_id, status = %resp.status(), attempt, "callback delivery rejected");
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, attempt, "callback delivery failed");
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(500 * (attempt as u64 + 1))).await;
    }
    tracing::error!(job_id = %job_id, "callback delivery exhausted retries");
}
