//! Job lifecycle engine.
//!
//! Jobs are queued in four FIFO-within-priority lanes held in memory for
//! fast dispatch, and persisted through the shared KV store so a restart
//! — or a second worker process — can recover in-flight state. A worker
//! claims a job by writing a short-TTL lease key; losing the lease (e.g.
//! the process died) lets another worker pick the job back up.

pub mod worker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapters::{FunctionContext, ImportContext, StringContext};
use crate::kv::KvStore;
use crate::models::{Job, JobPriority, JobStatus};

/// Set membership of every submitted job id, used to back the paginated
/// job listing endpoint.
const JOB_INDEX_KEY: &str = "jobs:index";

/// The decompiled artifacts a job was submitted with, persisted separately
/// from the job record itself since it can be considerably larger.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobInput {
    pub functions: Vec<FunctionContext>,
    pub imports: Vec<ImportContext>,
    pub strings: Vec<StringContext>,
}

const LEASE_TTL_SECS: u64 = 120;

pub struct JobQueue {
    lanes: Mutex<[VecDeque<Uuid>; 4]>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self { lanes: Mutex::new(Default::default()), notify: Notify::new() }
    }

    fn lane_index(priority: JobPriority) -> usize {
        match priority {
            JobPriority::Urgent => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }

    pub async fn push(&self, id: Uuid, priority: JobPriority) {
        let mut lanes = self.lanes.lock().await;
        lanes[Self::lane_index(priority)].push_back(id);
        drop(lanes);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> Option<Uuid> {
        let mut lanes = self.lanes.lock().await;
        for lane in lanes.iter_mut() {
            if let Some(id) = lane.pop_front() {
                return Some(id);
            }
        }
        None
    }

    pub async fn pop_or_wait(&self) -> Uuid {
        loop {
            if let Some(id) = self.pop().await {
                return id;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self { Self::new() }
}

pub struct JobEngine {
    kv: Arc<dyn KvStore>,
    queue: Arc<JobQueue>,
    cancellations: Mutex<std::collections::HashMap<Uuid, CancellationToken>>,
}

impl JobEngine {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv, queue: Arc::new(JobQueue::new()), cancellations: Mutex::new(Default::default()) }
    }

    fn job_key(id: Uuid) -> String {
        format!("job:{}", id)
    }

    fn input_key(id: Uuid) -> String {
        format!("job:input:{}", id)
    }

    pub async fn submit(&self, job: Job, input: JobInput) -> anyhow::Result<Uuid> {
        let id = job.id;
        let serialized = serde_json::to_string(&job)?;
        self.kv.set(&Self::job_key(id), &serialized, None).await?;
        self.kv.set(&Self::input_key(id), &serde_json::to_string(&input)?, None).await?;
        self.kv.sadd(JOB_INDEX_KEY, &id.to_string()).await?;
        self.cancellations.lock().await.insert(id, CancellationToken::new());
        self.queue.push(id, job.priority).await;
        Ok(id)
    }

    /// Every submitted job, regardless of status. Callers filter, sort, and
    /// paginate in memory; the job set is not expected to be large enough
    /// for that to matter.
    pub async fn list(&self) -> anyhow::Result<Vec<Job>> {
        let ids = self.kv.smembers(JOB_INDEX_KEY).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<Uuid>() else { continue };
            if let Some(job) = self.get(id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub async fn load_input(&self, id: Uuid) -> anyhow::Result<Option<JobInput>> {
        let raw = self.kv.get(&Self::input_key(id)).await?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let raw = self.kv.get(&Self::job_key(id)).await?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    /// Try to claim `id` for processing by acquiring a short-lived lease.
    /// Returns `false` if another worker already holds the lease.
    pub async fn try_claim(&self, id: Uuid) -> anyhow::Result<bool> {
        let lease_key = format!("job:lease:{}", id);
        if self.kv.exists(&lease_key).await? {
            return Ok(false);
        }
        self.kv.set(&lease_key, "1", Some(Duration::from_secs(LEASE_TTL_SECS))).await?;
        Ok(true)
    }

    pub async fn release_lease(&self, id: Uuid) -> anyhow::Result<()> {
        self.kv.delete(&format!("job:lease:{}", id)).await?;
        Ok(())
    }

    async fn update<F>(&self, id: Uuid, f: F) -> anyhow::Result<Option<Job>>
    where
        F: FnOnce(&mut Job),
    {
        let Some(mut job) = self.get(id).await? else { return Ok(None) };
        if job.status.is_terminal() {
            // Writes to a terminal job are dropped.
            return Ok(Some(job));
        }
        f(&mut job);
        job.updated_at = chrono::Utc::now();
        let serialized = serde_json::to_string(&job)?;
        self.kv.set(&Self::job_key(id), &serialized, None).await?;
        Ok(Some(job))
    }

    pub async fn mark_processing(&self, id: Uuid, worker_id: String) -> anyhow::Result<Option<Job>> {
        self.update(id, |j| {
            j.status = JobStatus::Processing;
            j.started_at = Some(chrono::Utc::now());
            j.worker_id = Some(worker_id);
        })
        .await
    }

    pub async fn update_progress(&self, id: Uuid, pct: f32, stage: Option<String>) -> anyhow::Result<Option<Job>> {
        self.update(id, |j| {
            j.progress_pct = pct.clamp(0.0, 100.0);
            j.progress_stage = stage;
        })
        .await
    }

    pub async fn mark_completed(&self, id: Uuid, cache_key: Option<String>) -> anyhow::Result<Option<Job>> {
        let result = self
            .update(id, |j| {
                j.status = JobStatus::Completed;
                j.completed_at = Some(chrono::Utc::now());
                j.progress_pct = 100.0;
                j.result_cache_key = cache_key;
                j.worker_id = None;
            })
            .await;
        self.cancellations.lock().await.remove(&id);
        result
    }

    /// Worker-observed processing failure. Always terminal — unlike
    /// transient lease loss, a worker that ran the job and got an error
    /// back does not get to silently retry it. Only the explicit `retry`
    /// control operation can move a failed job back to `pending`.
    pub async fn fail(&self, id: Uuid, error: String) -> anyhow::Result<Option<Job>> {
        let result = self
            .update(id, |j| {
                j.status = JobStatus::Failed;
                j.completed_at = Some(chrono::Utc::now());
                j.error = Some(error.clone());
                j.worker_id = None;
            })
            .await;
        self.cancellations.lock().await.remove(&id);
        result
    }

    /// Control operation: move a failed job back to `pending`, resetting
    /// worker assignment, timestamps, and progress. Only valid from
    /// `failed` — this is the one exception to terminal states never
    /// transitioning again, so it bypasses `update`'s terminal-state guard.
    pub async fn retry(&self, id: Uuid, reset_retry_count: bool) -> anyhow::Result<Option<Job>> {
        let Some(mut job) = self.get(id).await? else { return Ok(None) };
        if job.status != JobStatus::Failed {
            anyhow::bail!("job is not in a failed state; only failed jobs can be retried");
        }

        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.started_at = None;
        job.completed_at = None;
        job.progress_pct = 0.0;
        job.progress_stage = None;
        job.error = None;
        job.retries = if reset_retry_count { 0 } else { job.retries + 1 };
        job.updated_at = chrono::Utc::now();

        self.kv.set(&Self::job_key(id), &serde_json::to_string(&job)?, None).await?;
        self.cancellations.lock().await.insert(id, CancellationToken::new());
        self.queue.push(id, job.priority).await;

        Ok(Some(job))
    }

    /// Control operation: reassign priority on a non-terminal job and
    /// requeue it at the new priority.
    pub async fn reset(&self, id: Uuid, new_priority: Option<JobPriority>) -> anyhow::Result<Option<Job>> {
        let Some(job) = self.get(id).await? else { return Ok(None) };
        if job.status.is_terminal() {
            anyhow::bail!("cannot reset a terminal job");
        }
        let priority = new_priority.unwrap_or(job.priority);

        let result = self.update(id, |j| { j.priority = priority; }).await?;
        if let Some(j) = &result {
            if j.status == JobStatus::Pending {
                self.queue.push(id, priority).await;
            }
        }
        Ok(result)
    }

    pub async fn mark_timeout(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let result = self
            .update(id, |j| {
                j.status = JobStatus::Timeout;
                j.completed_at = Some(chrono::Utc::now());
                j.worker_id = None;
            })
            .await;
        self.cancellations.lock().await.remove(&id);
        result
    }

    /// Cancel a job immediately. If `force`, marks cancelled even if currently
    /// processing; the running worker observes the cancellation token at its
    /// next suspension point and drops its work.
    pub async fn cancel(&self, id: Uuid, force: bool) -> anyhow::Result<Option<Job>> {
        let Some(job) = self.get(id).await? else { return Ok(None) };
        if job.status == JobStatus::Processing && !force {
            anyhow::bail!("job is processing; pass force=true to cancel anyway");
        }

        if let Some(token) = self.cancellations.lock().await.get(&id) {
            token.cancel();
        }

        self.update(id, |j| {
            j.status = JobStatus::Cancelled;
            j.completed_at = Some(chrono::Utc::now());
            j.worker_id = None;
        })
        .await
    }

    pub async fn cancellation_token(&self, id: Uuid) -> Option<CancellationToken> {
        self.cancellations.lock().await.get(&id).cloned()
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        Arc::clone(&self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{BurstConsumption, KvError, KvResult, WindowUsage};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    struct InMemoryKv {
        data: StdMutex<StdHashMap<String, String>>,
    }

    impl InMemoryKv {
        fn new() -> Self { Self { data: StdMutex::new(StdHashMap::new()) } }
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
            Err(KvError::Unavailable("not needed in this test".into()))
        }
        async fn window_record(&self, _key: &str, _now_millis: i64, _window_secs: u64) -> KvResult<()> {
            Err(KvError::Unavailable("not needed in this test".into()))
        }
        async fn burst_consume(&self, _key: &str, _capacity: u64, _refill_window_secs: u64, _cost: u64, _now_millis: i64) -> KvResult<BurstConsumption> {
            Err(KvError::Unavailable("not needed in this test".into()))
        }
        async fn pipeline(&self, _ops: Vec<crate::kv::PipelineOp>) -> KvResult<()> { Ok(()) }
    }

    fn sample_job() -> Job {
        use crate::models::{AnalysisConfig, AnalysisDepth};
        Job::new(
            "deadbeef".into(),
            AnalysisConfig {
                decompilation_depth: AnalysisDepth::Standard,
                timeout_seconds: 60,
                extract_functions: true,
                extract_imports: true,
                extract_strings: true,
                max_functions: 10,
                max_strings: 10,
                llm_provider: "openai".into(),
                llm_model: "gpt-4o-mini".into(),
                tags: vec![],
            },
            "caller-1".into(),
        )
    }

    fn empty_input() -> JobInput {
        JobInput { functions: vec![], imports: vec![], strings: vec![] }
    }

    #[tokio::test]
    async fn submit_then_get_roundtrips() {
        let engine = JobEngine::new(Arc::new(InMemoryKv::new()));
        let job = sample_job();
        let id = job.id;
        engine.submit(job, empty_input()).await.unwrap();
        let fetched = engine.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Pending);
        assert!(engine.load_input(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn terminal_job_rejects_further_writes() {
        let engine = JobEngine::new(Arc::new(InMemoryKv::new()));
        let job = sample_job();
        let id = job.id;
        engine.submit(job, empty_input()).await.unwrap();
        engine.mark_completed(id, None).await.unwrap();

        engine.update_progress(id, 50.0, Some("ignored".into())).await.unwrap();
        let fetched = engine.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert_eq!(fetched.progress_pct, 100.0);
    }

    #[tokio::test]
    async fn worker_failure_is_always_terminal() {
        let engine = JobEngine::new(Arc::new(InMemoryKv::new()));
        let job = sample_job();
        let id = job.id;
        engine.submit(job, empty_input()).await.unwrap();
        engine.mark_processing(id, "worker-1".into()).await.unwrap();

        let failed = engine.fail(id, "boom".into()).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.worker_id.is_none());
        assert!(failed.completed_at.is_some());

        // A second worker-observed failure on an already-failed job is a
        // dropped write, not a second terminal transition.
        let unchanged = engine.fail(id, "again".into()).await.unwrap().unwrap();
        assert_eq!(unchanged.status, JobStatus::Failed);
        assert_eq!(unchanged.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn retry_resets_a_failed_job_to_pending() {
        let engine = JobEngine::new(Arc::new(InMemoryKv::new()));
        let job = sample_job();
        let id = job.id;
        engine.submit(job, empty_input()).await.unwrap();
        engine.mark_processing(id, "worker-1".into()).await.unwrap();
        engine.update_progress(id, 42.0, Some("translating".into())).await.unwrap();
        engine.fail(id, "boom".into()).await.unwrap();

        let retried = engine.retry(id, false).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert!(retried.worker_id.is_none());
        assert!(retried.started_at.is_none());
        assert!(retried.completed_at.is_none());
        assert_eq!(retried.progress_pct, 0.0);
        assert!(retried.error.is_none());
        assert_eq!(retried.retries, 1);

        assert_eq!(engine.queue().pop().await, Some(id));
    }

    #[tokio::test]
    async fn retry_rejects_a_non_failed_job() {
        let engine = JobEngine::new(Arc::new(InMemoryKv::new()));
        let job = sample_job();
        let id = job.id;
        engine.submit(job, empty_input()).await.unwrap();

        assert!(engine.retry(id, false).await.is_err());
    }

    #[tokio::test]
    async fn cancel_requires_force_while_processing() {
        let engine = JobEngine::new(Arc::new(InMemoryKv::new()));
        let job = sample_job();
        let id = job.id;
        engine.submit(job, empty_input()).await.unwrap();
        engine.mark_processing(id, "worker-1".into()).await.unwrap();

        assert!(engine.cancel(id, false).await.is_err());
        let cancelled = engine.cancel(id, true).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.worker_id.is_none());
    }

    #[tokio::test]
    async fn queue_respects_priority_lanes() {
        let queue = JobQueue::new();
        let low = Uuid::new_v4();
        let urgent = Uuid::new_v4();
        queue.push(low, JobPriority::Low).await;
        queue.push(urgent, JobPriority::Urgent).await;

        assert_eq!(queue.pop().await, Some(urgent));
        assert_eq!(queue.pop().await, Some(low));
    }
}
