//! Sliding-window rate limiter with per-tier burst allowance.
//!
//! Three nested windows (minute/hour/day) are checked independently; the
//! tightest one to trip wins. Burst is a rescue, not a parallel quota: it is
//! only consulted once a window has already denied the request, and a
//! request admitted purely on quota never touches the burst bucket. Any
//! request that is ultimately admitted — whether by quota or by burst
//! rescue — is recorded into every window; a request that is denied records
//! nothing, so a client retrying after a 429 is never the one refreshing
//! its own window. On KV store unavailability the limiter fails open —
//! degraded availability beats a false rejection.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use crate::kv::{KvStore, KvError};
use crate::models::{RateLimitDecision, RateLimitTier};

#[derive(Debug, Clone, Copy)]
pub struct TierPolicy {
    pub per_minute: u64,
    pub per_hour: u64,
    pub per_day: u64,
    pub burst_capacity: u64,
    pub burst_refill_window_secs: u64,
}

pub fn default_policies() -> HashMap<RateLimitTier, TierPolicy> {
    let mut m = HashMap::new();
    m.insert(
        RateLimitTier::Free,
        TierPolicy { per_minute: 10, per_hour: 200, per_day: 1_000, burst_capacity: 5, burst_refill_window_secs: 60 },
    );
    m.insert(
        RateLimitTier::Standard,
        TierPolicy { per_minute: 60, per_hour: 2_000, per_day: 20_000, burst_capacity: 20, burst_refill_window_secs: 60 },
    );
    m.insert(
        RateLimitTier::Premium,
        TierPolicy { per_minute: 300, per_hour: 10_000, per_day: 150_000, burst_capacity: 100, burst_refill_window_secs: 60 },
    );
    m.insert(
        RateLimitTier::Internal,
        TierPolicy { per_minute: 10_000, per_hour: 500_000, per_day: 5_000_000, burst_capacity: 1_000, burst_refill_window_secs: 60 },
    );
    m
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    policies: HashMap<RateLimitTier, TierPolicy>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv, policies: default_policies() }
    }

    pub fn with_policies(kv: Arc<dyn KvStore>, policies: HashMap<RateLimitTier, TierPolicy>) -> Self {
        Self { kv, policies }
    }

    /// Check and record one request for `identifier` under `tier`.
    ///
    /// Returns a decision describing whether the request is allowed and,
    /// when rejected, how many seconds until the tightest window resets.
    pub async fn check(&self, identifier: &str, tier: RateLimitTier) -> RateLimitDecision {
        let policy = *self
            .policies
            .get(&tier)
            .unwrap_or(&self.policies[&RateLimitTier::Free]);

        if let Ok(blocked) = self.kv.sismember("ratelimit:blocked", identifier).await {
            if blocked {
                return RateLimitDecision {
                    allowed: false,
                    limit: 0,
                    remaining: 0,
                    reset_at: Utc::now() + ChronoDuration::hours(1),
                    retry_after_secs: Some(3600),
                };
            }
        }

        let now_millis = Utc::now().timestamp_millis();

        let windows = [
            (60u64, policy.per_minute, "minute"),
            (3600u64, policy.per_hour, "hour"),
            (86_400u64, policy.per_day, "day"),
        ];

        let mut minute_usage: Option<crate::kv::WindowUsage> = None;
        let mut denial: Option<(u64, u64, crate::kv::WindowUsage)> = None;

        for (idx, (window_secs, limit, label)) in windows.iter().enumerate() {
            let key = format!("ratelimit:{}:{}:{}", identifier, label, tier_label(tier));
            match self.kv.window_count(&key, now_millis, *window_secs).await {
                Ok(usage) => {
                    if idx == 0 {
                        minute_usage = Some(usage);
                    }
                    if usage.count + 1 > *limit {
                        denial = Some((*window_secs, *limit, usage));
                        break;
                    }
                }
                Err(KvError::Unavailable(_)) | Err(KvError::Timeout) => {
                    // Fail open: the KV store being down should not block traffic.
                    return fail_open();
                }
                Err(_) => return fail_open(),
            }
        }

        if let Some((window_secs, limit, usage)) = denial {
            // A window denied the request; burst is the only remaining path
            // to admission, consulted here and nowhere else.
            let burst_key = format!("ratelimit:burst:{}:{}", identifier, tier_label(tier));
            return match self
                .kv
                .burst_consume(
                    &burst_key,
                    policy.burst_capacity,
                    policy.burst_refill_window_secs,
                    1,
                    now_millis,
                )
                .await
            {
                Ok(burst) if burst.granted => {
                    // Burst-rescued requests still count against every window.
                    for (w_secs, _, label) in windows {
                        let key = format!("ratelimit:{}:{}:{}", identifier, label, tier_label(tier));
                        let _ = self.kv.window_record(&key, now_millis, w_secs).await;
                    }
                    RateLimitDecision {
                        allowed: true,
                        limit: policy.burst_capacity,
                        remaining: burst.remaining,
                        reset_at: Utc::now() + ChronoDuration::seconds(policy.burst_refill_window_secs as i64),
                        retry_after_secs: None,
                    }
                }
                Ok(_) => {
                    let retry_after = window_secs.saturating_sub(usage.oldest_entry_secs_ago.unwrap_or(0));
                    RateLimitDecision {
                        allowed: false,
                        limit,
                        remaining: 0,
                        reset_at: Utc::now() + ChronoDuration::seconds(retry_after as i64),
                        retry_after_secs: Some(retry_after.max(1)),
                    }
                }
                Err(_) => fail_open(),
            };
        }

        // All windows passed under quota; record the request and admit it
        // without ever touching the burst bucket.
        for (window_secs, _, label) in windows {
            let key = format!("ratelimit:{}:{}:{}", identifier, label, tier_label(tier));
            if let Err(e) = self.kv.window_record(&key, now_millis, window_secs).await {
                if matches!(e, KvError::Unavailable(_) | KvError::Timeout) {
                    return fail_open();
                }
            }
        }

        let remaining = minute_usage
            .map(|u| policy.per_minute.saturating_sub(u.count + 1))
            .unwrap_or(policy.per_minute.saturating_sub(1));

        RateLimitDecision {
            allowed: true,
            limit: policy.per_minute,
            remaining,
            reset_at: Utc::now() + ChronoDuration::seconds(60),
            retry_after_secs: None,
        }
    }

    /// Permanently block an identifier (e.g. abusive caller).
    pub async fn block(&self, identifier: &str) -> Result<(), KvError> {
        self.kv.sadd("ratelimit:blocked", identifier).await
    }
}

fn tier_label(tier: RateLimitTier) -> &'static str {
    match tier {
        RateLimitTier::Free => "free",
        RateLimitTier::Standard => "standard",
        RateLimitTier::Premium => "premium",
        RateLimitTier::Internal => "internal",
    }
}

fn fail_open() -> RateLimitDecision {
    RateLimitDecision {
        allowed: true,
        limit: u64::MAX,
        remaining: u64::MAX,
        reset_at: Utc::now() + ChronoDuration::seconds(60),
        retry_after_secs: None,
    }
}
