use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use lipa_fx::SharedCache;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket size: how many requests may burst at once.
    pub capacity: f64,
    /// Steady-state refill, tokens per second.
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 60.0,
            refill_per_second: 1.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Bucket {
    tokens: f64,
    refilled_at: DateTime<Utc>,
}

/// Token bucket over the shared cache, so limits compose across instances
/// the way a Redis-backed deployment expects. Keys are scoped, e.g.
/// `user:alice` or `ip:10.0.0.1`.
///
/// The read-modify-write here is not atomic across instances; a production
/// cache runs it as a single server-side script. Under races the bucket
/// over-admits slightly, which is the acceptable direction.
pub struct RateLimiter {
    cache: Arc<dyn SharedCache>,
    config: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(cache: Arc<dyn SharedCache>, config: RateLimitConfig) -> Self {
        Self { cache, config }
    }

    fn cache_key(scope: &str, id: &str) -> String {
        format!("ratelimit:{scope}:{id}")
    }

    fn ttl(&self) -> Duration {
        let refill_all = self.config.capacity / self.config.refill_per_second.max(f64::EPSILON);
        Duration::from_secs_f64(refill_all.clamp(1.0, 86_400.0))
    }

    /// Returns whether the caller may proceed, consuming one token if so.
    pub async fn allow(&self, scope: &str, id: &str) -> bool {
        let key = Self::cache_key(scope, id);
        let now = Utc::now();

        let mut bucket = match self.cache.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or(Bucket {
                tokens: self.config.capacity,
                refilled_at: now,
            }),
            Ok(None) => Bucket {
                tokens: self.config.capacity,
                refilled_at: now,
            },
            Err(err) => {
                // A broken cache must not take the payment path down.
                warn!(error = %err, "rate limiter cache read failed, admitting");
                return true;
            }
        };

        let elapsed = (now - bucket.refilled_at)
            .to_std()
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0);
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_per_second)
            .min(self.config.capacity);
        bucket.refilled_at = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        match serde_json::to_string(&bucket) {
            Ok(raw) => {
                if let Err(err) = self.cache.set(&key, &raw, self.ttl()).await {
                    warn!(error = %err, "rate limiter cache write failed");
                }
            }
            Err(err) => warn!(error = %err, "rate limiter bucket encode failed"),
        }
        allowed
    }
}
