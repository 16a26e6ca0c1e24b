#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Mutex;

pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

pub const DEFAULT_TTL_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("no in-progress claim for key {0}")]
    NoClaim(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// The response body persisted for replay. Replays must be byte-identical,
/// so the body is stored as the serialized string, not a re-encodable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status_code: u16,
    pub body: String,
}

/// Outcome of claiming a key before doing any work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// No prior record: the caller owns the key and must `complete` or
    /// `abort` it.
    First,
    /// A completed record with a matching fingerprint: return this response
    /// without side effects.
    Replay(StoredResponse),
    /// A matching claim is still in flight; the caller should surface a
    /// retry-later conflict.
    ReplayPending,
    /// Same key, different request body.
    Conflict,
}

/// SHA-256 over the canonical JSON encoding. `serde_json` maps are ordered,
/// so two semantically equal bodies produce the same fingerprint.
#[must_use]
pub fn fingerprint(body: &serde_json::Value) -> String {
    fingerprint_bytes(body.to_string().as_bytes())
}

#[must_use]
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claims `(route, key)`. The first caller wins and must
    /// later `complete` or `abort`; everyone else observes the prior state.
    async fn claim(&self, route: &str, key: &str, fingerprint: &str)
    -> IdempotencyResult<Claim>;

    /// Moves an in-progress claim to completed and stores the response for
    /// the TTL window.
    async fn complete(
        &self,
        route: &str,
        key: &str,
        response: StoredResponse,
    ) -> IdempotencyResult<()>;

    /// Drops an in-progress claim so a later retry may proceed.
    async fn abort(&self, route: &str, key: &str) -> IdempotencyResult<()>;
}

enum RecordState {
    InProgress,
    Completed(StoredResponse),
}

struct Record {
    fingerprint: String,
    state: RecordState,
    expires_at: DateTime<Utc>,
}

/// In-memory `IdempotencyStore`. The mutex gives `claim` the atomicity a
/// production store gets from a unique index (or `SET NX` on Redis).
pub struct InMemoryIdempotencyStore {
    ttl: Duration,
    records: Mutex<HashMap<(String, String), Record>>,
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::with_ttl(Duration::hours(DEFAULT_TTL_HOURS))
    }
}

impl InMemoryIdempotencyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn composite_key(route: &str, key: &str) -> (String, String) {
        (route.to_string(), key.to_string())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn claim(
        &self,
        route: &str,
        key: &str,
        fingerprint: &str,
    ) -> IdempotencyResult<Claim> {
        if key.trim().is_empty() {
            return Err(IdempotencyError::Validation(
                "idempotency key must be provided".into(),
            ));
        }

        let mut records = self.records.lock().await;
        let composite = Self::composite_key(route, key);
        let now = Utc::now();

        if let Some(record) = records.get(&composite) {
            if record.expires_at <= now {
                records.remove(&composite);
            } else if record.fingerprint != fingerprint {
                return Ok(Claim::Conflict);
            } else {
                return Ok(match &record.state {
                    RecordState::InProgress => Claim::ReplayPending,
                    RecordState::Completed(response) => Claim::Replay(response.clone()),
                });
            }
        }

        records.insert(
            composite,
            Record {
                fingerprint: fingerprint.to_string(),
                state: RecordState::InProgress,
                expires_at: now + self.ttl,
            },
        );
        Ok(Claim::First)
    }

    async fn complete(
        &self,
        route: &str,
        key: &str,
        response: StoredResponse,
    ) -> IdempotencyResult<()> {
        let mut records = self.records.lock().await;
        let composite = Self::composite_key(route, key);
        let record = records
            .get_mut(&composite)
            .ok_or_else(|| IdempotencyError::NoClaim(key.to_string()))?;
        if !matches!(record.state, RecordState::InProgress) {
            return Err(IdempotencyError::Storage(format!(
                "claim for key {key} is already completed"
            )));
        }
        record.state = RecordState::Completed(response);
        record.expires_at = Utc::now() + self.ttl;
        Ok(())
    }

    async fn abort(&self, route: &str, key: &str) -> IdempotencyResult<()> {
        let mut records = self.records.lock().await;
        let composite = Self::composite_key(route, key);
        match records.get(&composite) {
            Some(record) if matches!(record.state, RecordState::InProgress) => {
                records.remove(&composite);
                Ok(())
            }
            Some(_) => Err(IdempotencyError::Storage(format!(
                "cannot abort completed claim for key {key}"
            ))),
            None => Err(IdempotencyError::NoClaim(key.to_string())),
        }
    }
}
