#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use lipa_money::Currency;
use lipa_money::Money;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

mod worker;

pub use worker::SettlementWorker;
pub use worker::WorkerConfig;

pub type SettlementId = String;
pub type TransactionId = String;

pub type SettlementResult<T> = Result<T, SettlementError>;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("settlement {0} not found")]
    NotFound(SettlementId),
    #[error("illegal settlement transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SettlementStatus,
        to: SettlementStatus,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("network submission timed out")]
    Timeout,
    #[error("outcome handler failed: {0}")]
    Handler(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Submitted,
    Confirmed,
    Completed,
    Failed,
}

impl SettlementStatus {
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, SettlementStatus::Completed | SettlementStatus::Failed)
    }

    /// Legal next states. `Submitted -> Pending` is the retry edge: a failed
    /// or stale submission goes back onto the queue for resubmission.
    #[must_use]
    pub fn valid_transitions(&self) -> &[SettlementStatus] {
        match self {
            SettlementStatus::Pending => &[SettlementStatus::Submitted, SettlementStatus::Failed],
            SettlementStatus::Submitted => &[
                SettlementStatus::Confirmed,
                SettlementStatus::Pending,
                SettlementStatus::Failed,
            ],
            SettlementStatus::Confirmed => {
                &[SettlementStatus::Completed, SettlementStatus::Failed]
            }
            SettlementStatus::Completed | SettlementStatus::Failed => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// What the external network reports for a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkStatus {
    Pending,
    Confirmed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    /// Deterministic reference derived from the settlement id, so the
    /// network can deduplicate resubmissions of the same batch.
    pub batch_reference: String,
    pub network: String,
    pub currency: Currency,
    pub total: Money,
    pub status: SettlementStatus,
    pub submission_count: u32,
    pub transaction_ids: Vec<TransactionId>,
    pub external_hash: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub first_submitted_at: Option<DateTime<Utc>>,
    pub last_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSettlement {
    pub network: String,
    pub currency: Currency,
    pub total: Money,
    pub transaction_ids: Vec<TransactionId>,
}

#[must_use]
pub fn batch_reference(settlement_id: &str, currency: Currency) -> String {
    let mut hasher = Sha256::new();
    hasher.update(settlement_id.as_bytes());
    hasher.update(currency.code().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    format!("batch-{hex}")
}

/// The external settlement rail. Submission carries a 30 s deadline at the
/// worker; confirmation is polled.
#[async_trait]
pub trait SettlementNetwork: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, settlement: &Settlement) -> SettlementResult<String>;

    async fn confirm(&self, external_hash: &str) -> SettlementResult<NetworkStatus>;
}

/// Callbacks into the payment engine when a settlement reaches a terminal
/// state. Settlements and transactions reference each other by id only;
/// this trait is the seam that keeps the dependency one-directional.
#[async_trait]
pub trait SettlementOutcomeHandler: Send + Sync {
    /// Posts the reconciling journal entry and completes the linked
    /// transactions. Must be idempotent per settlement.
    async fn settlement_completed(&self, settlement: &Settlement) -> SettlementResult<()>;

    /// Compensates the linked transactions after a permanent failure.
    async fn settlement_failed(&self, settlement: &Settlement) -> SettlementResult<()>;
}

/// Work-queue storage for settlements. `claim_due` hands out short leases so
/// concurrent workers never double-drive one row, the in-memory analogue of
/// `SELECT ... FOR UPDATE SKIP LOCKED`.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn enqueue(&self, new: NewSettlement) -> SettlementResult<Settlement>;

    async fn get(&self, settlement_id: &SettlementId) -> SettlementResult<Settlement>;

    async fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> SettlementResult<Vec<Settlement>>;

    async fn mark_submitted(
        &self,
        settlement_id: &SettlementId,
        external_hash: &str,
        at: DateTime<Utc>,
    ) -> SettlementResult<Settlement>;

    async fn mark_confirmed(
        &self,
        settlement_id: &SettlementId,
        at: DateTime<Utc>,
    ) -> SettlementResult<Settlement>;

    async fn mark_completed(&self, settlement_id: &SettlementId) -> SettlementResult<Settlement>;

    async fn mark_failed(&self, settlement_id: &SettlementId) -> SettlementResult<Settlement>;

    /// Books a retry: increments `submission_count`, moves the row back to
    /// PENDING and schedules the next attempt.
    async fn reschedule(
        &self,
        settlement_id: &SettlementId,
        next_attempt_at: DateTime<Utc>,
    ) -> SettlementResult<Settlement>;

    /// Re-polls a SUBMITTED row later without burning an attempt.
    async fn poll_later(
        &self,
        settlement_id: &SettlementId,
        next_attempt_at: DateTime<Utc>,
    ) -> SettlementResult<Settlement>;
}

#[derive(Default)]
pub struct InMemorySettlementStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    settlements: HashMap<SettlementId, Settlement>,
    leases: HashMap<SettlementId, DateTime<Utc>>,
}

impl InMemorySettlementStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        settlement: &mut Settlement,
        to: SettlementStatus,
    ) -> SettlementResult<()> {
        if !settlement.status.can_transition_to(to) {
            return Err(SettlementError::InvalidTransition {
                from: settlement.status,
                to,
            });
        }
        settlement.status = to;
        settlement.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn enqueue(&self, new: NewSettlement) -> SettlementResult<Settlement> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let settlement = Settlement {
            batch_reference: batch_reference(&id, new.currency),
            id: id.clone(),
            network: new.network,
            currency: new.currency,
            total: new.total,
            status: SettlementStatus::Pending,
            submission_count: 0,
            transaction_ids: new.transaction_ids,
            external_hash: None,
            next_attempt_at: now,
            first_submitted_at: None,
            last_confirmed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.settlements.insert(id, settlement.clone());
        Ok(settlement)
    }

    async fn get(&self, settlement_id: &SettlementId) -> SettlementResult<Settlement> {
        let state = self.state.lock().await;
        state
            .settlements
            .get(settlement_id)
            .cloned()
            .ok_or_else(|| SettlementError::NotFound(settlement_id.clone()))
    }

    async fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> SettlementResult<Vec<Settlement>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<Settlement> = state
            .settlements
            .values()
            .filter(|settlement| {
                !settlement.status.is_final()
                    && settlement.next_attempt_at <= now
                    && state
                        .leases
                        .get(&settlement.id)
                        .is_none_or(|leased_until| *leased_until <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at));
        due.truncate(limit);
        for settlement in &due {
            state.leases.insert(settlement.id.clone(), now + lease);
        }
        Ok(due)
    }

    async fn mark_submitted(
        &self,
        settlement_id: &SettlementId,
        external_hash: &str,
        at: DateTime<Utc>,
    ) -> SettlementResult<Settlement> {
        let mut state = self.state.lock().await;
        let settlement = state
            .settlements
            .get_mut(settlement_id)
            .ok_or_else(|| SettlementError::NotFound(settlement_id.clone()))?;
        Self::transition(settlement, SettlementStatus::Submitted)?;
        settlement.external_hash = Some(external_hash.to_string());
        settlement.submission_count += 1;
        if settlement.first_submitted_at.is_none() {
            settlement.first_submitted_at = Some(at);
        }
        let updated = settlement.clone();
        state.leases.remove(settlement_id);
        Ok(updated)
    }

    async fn mark_confirmed(
        &self,
        settlement_id: &SettlementId,
        at: DateTime<Utc>,
    ) -> SettlementResult<Settlement> {
        let mut state = self.state.lock().await;
        let settlement = state
            .settlements
            .get_mut(settlement_id)
            .ok_or_else(|| SettlementError::NotFound(settlement_id.clone()))?;
        Self::transition(settlement, SettlementStatus::Confirmed)?;
        settlement.last_confirmed_at = Some(at);
        let updated = settlement.clone();
        state.leases.remove(settlement_id);
        Ok(updated)
    }

    async fn mark_completed(&self, settlement_id: &SettlementId) -> SettlementResult<Settlement> {
        let mut state = self.state.lock().await;
        let settlement = state
            .settlements
            .get_mut(settlement_id)
            .ok_or_else(|| SettlementError::NotFound(settlement_id.clone()))?;
        Self::transition(settlement, SettlementStatus::Completed)?;
        let updated = settlement.clone();
        state.leases.remove(settlement_id);
        Ok(updated)
    }

    async fn mark_failed(&self, settlement_id: &SettlementId) -> SettlementResult<Settlement> {
        let mut state = self.state.lock().await;
        let settlement = state
            .settlements
            .get_mut(settlement_id)
            .ok_or_else(|| SettlementError::NotFound(settlement_id.clone()))?;
        Self::transition(settlement, SettlementStatus::Failed)?;
        let updated = settlement.clone();
        state.leases.remove(settlement_id);
        Ok(updated)
    }

    async fn reschedule(
        &self,
        settlement_id: &SettlementId,
        next_attempt_at: DateTime<Utc>,
    ) -> SettlementResult<Settlement> {
        let mut state = self.state.lock().await;
        let settlement = state
            .settlements
            .get_mut(settlement_id)
            .ok_or_else(|| SettlementError::NotFound(settlement_id.clone()))?;
        if settlement.status == SettlementStatus::Submitted {
            Self::transition(settlement, SettlementStatus::Pending)?;
            settlement.external_hash = None;
        } else if settlement.status != SettlementStatus::Pending
            && settlement.status != SettlementStatus::Confirmed
        {
            return Err(SettlementError::InvalidTransition {
                from: settlement.status,
                to: SettlementStatus::Pending,
            });
        }
        settlement.submission_count += 1;
        settlement.next_attempt_at = next_attempt_at;
        settlement.updated_at = Utc::now();
        let updated = settlement.clone();
        state.leases.remove(settlement_id);
        Ok(updated)
    }

    async fn poll_later(
        &self,
        settlement_id: &SettlementId,
        next_attempt_at: DateTime<Utc>,
    ) -> SettlementResult<Settlement> {
        let mut state = self.state.lock().await;
        let settlement = state
            .settlements
            .get_mut(settlement_id)
            .ok_or_else(|| SettlementError::NotFound(settlement_id.clone()))?;
        settlement.next_attempt_at = next_attempt_at;
        settlement.updated_at = Utc::now();
        let updated = settlement.clone();
        state.leases.remove(settlement_id);
        Ok(updated)
    }
}
