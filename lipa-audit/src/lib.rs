#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type AuditResult<T> = Result<T, AuditError>;

/// Anchor for the first entry of a chain.
const CHAIN_ROOT: &str = "chain-root";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("audit chain broken at position {position} (entry {entry_id}): {detail}")]
    ChainBroken {
        position: usize,
        entry_id: String,
        detail: String,
    },
}

/// Every state-changing operation the engine performs, as a closed set.
/// Free-text actions are not accepted; an audit trail that cannot be
/// filtered by operation is not reviewable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "payment.posted")]
    PaymentPosted,
    #[serde(rename = "payment.pending_approval")]
    PaymentPendingApproval,
    #[serde(rename = "payment.approved")]
    PaymentApproved,
    #[serde(rename = "payment.admin_rejected")]
    PaymentAdminRejected,
    #[serde(rename = "payment.rejected")]
    PaymentRejected,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.compensated")]
    PaymentCompensated,
    #[serde(rename = "payment.settled")]
    PaymentSettled,
    #[serde(rename = "payment.reversed")]
    PaymentReversed,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
    #[serde(rename = "escrow.created")]
    EscrowCreated,
    #[serde(rename = "escrow.released")]
    EscrowReleased,
    #[serde(rename = "escrow.expired")]
    EscrowExpired,
    #[serde(rename = "dispute.opened")]
    DisputeOpened,
    #[serde(rename = "dispute.rejected")]
    DisputeRejected,
    #[serde(rename = "dispute.reversed")]
    DisputeReversed,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::PaymentPosted => "payment.posted",
            AuditAction::PaymentPendingApproval => "payment.pending_approval",
            AuditAction::PaymentApproved => "payment.approved",
            AuditAction::PaymentAdminRejected => "payment.admin_rejected",
            AuditAction::PaymentRejected => "payment.rejected",
            AuditAction::PaymentFailed => "payment.failed",
            AuditAction::PaymentCompensated => "payment.compensated",
            AuditAction::PaymentSettled => "payment.settled",
            AuditAction::PaymentReversed => "payment.reversed",
            AuditAction::PaymentRefunded => "payment.refunded",
            AuditAction::EscrowCreated => "escrow.created",
            AuditAction::EscrowReleased => "escrow.released",
            AuditAction::EscrowExpired => "escrow.expired",
            AuditAction::DisputeOpened => "dispute.opened",
            AuditAction::DisputeRejected => "dispute.rejected",
            AuditAction::DisputeReversed => "dispute.reversed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine reports: which transaction (or escrow) was touched, who
/// authorized it, what happened, and any supporting detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub entity_id: String,
    pub actor: String,
    pub action: AuditAction,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn validate(&self) -> AuditResult<()> {
        if self.entity_id.trim().is_empty() {
            return Err(AuditError::Validation(
                "audit event must name the entity it concerns".into(),
            ));
        }
        if self.actor.trim().is_empty() {
            return Err(AuditError::Validation(
                "audit event must name the authorizing actor".into(),
            ));
        }
        Ok(())
    }
}

/// A committed, immutable row of the trail. `hash` covers every field that
/// matters for accountability, the actor included, and chains onto the
/// previous entry's hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub entity_id: String,
    pub actor: String,
    pub action: AuditAction,
    pub occurred_at: DateTime<Utc>,
    pub details: serde_json::Value,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Canonical byte representation of the accountable fields. Timestamps
    /// are rendered at nanosecond precision so re-encoding cannot collide
    /// two distinct entries.
    fn canonical_line(
        entity_id: &str,
        actor: &str,
        action: AuditAction,
        occurred_at: DateTime<Utc>,
        details: &serde_json::Value,
    ) -> String {
        format!(
            "{entity_id}\n{actor}\n{action}\n{}\n{details}",
            occurred_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )
    }

    fn expected_hash(&self) -> String {
        chain_hash(
            &self.previous_hash,
            &Self::canonical_line(
                &self.entity_id,
                &self.actor,
                self.action,
                self.occurred_at,
                &self.details,
            ),
        )
    }
}

fn chain_hash(previous_hash: &str, canonical_line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_line.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Trail query: by entity, by operation, or the most recent slice.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub entity_id: Option<String>,
    pub action: Option<AuditAction>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> AuditResult<AuditEntry>;

    async fn records(&self, filter: AuditFilter) -> AuditResult<Vec<AuditEntry>>;
}

/// In-memory audit trail. Reads re-verify the whole chain first, so a
/// rewritten actor, action, or payload surfaces as `ChainBroken` instead of
/// silently becoming history.
#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn verify(entries: &[AuditEntry]) -> AuditResult<()> {
        let mut expected_previous = CHAIN_ROOT.to_string();
        for (position, entry) in entries.iter().enumerate() {
            if entry.previous_hash != expected_previous {
                return Err(AuditError::ChainBroken {
                    position,
                    entry_id: entry.id.clone(),
                    detail: "previous-hash link does not match".into(),
                });
            }
            if entry.expected_hash() != entry.hash {
                return Err(AuditError::ChainBroken {
                    position,
                    entry_id: entry.id.clone(),
                    detail: "entry content does not match its hash".into(),
                });
            }
            expected_previous = entry.hash.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, event: AuditEvent) -> AuditResult<AuditEntry> {
        event.validate()?;

        let mut entries = self.entries.write().await;
        let previous_hash = entries
            .last()
            .map_or_else(|| CHAIN_ROOT.to_string(), |entry| entry.hash.clone());

        let occurred_at = Utc::now();
        let hash = chain_hash(
            &previous_hash,
            &AuditEntry::canonical_line(
                &event.entity_id,
                &event.actor,
                event.action,
                occurred_at,
                &event.details,
            ),
        );

        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            entity_id: event.entity_id,
            actor: event.actor,
            action: event.action,
            occurred_at,
            details: event.details,
            previous_hash,
            hash,
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn records(&self, filter: AuditFilter) -> AuditResult<Vec<AuditEntry>> {
        let entries = self.entries.read().await;
        Self::verify(&entries)?;

        let mut selected: Vec<AuditEntry> = entries
            .iter()
            .filter(|entry| {
                filter
                    .entity_id
                    .as_ref()
                    .is_none_or(|entity_id| &entry.entity_id == entity_id)
            })
            .filter(|entry| {
                filter
                    .action
                    .is_none_or(|action| entry.action == action)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit
            && selected.len() > limit
        {
            selected.truncate(limit);
        }
        Ok(selected)
    }
}

/// Events the engine pushes to senders and receivers. Delivery transport is
/// a collaborator concern; the core only names the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEvent {
    PaymentCompleted,
    PaymentFailed,
    PaymentReceived,
    PaymentReversed,
    ApprovalPending,
    EscrowReleased,
    EscrowExpired,
    DisputeOpened,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user_id: &str, event: NotificationEvent, payload: serde_json::Value);
}

#[derive(Clone, Default)]
pub struct NoopNotificationSink;

#[async_trait]
impl NotificationSink for NoopNotificationSink {
    async fn notify(&self, _user_id: &str, _event: NotificationEvent, _payload: serde_json::Value) {
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub user_id: String,
    pub event: NotificationEvent,
    pub payload: serde_json::Value,
}

/// Test sink that records deliveries for assertion.
#[derive(Default)]
pub struct InMemoryNotificationSink {
    deliveries: RwLock<Vec<Delivery>>,
}

impl InMemoryNotificationSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        let guard = self.deliveries.read().await;
        guard.clone()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn notify(&self, user_id: &str, event: NotificationEvent, payload: serde_json::Value) {
        let mut guard = self.deliveries.write().await;
        guard.push(Delivery {
            user_id: user_id.to_string(),
            event,
            payload,
        });
    }
}
