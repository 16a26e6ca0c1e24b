#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use lipa_ledger::EntryId;
use lipa_money::Currency;
use lipa_money::Money;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

mod engine;

pub use engine::EngineConfig;
pub use engine::EngineParts;
pub use engine::InitiateResult;
pub use engine::PaymentEngine;
pub use engine::Receipt;

pub type TransactionId = String;
pub type UserId = String;
pub type WalletId = String;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("idempotency key reused with a different request body")]
    IdempotencyConflict,
    #[error("an identical request is still in flight")]
    RequestInFlight,
    #[error("{actor} may not perform this operation")]
    Forbidden { actor: String },
    #[error("system is paused")]
    SystemPaused,
    #[error("no exchange rate available for {base}->{target}")]
    RateUnavailable { base: Currency, target: Currency },
    #[error("downstream call timed out: {0}")]
    DownstreamTimeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Business-level lifecycle of a payment attempt. Writes go through
/// `can_transition_to`; an illegal transition is an internal fault, never
/// user error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Draft,
    Pending,
    PendingApproval,
    Processing,
    Reserved,
    Settling,
    Completed,
    Disputed,
    Failed,
    Cancelled,
    Reversed,
    Refunded,
}

impl TransactionStatus {
    /// The five resting states a transaction can end in. COMPLETED can
    /// still leave through a dispute; the other four cannot move at all.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed
                | TransactionStatus::Failed
                | TransactionStatus::Cancelled
                | TransactionStatus::Reversed
                | TransactionStatus::Refunded
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Failed
                | TransactionStatus::Cancelled
                | TransactionStatus::Reversed
                | TransactionStatus::Refunded
        )
    }

    #[must_use]
    pub fn valid_transitions(&self) -> &[TransactionStatus] {
        use TransactionStatus::*;
        match self {
            Draft => &[Pending, Failed],
            Pending => &[PendingApproval, Processing, Failed],
            PendingApproval => &[Processing, Cancelled, Failed],
            Processing => &[Reserved, Failed],
            Reserved => &[Settling, Completed, Cancelled, Failed],
            Settling => &[Completed, Reversed, Failed],
            Completed => &[Disputed, Refunded],
            Disputed => &[Completed, Reversed],
            Failed | Cancelled | Reversed | Refunded => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Payment,
    Transfer,
    Escrow,
    Refund,
    Reversal,
    Settlement,
}

/// Terms recorded for an escrow at creation. Release is restricted to the
/// named actor (or an admin); past `expires_at` the escrow may be expired
/// and its reservation compensated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowTerms {
    pub release_actor: UserId,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeResolution {
    Rejected,
    Reversed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub reason: String,
    pub initiator: UserId,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<DisputeResolution>,
}

/// The business record of one payment attempt. Balance effects live in the
/// journal; this row carries the narrative (who, what, why, and how far the
/// state machine got).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Client reference doubling as the idempotency key.
    pub reference: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub sender_wallet_id: WalletId,
    pub receiver_wallet_id: WalletId,
    /// What the receiver is meant to get, pre-conversion, in the source
    /// currency.
    pub amount: Money,
    pub destination_currency: Currency,
    /// Sell rate the conversion was quoted at.
    pub quoted_rate: Option<Decimal>,
    /// Mid rate behind the quote; the settlement entry uses it to realize
    /// the spread gain.
    pub quoted_mid: Option<Decimal>,
    /// Amount credited to the receiver, in the destination currency.
    pub converted: Money,
    pub fee: Money,
    /// Total debited from the sender: amount + fee, in source currency.
    pub net: Money,
    pub status: TransactionStatus,
    pub status_reason: Option<String>,
    pub transaction_type: TransactionType,
    pub channel: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub settlement_id: Option<String>,
    pub journal_entry_ids: Vec<EntryId>,
    pub external_hash: Option<String>,
    pub escrow: Option<EscrowTerms>,
    pub dispute: Option<Dispute>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    #[must_use]
    pub fn is_cross_currency(&self) -> bool {
        self.amount.currency != self.destination_currency
    }
}

/// Persistence seam for transaction rows. The engine is the only writer.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, transaction: Transaction) -> EngineResult<Transaction>;

    async fn get(&self, transaction_id: &TransactionId) -> EngineResult<Transaction>;

    async fn save(&self, transaction: Transaction) -> EngineResult<Transaction>;

    async fn list_for_wallet(&self, wallet_id: &WalletId) -> EngineResult<Vec<Transaction>>;

    async fn list_by_status(&self, status: TransactionStatus) -> EngineResult<Vec<Transaction>>;
}

#[derive(Default)]
pub struct InMemoryTransactionStore {
    state: RwLock<TransactionState>,
}

#[derive(Default)]
struct TransactionState {
    transactions: HashMap<TransactionId, Transaction>,
    order: Vec<TransactionId>,
}

impl InMemoryTransactionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, transaction: Transaction) -> EngineResult<Transaction> {
        let mut state = self.state.write().await;
        if state.transactions.contains_key(&transaction.id) {
            return Err(EngineError::Internal(format!(
                "transaction {} already exists",
                transaction.id
            )));
        }
        state.order.push(transaction.id.clone());
        state
            .transactions
            .insert(transaction.id.clone(), transaction.clone());
        Ok(transaction)
    }

    async fn get(&self, transaction_id: &TransactionId) -> EngineResult<Transaction> {
        let state = self.state.read().await;
        state
            .transactions
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("transaction {transaction_id}")))
    }

    async fn save(&self, transaction: Transaction) -> EngineResult<Transaction> {
        let mut state = self.state.write().await;
        if !state.transactions.contains_key(&transaction.id) {
            return Err(EngineError::NotFound(format!(
                "transaction {}",
                transaction.id
            )));
        }
        state
            .transactions
            .insert(transaction.id.clone(), transaction.clone());
        Ok(transaction)
    }

    async fn list_for_wallet(&self, wallet_id: &WalletId) -> EngineResult<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.transactions.get(id))
            .filter(|transaction| {
                &transaction.sender_wallet_id == wallet_id
                    || &transaction.receiver_wallet_id == wallet_id
            })
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: TransactionStatus) -> EngineResult<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.transactions.get(id))
            .filter(|transaction| transaction.status == status)
            .cloned()
            .collect())
    }
}

/// How the caller names the receiving side of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverRef {
    WalletAddress(String),
    UserId(UserId),
}

/// An engine-level payment request, already authenticated by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Client reference; doubles as the idempotency key.
    pub reference: String,
    pub sender_id: UserId,
    pub receiver: ReceiverRef,
    pub amount: Money,
    pub destination_currency: Option<Currency>,
    pub description: Option<String>,
    pub channel: Option<String>,
    pub device_hash: Option<String>,
    pub ip_address: Option<String>,
    /// Set by the gateway's geo heuristics; weighs into the risk score.
    #[serde(default)]
    pub location_suspicious: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}
