use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use lipa_audit::AuditAction;
use lipa_audit::AuditEvent;
use lipa_audit::AuditSink;
use lipa_audit::NotificationEvent;
use lipa_audit::NotificationSink;
use lipa_directory::UserDirectory;
use lipa_fx::FxError;
use lipa_fx::FxService;
use lipa_fx::RateQuote;
use lipa_idempotency::Claim;
use lipa_idempotency::IdempotencyStore;
use lipa_idempotency::StoredResponse;
use lipa_ledger::AccountRef;
use lipa_ledger::EntryPurpose;
use lipa_ledger::JournalEntry;
use lipa_ledger::LedgerError;
use lipa_ledger::LedgerStore;
use lipa_ledger::NewJournalEntry;
use lipa_ledger::NewPosting;
use lipa_money::Currency;
use lipa_money::Money;
use lipa_monitor::BehavioralMonitor;
use lipa_risk::ActivityStore;
use lipa_risk::RiskEngine;
use lipa_risk::RiskOutcome;
use lipa_risk::RiskRejection;
use lipa_risk::RiskRequest;
use lipa_settlement::NewSettlement;
use lipa_settlement::Settlement;
use lipa_settlement::SettlementError;
use lipa_settlement::SettlementOutcomeHandler;
use lipa_settlement::SettlementResult;
use lipa_settlement::SettlementStore;
use lipa_wallet::CreateWalletRequest;
use lipa_wallet::DebitSource;
use lipa_wallet::Wallet;
use lipa_wallet::WalletError;
use lipa_wallet::WalletStore;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::Dispute;
use crate::DisputeResolution;
use crate::EngineError;
use crate::EngineResult;
use crate::EscrowTerms;
use crate::PaymentRequest;
use crate::ReceiverRef;
use crate::Transaction;
use crate::TransactionId;
use crate::TransactionStatus;
use crate::TransactionStore;
use crate::TransactionType;
use crate::UserId;
use crate::WalletId;

const ROUTE_PAYMENTS: &str = "payments.initiate";
const ROUTE_ESCROW: &str = "escrow.create";

/// Machine-readable reason codes stored on failed transactions. The facade
/// maps them onto the public error taxonomy.
pub(crate) mod reason {
    pub const INSUFFICIENT_FUNDS: &str = "INSUFFICIENT_FUNDS";
    pub const RISK_REJECTED: &str = "RISK_REJECTED";
    pub const WALLET_NOT_ACTIVE: &str = "WALLET_NOT_ACTIVE";
    pub const SETTLEMENT_FAILED: &str = "SETTLEMENT_FAILED";
    pub const ESCROW_EXPIRED: &str = "ESCROW_EXPIRED";
    pub const ADMIN_REJECTED: &str = "ADMIN_REJECTED";
    pub const DISPUTE_REVERSED: &str = "DISPUTE_REVERSED";
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Proportional fee on the source amount.
    pub fee_rate: Decimal,
    /// Floor for the fee, in source-currency units.
    pub min_fee: Decimal,
    pub default_channel: String,
    /// Name of the external network cross-border legs settle on.
    pub settlement_network: String,
    /// Create the receiver wallet on the fly for self-transfers into a
    /// currency the sender does not hold yet.
    pub auto_create_self_wallets: bool,
    /// Deadline for each store round trip.
    pub db_timeout: StdDuration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_rate: Decimal::new(15, 3),
            min_fee: Decimal::ZERO,
            default_channel: "api".into(),
            settlement_network: "interledger".into(),
            auto_create_self_wallets: true,
            db_timeout: StdDuration::from_secs(10),
        }
    }
}

/// Everything the engine talks to. Wired once at startup; every field is a
/// seam with an in-memory implementation for tests.
pub struct EngineParts {
    pub ledger: Arc<dyn LedgerStore>,
    pub wallets: Arc<dyn WalletStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub fx: Arc<FxService>,
    pub risk: Arc<RiskEngine>,
    pub monitor: Arc<BehavioralMonitor>,
    pub activity: Arc<dyn ActivityStore>,
    pub directory: Arc<dyn UserDirectory>,
    pub settlements: Arc<dyn SettlementStore>,
    pub audit: Arc<dyn AuditSink>,
    pub notifications: Arc<dyn NotificationSink>,
    /// Wakes the settlement worker after an enqueue.
    pub settlement_kick: Option<Arc<Notify>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitiateResult {
    pub transaction: Transaction,
    /// True when the response was replayed from the idempotency store and
    /// no new side effects happened.
    pub replayed: bool,
}

/// How far `post_and_apply` got before failing, so compensation unwinds
/// exactly the applied steps and nothing more.
struct ApplyFailure {
    cause: EngineError,
    debited: bool,
}

/// Derived view for `GET /payments/{id}/receipt`: display names, masked
/// wallet addresses and the money totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub sender_name: String,
    pub receiver_name: String,
    pub sender_wallet_suffix: String,
    pub receiver_wallet_suffix: String,
    pub amount: Money,
    pub fee: Money,
    pub total_debited: Money,
    pub converted: Money,
    pub quoted_rate: Option<Decimal>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The payment state machine. One instance per process; the posting lock
/// serializes the reserve→post→apply critical section so observers only
/// ever see a payment fully applied or not at all.
pub struct PaymentEngine {
    config: EngineConfig,
    parts: EngineParts,
    posting_lock: Mutex<()>,
}

impl PaymentEngine {
    #[must_use]
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        Self {
            config,
            parts,
            posting_lock: Mutex::new(()),
        }
    }

    async fn with_timeout<T, F>(&self, what: &str, future: F) -> EngineResult<T>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.config.db_timeout, future)
            .await
            .map_err(|_| EngineError::DownstreamTimeout(what.to_string()))
    }

    fn internal(&self, context: &str, detail: impl std::fmt::Display) -> EngineError {
        self.parts.risk.breaker().record_failure(Utc::now());
        EngineError::Internal(format!("{context}: {detail}"))
    }

    /// Every status write funnels through here; an illegal edge is an
    /// engine bug, counted by the breaker and surfaced as INTERNAL.
    fn transition(
        &self,
        transaction: &mut Transaction,
        to: TransactionStatus,
    ) -> EngineResult<()> {
        if !transaction.status.can_transition_to(to) {
            return Err(self.internal(
                "illegal status transition",
                format!("{:?} -> {to:?} on {}", transaction.status, transaction.id),
            ));
        }
        transaction.status = to;
        transaction.updated_at = Utc::now();
        Ok(())
    }

    fn fee_for(&self, amount: &Money) -> Money {
        let proportional = amount.amount * self.config.fee_rate;
        let fee = proportional.max(self.config.min_fee);
        Money::new(fee, amount.currency).round_up_minor()
    }

    /// Annotates the metadata bag without assuming the client sent an
    /// object; scalar metadata is left untouched.
    fn stamp_metadata(transaction: &mut Transaction, key: &str, value: serde_json::Value) {
        if transaction.metadata.is_object() || transaction.metadata.is_null() {
            transaction.metadata[key] = value;
        }
    }

    async fn audit(
        &self,
        entity_id: &str,
        actor: &str,
        action: AuditAction,
        details: serde_json::Value,
    ) {
        if let Err(err) = self
            .parts
            .audit
            .record(AuditEvent {
                entity_id: entity_id.to_string(),
                actor: actor.to_string(),
                action,
                details,
            })
            .await
        {
            warn!(entity_id, action = %action, error = %err, "audit append failed");
        }
    }

    async fn notify(&self, user_id: &UserId, event: NotificationEvent, transaction: &Transaction) {
        self.parts
            .notifications
            .notify(
                user_id,
                event,
                serde_json::json!({
                    "transaction_id": transaction.id,
                    "reference": transaction.reference,
                    "status": transaction.status,
                }),
            )
            .await;
    }

    async fn quote(&self, base: Currency, target: Currency) -> EngineResult<RateQuote> {
        match self.parts.fx.rate(base, target).await {
            Ok(quote) => Ok(quote),
            Err(FxError::RateUnavailable { base, target }) => {
                Err(EngineError::RateUnavailable { base, target })
            }
            Err(err) => Err(self.internal("fx service", err)),
        }
    }

    /// Creates a wallet and opens its mirror ledger account.
    pub async fn create_wallet(
        &self,
        user_id: &UserId,
        currency: Currency,
    ) -> EngineResult<Wallet> {
        let user = self
            .parts
            .directory
            .find_by_id(user_id)
            .await
            .map_err(|err| EngineError::NotFound(format!("user {user_id}: {err}")))?;
        let wallet = self
            .parts
            .wallets
            .create(CreateWalletRequest {
                user_id: user.id,
                country: user.country,
                currency,
            })
            .await
            .map_err(|err| match err {
                WalletError::AlreadyExists { .. } | WalletError::CountryCurrencyMismatch { .. } => {
                    EngineError::Validation(err.to_string())
                }
                other => self.internal("wallet create", other),
            })?;
        self.parts
            .ledger
            .open_account(AccountRef::Wallet(wallet.id.clone()), currency)
            .await
            .map_err(|err| self.internal("ledger account open", err))?;
        Ok(wallet)
    }

    /// Credits external value into a wallet against the settlement nostro.
    /// Top-ups from the cash-in rails land here.
    pub async fn deposit(
        &self,
        wallet_id: &WalletId,
        amount: Money,
        reference: &str,
    ) -> EngineResult<Transaction> {
        if !amount.is_positive() {
            return Err(EngineError::Validation("amount must be positive".into()));
        }
        let wallet = self
            .parts
            .wallets
            .get(wallet_id)
            .await
            .map_err(|err| EngineError::NotFound(err.to_string()))?;

        let now = Utc::now();
        let mut transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            reference: reference.to_string(),
            sender_id: wallet.user_id.clone(),
            receiver_id: wallet.user_id.clone(),
            sender_wallet_id: wallet.id.clone(),
            receiver_wallet_id: wallet.id.clone(),
            amount,
            destination_currency: amount.currency,
            quoted_rate: None,
            quoted_mid: None,
            converted: amount,
            fee: Money::zero(amount.currency),
            net: amount,
            status: TransactionStatus::Draft,
            status_reason: None,
            transaction_type: TransactionType::Transfer,
            channel: self.config.default_channel.clone(),
            metadata: serde_json::json!({"kind": "deposit"}),
            settlement_id: None,
            journal_entry_ids: Vec::new(),
            external_hash: None,
            escrow: None,
            dispute: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.transition(&mut transaction, TransactionStatus::Pending)?;

        let entry = self
            .parts
            .ledger
            .post(NewJournalEntry {
                transaction_id: transaction.id.clone(),
                purpose: EntryPurpose::Payment,
                memo: Some(format!("deposit {reference}")),
                postings: vec![
                    NewPosting::debit(
                        AccountRef::SettlementNostro(amount.currency),
                        amount,
                    ),
                    NewPosting::credit(AccountRef::Wallet(wallet.id.clone()), amount),
                ],
            })
            .await
            .map_err(|err| self.internal("deposit posting", err))?;
        self.parts
            .wallets
            .credit(&wallet.id, &amount)
            .await
            .map_err(|err| self.internal("deposit credit", err))?;

        transaction.journal_entry_ids.push(entry.id);
        self.transition(&mut transaction, TransactionStatus::Processing)?;
        self.transition(&mut transaction, TransactionStatus::Reserved)?;
        self.transition(&mut transaction, TransactionStatus::Completed)?;
        transaction.completed_at = Some(Utc::now());
        self.parts.transactions.insert(transaction.clone()).await?;
        Ok(transaction)
    }

    pub async fn initiate_payment(&self, request: PaymentRequest) -> EngineResult<InitiateResult> {
        self.intake(request, TransactionType::Payment, None, ROUTE_PAYMENTS)
            .await
    }

    /// Identical to a payment up to reservation, but halts at RESERVED with
    /// the release condition recorded.
    pub async fn create_escrow(
        &self,
        request: PaymentRequest,
        terms: EscrowTerms,
    ) -> EngineResult<InitiateResult> {
        self.intake(request, TransactionType::Escrow, Some(terms), ROUTE_ESCROW)
            .await
    }

    async fn intake(
        &self,
        request: PaymentRequest,
        transaction_type: TransactionType,
        escrow: Option<EscrowTerms>,
        route: &str,
    ) -> EngineResult<InitiateResult> {
        if request.reference.trim().is_empty() {
            return Err(EngineError::Validation(
                "a client reference is required".into(),
            ));
        }
        if !request.amount.is_positive() {
            return Err(EngineError::Validation("amount must be positive".into()));
        }

        // Idempotency claim precedes every side effect.
        let body = serde_json::to_value(&request)
            .map_err(|err| self.internal("request fingerprint", err))?;
        let fingerprint = lipa_idempotency::fingerprint(&body);
        let claim = self
            .parts
            .idempotency
            .claim(route, &request.reference, &fingerprint)
            .await
            .map_err(|err| self.internal("idempotency claim", err))?;
        match claim {
            Claim::First => {}
            Claim::Replay(stored) => {
                let transaction: Transaction = serde_json::from_str(&stored.body)
                    .map_err(|err| self.internal("stored response decode", err))?;
                return Ok(InitiateResult {
                    transaction,
                    replayed: true,
                });
            }
            Claim::ReplayPending => return Err(EngineError::RequestInFlight),
            Claim::Conflict => return Err(EngineError::IdempotencyConflict),
        }

        match self
            .intake_claimed(&request, transaction_type, escrow, route)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                // Transient outcomes free the key so the client may retry;
                // the claim survives only when a definitive response was
                // stored.
                if let Err(abort_err) = self
                    .parts
                    .idempotency
                    .abort(route, &request.reference)
                    .await
                {
                    warn!(reference = request.reference, error = %abort_err, "claim abort failed");
                }
                Err(err)
            }
        }
    }

    async fn intake_claimed(
        &self,
        request: &PaymentRequest,
        transaction_type: TransactionType,
        escrow: Option<EscrowTerms>,
        route: &str,
    ) -> EngineResult<InitiateResult> {
        let sender = self
            .parts
            .directory
            .find_by_id(&request.sender_id)
            .await
            .map_err(|err| EngineError::NotFound(format!("sender: {err}")))?;
        if !sender.active {
            return Err(EngineError::Validation(format!(
                "sender {} is not active",
                sender.id
            )));
        }

        let sender_wallet = self
            .parts
            .wallets
            .find_for_user(&request.sender_id, request.amount.currency)
            .await
            .map_err(|err| EngineError::NotFound(format!("sender wallet: {err}")))?;

        let receiver_wallet = self.resolve_receiver_wallet(request, &sender).await?;
        if receiver_wallet.id == sender_wallet.id {
            return Err(EngineError::Validation(
                "sender and receiver wallets must differ".into(),
            ));
        }
        if let Some(requested) = request.destination_currency
            && requested != receiver_wallet.currency
        {
            return Err(EngineError::Validation(format!(
                "receiver wallet holds {}, not {requested}",
                receiver_wallet.currency
            )));
        }

        let now = Utc::now();
        let anomalies = self
            .parts
            .monitor
            .detect(
                &request.sender_id,
                request.amount.amount,
                &receiver_wallet.user_id,
                now,
            )
            .await;
        let outcome = self
            .parts
            .risk
            .assess(&RiskRequest {
                sender: request.sender_id.clone(),
                receiver: receiver_wallet.user_id.clone(),
                amount: request.amount.amount,
                device_hash: request.device_hash.clone(),
                ip_address: request.ip_address.clone(),
                location_suspicious: request.location_suspicious,
                anomalies,
            })
            .await
            .map_err(|err| self.internal("risk assessment", err))?;

        let mut transaction = self.new_transaction(
            request,
            transaction_type,
            escrow,
            &sender_wallet,
            &receiver_wallet,
            now,
        );
        self.transition(&mut transaction, TransactionStatus::Pending)?;

        let score = match outcome {
            RiskOutcome::Reject(RiskRejection::SystemPaused) => {
                return Err(EngineError::SystemPaused);
            }
            RiskOutcome::Reject(rejection) => {
                return self
                    .finish_rejected(transaction, &rejection, route, request)
                    .await;
            }
            RiskOutcome::RequireApproval { score } => {
                self.transition(&mut transaction, TransactionStatus::PendingApproval)?;
                Self::stamp_metadata(&mut transaction, "risk_score", serde_json::json!(score));
                let transaction = self.parts.transactions.insert(transaction).await?;
                self.audit(
                    &transaction.id,
                    &request.sender_id,
                    AuditAction::PaymentPendingApproval,
                    serde_json::json!({"score": score}),
                )
                .await;
                self.notify(
                    &transaction.sender_id,
                    NotificationEvent::ApprovalPending,
                    &transaction,
                )
                .await;
                return self
                    .finish_stored(transaction, route, &request.reference, 202)
                    .await;
            }
            RiskOutcome::Allow { score } => score,
        };
        Self::stamp_metadata(&mut transaction, "risk_score", serde_json::json!(score));

        // Quote and price the leg before touching any balance.
        self.price(&mut transaction).await?;

        self.transition(&mut transaction, TransactionStatus::Processing)?;

        // Reserve, insert, post, apply, all under the posting lock so the
        // payment is observed all-or-nothing.
        let _guard = self.posting_lock.lock().await;
        let reserved = self
            .with_timeout(
                "wallet reserve",
                self.parts.wallets.reserve(&sender_wallet.id, &transaction.net),
            )
            .await?;
        match reserved {
            Ok(_) => {}
            Err(WalletError::InsufficientFunds { .. }) => {
                self.transition(&mut transaction, TransactionStatus::Failed)?;
                transaction.status_reason = Some(reason::INSUFFICIENT_FUNDS.to_string());
                let transaction = self.parts.transactions.insert(transaction).await?;
                self.audit(
                    &transaction.id,
                    &request.sender_id,
                    AuditAction::PaymentFailed,
                    serde_json::json!({"reason": reason::INSUFFICIENT_FUNDS}),
                )
                .await;
                self.notify(
                    &transaction.sender_id,
                    NotificationEvent::PaymentFailed,
                    &transaction,
                )
                .await;
                return self
                    .finish_stored(transaction, route, &request.reference, 422)
                    .await;
            }
            Err(WalletError::NotActive(_)) => {
                self.transition(&mut transaction, TransactionStatus::Failed)?;
                transaction.status_reason = Some(reason::WALLET_NOT_ACTIVE.to_string());
                let transaction = self.parts.transactions.insert(transaction).await?;
                return self
                    .finish_stored(transaction, route, &request.reference, 422)
                    .await;
            }
            Err(other) => return Err(self.internal("wallet reserve", other)),
        }

        if let Err(err) = self
            .parts
            .activity
            .record_debit(&request.sender_id, transaction.net.amount, now)
            .await
        {
            warn!(error = %err, "activity debit record failed");
        }

        self.transition(&mut transaction, TransactionStatus::Reserved)?;
        let mut transaction = self.parts.transactions.insert(transaction).await?;

        if transaction.transaction_type == TransactionType::Escrow {
            // Escrow halts here; funds stay reserved until release or
            // expiry.
            self.audit(
                &transaction.id,
                &request.sender_id,
                AuditAction::EscrowCreated,
                serde_json::json!({"expires_at": transaction.escrow.as_ref().and_then(|terms| terms.expires_at)}),
            )
            .await;
            return self
                .finish_stored(transaction, route, &request.reference, 201)
                .await;
        }

        match self.post_and_apply(&mut transaction, EntryPurpose::Payment).await {
            Ok(()) => {}
            Err(failure) => {
                // A deadline expiry after reservation is compensated and
                // then surfaced as retryable: the claim is freed and the
                // unwound attempt leaves nothing behind to conflict with.
                let timed_out = match &failure.cause {
                    EngineError::DownstreamTimeout(what) => Some(what.clone()),
                    _ => None,
                };
                self.compensate_reservation(&mut transaction, failure).await?;
                let transaction = self.parts.transactions.save(transaction.clone()).await?;
                if let Some(what) = timed_out {
                    return Err(EngineError::DownstreamTimeout(what));
                }
                return self
                    .finish_stored(transaction, route, &request.reference, 500)
                    .await;
            }
        }

        let transaction = self.parts.transactions.save(transaction).await?;
        self.audit(
            &transaction.id,
            &request.sender_id,
            AuditAction::PaymentPosted,
            serde_json::json!({
                "status": transaction.status,
                "amount": transaction.amount,
                "fee": transaction.fee,
            }),
        )
        .await;
        self.finish_stored(transaction, route, &request.reference, 201)
            .await
    }

    fn new_transaction(
        &self,
        request: &PaymentRequest,
        transaction_type: TransactionType,
        escrow: Option<EscrowTerms>,
        sender_wallet: &Wallet,
        receiver_wallet: &Wallet,
        now: DateTime<Utc>,
    ) -> Transaction {
        Transaction {
            id: Uuid::new_v4().to_string(),
            reference: request.reference.clone(),
            sender_id: request.sender_id.clone(),
            receiver_id: receiver_wallet.user_id.clone(),
            sender_wallet_id: sender_wallet.id.clone(),
            receiver_wallet_id: receiver_wallet.id.clone(),
            amount: request.amount,
            destination_currency: receiver_wallet.currency,
            quoted_rate: None,
            quoted_mid: None,
            converted: Money::zero(receiver_wallet.currency),
            fee: Money::zero(request.amount.currency),
            net: request.amount,
            status: TransactionStatus::Draft,
            status_reason: None,
            transaction_type,
            channel: request
                .channel
                .clone()
                .unwrap_or_else(|| self.config.default_channel.clone()),
            metadata: request.metadata.clone(),
            settlement_id: None,
            journal_entry_ids: Vec::new(),
            external_hash: None,
            escrow,
            dispute: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Fills fee, rate and converted amount on a transaction that has not
    /// been priced yet.
    async fn price(&self, transaction: &mut Transaction) -> EngineResult<()> {
        let fee = self.fee_for(&transaction.amount);
        transaction.fee = fee;
        transaction.net = transaction
            .amount
            .checked_add(&fee)
            .map_err(|err| self.internal("fee addition", err))?;

        if transaction.is_cross_currency() {
            let quote = self
                .quote(transaction.amount.currency, transaction.destination_currency)
                .await?;
            transaction.quoted_rate = Some(quote.sell);
            transaction.quoted_mid = Some(quote.mid);
            transaction.converted = transaction
                .amount
                .convert(quote.sell, transaction.destination_currency)
                .map_err(|err| self.internal("conversion", err))?;
        } else {
            transaction.quoted_rate = None;
            transaction.quoted_mid = None;
            transaction.converted = transaction.amount;
        }
        Ok(())
    }

    fn payment_postings(&self, transaction: &Transaction) -> Vec<NewPosting> {
        let source = transaction.amount.currency;
        let mut postings = vec![
            NewPosting::debit(
                AccountRef::Wallet(transaction.sender_wallet_id.clone()),
                transaction.net,
            ),
            NewPosting::credit(AccountRef::FeeIncome(source), transaction.fee),
        ];
        if transaction.is_cross_currency() {
            let destination = transaction.destination_currency;
            postings.push(NewPosting::credit(
                AccountRef::SuspenseInflight(source),
                transaction.amount,
            ));
            postings.push(NewPosting::debit(
                AccountRef::SuspenseInflight(destination),
                transaction.converted,
            ));
            postings.push(NewPosting::credit(
                AccountRef::Wallet(transaction.receiver_wallet_id.clone()),
                transaction.converted,
            ));
        } else {
            postings.push(NewPosting::credit(
                AccountRef::Wallet(transaction.receiver_wallet_id.clone()),
                transaction.amount,
            ));
        }
        // Zero fees would produce a zero posting, which the ledger rejects.
        postings.retain(|posting| !posting.amount.is_zero());
        postings
    }

    /// From RESERVED: post the journal entry, move wallet balances, and
    /// transition to COMPLETED (same currency) or SETTLING (cross-border).
    /// On failure the error reports how far the apply got so compensation
    /// can unwind exactly what happened.
    async fn post_and_apply(
        &self,
        transaction: &mut Transaction,
        purpose: EntryPurpose,
    ) -> Result<(), ApplyFailure> {
        let posted = self
            .with_timeout(
                "ledger post",
                self.parts.ledger.post(NewJournalEntry {
                    transaction_id: transaction.id.clone(),
                    purpose,
                    memo: transaction.status_reason.clone(),
                    postings: self.payment_postings(transaction),
                }),
            )
            .await
            .and_then(|inner| inner.map_err(|err| self.internal("ledger post", err)));
        let entry = match posted {
            Ok(entry) => entry,
            Err(cause) => {
                return Err(ApplyFailure {
                    cause,
                    debited: false,
                });
            }
        };
        transaction.journal_entry_ids.push(entry.id);

        if let Err(err) = self
            .parts
            .wallets
            .debit(
                &transaction.sender_wallet_id,
                &transaction.net,
                DebitSource::Reserved,
            )
            .await
        {
            return Err(ApplyFailure {
                cause: self.internal("sender debit", err),
                debited: false,
            });
        }

        if transaction.is_cross_currency() {
            self.transition(transaction, TransactionStatus::Settling)
                .map_err(|cause| ApplyFailure {
                    cause,
                    debited: true,
                })?;
            let settlement = self
                .parts
                .settlements
                .enqueue(NewSettlement {
                    network: self.config.settlement_network.clone(),
                    currency: transaction.destination_currency,
                    total: transaction.converted,
                    transaction_ids: vec![transaction.id.clone()],
                })
                .await
                .map_err(|err| ApplyFailure {
                    cause: self.internal("settlement enqueue", err),
                    debited: true,
                })?;
            transaction.settlement_id = Some(settlement.id);
            if let Some(kick) = &self.parts.settlement_kick {
                kick.notify_one();
            }
        } else {
            self.parts
                .wallets
                .credit(&transaction.receiver_wallet_id, &transaction.amount)
                .await
                .map_err(|err| ApplyFailure {
                    cause: self.internal("receiver credit", err),
                    debited: true,
                })?;
            self.transition(transaction, TransactionStatus::Completed)
                .map_err(|cause| ApplyFailure {
                    cause,
                    debited: true,
                })?;
            transaction.completed_at = Some(Utc::now());
            self.settle_bookkeeping(transaction).await;
            self.notify(
                &transaction.sender_id,
                NotificationEvent::PaymentCompleted,
                transaction,
            )
            .await;
            self.notify(
                &transaction.receiver_id,
                NotificationEvent::PaymentReceived,
                transaction,
            )
            .await;
        }
        Ok(())
    }

    /// Success-side counters: velocity bookkeeping and the behavioral
    /// profile sample.
    async fn settle_bookkeeping(&self, transaction: &Transaction) {
        let now = Utc::now();
        if let Err(err) = self
            .parts
            .activity
            .record_success(&transaction.sender_id, now)
            .await
        {
            warn!(error = %err, "success record failed");
        }
        self.parts
            .monitor
            .observe(
                &transaction.sender_id,
                transaction.amount.amount,
                &transaction.receiver_id,
                None,
                now,
            )
            .await;
        self.parts.risk.breaker().record_success();
    }

    /// Unwinds a failed payment in reverse order of exactly what was
    /// applied: a posted entry is mirrored with a reversing entry; a debit
    /// that went through is re-credited; a reservation still standing is
    /// released.
    async fn compensate_reservation(
        &self,
        transaction: &mut Transaction,
        failure: ApplyFailure,
    ) -> EngineResult<()> {
        let ApplyFailure { cause, debited } = failure;
        warn!(
            transaction_id = transaction.id,
            error = %cause,
            "compensating failed payment"
        );
        if !transaction.journal_entry_ids.is_empty() {
            let entries = self
                .parts
                .ledger
                .entries_for_transaction(&transaction.id)
                .await
                .map_err(|err| self.internal("compensation entry lookup", err))?;
            let postings: Vec<NewPosting> = entries
                .iter()
                .filter(|entry| {
                    matches!(
                        entry.purpose,
                        EntryPurpose::Payment | EntryPurpose::EscrowRelease
                    )
                })
                .flat_map(JournalEntry::reversing_postings)
                .collect();
            match self
                .parts
                .ledger
                .post(NewJournalEntry {
                    transaction_id: transaction.id.clone(),
                    purpose: EntryPurpose::Reversal,
                    memo: Some(format!("compensation: {cause}")),
                    postings,
                })
                .await
            {
                Ok(entry) => transaction.journal_entry_ids.push(entry.id),
                Err(LedgerError::DuplicateEntry { .. }) => {}
                Err(err) => return Err(self.internal("compensation post", err)),
            }
        }
        if debited {
            self.parts
                .wallets
                .credit(&transaction.sender_wallet_id, &transaction.net)
                .await
                .map_err(|err| self.internal("compensation credit", err))?;
        } else if let Err(err) = self
            .parts
            .wallets
            .release(&transaction.sender_wallet_id, &transaction.net)
            .await
        {
            // The release itself failing means balances are damaged; this
            // must halt the request rather than limp on.
            return Err(self.internal("compensation release", err));
        }
        if let Err(err) = self
            .parts
            .activity
            .forget_debit(
                &transaction.sender_id,
                transaction.net.amount,
                transaction.created_at,
            )
            .await
        {
            warn!(error = %err, "activity forget failed");
        }
        self.transition(transaction, TransactionStatus::Failed)?;
        transaction.status_reason = Some(cause.to_string());
        self.audit(
            &transaction.id,
            "engine",
            AuditAction::PaymentCompensated,
            serde_json::json!({"cause": cause.to_string()}),
        )
        .await;
        self.notify(
            &transaction.sender_id,
            NotificationEvent::PaymentFailed,
            transaction,
        )
        .await;
        Ok(())
    }

    async fn finish_rejected(
        &self,
        mut transaction: Transaction,
        rejection: &RiskRejection,
        route: &str,
        request: &PaymentRequest,
    ) -> EngineResult<InitiateResult> {
        self.transition(&mut transaction, TransactionStatus::Failed)?;
        transaction.status_reason = Some(format!(
            "{}: {}",
            reason::RISK_REJECTED,
            serde_json::to_string(rejection).unwrap_or_else(|_| "unknown".into())
        ));
        let transaction = self.parts.transactions.insert(transaction).await?;
        self.audit(
            &transaction.id,
            &request.sender_id,
            AuditAction::PaymentRejected,
            serde_json::json!({"rejection": rejection}),
        )
        .await;
        self.notify(
            &transaction.sender_id,
            NotificationEvent::PaymentFailed,
            &transaction,
        )
        .await;
        self.finish_stored(transaction, route, &request.reference, 422)
            .await
    }

    /// Stores the definitive response body for replays, then returns it.
    async fn finish_stored(
        &self,
        transaction: Transaction,
        route: &str,
        reference: &str,
        status_code: u16,
    ) -> EngineResult<InitiateResult> {
        let body = serde_json::to_string(&transaction)
            .map_err(|err| self.internal("response encode", err))?;
        self.parts
            .idempotency
            .complete(route, reference, StoredResponse { status_code, body })
            .await
            .map_err(|err| self.internal("idempotency complete", err))?;
        Ok(InitiateResult {
            transaction,
            replayed: false,
        })
    }

    async fn resolve_receiver_wallet(
        &self,
        request: &PaymentRequest,
        sender: &lipa_directory::User,
    ) -> EngineResult<Wallet> {
        match &request.receiver {
            ReceiverRef::WalletAddress(address) => self
                .parts
                .wallets
                .find_by_address(address)
                .await
                .map_err(|err| EngineError::NotFound(format!("receiver wallet: {err}"))),
            ReceiverRef::UserId(user_id) => {
                let destination = request
                    .destination_currency
                    .unwrap_or(request.amount.currency);
                match self
                    .parts
                    .wallets
                    .find_for_user(user_id, destination)
                    .await
                {
                    Ok(wallet) => Ok(wallet),
                    Err(WalletError::NotFound(_))
                        if user_id == &sender.id && self.config.auto_create_self_wallets =>
                    {
                        self.create_wallet(user_id, destination).await
                    }
                    Err(err) => Err(EngineError::NotFound(format!("receiver wallet: {err}"))),
                }
            }
        }
    }

    // ---- admin approval ----

    pub async fn approve_payment(
        &self,
        transaction_id: &TransactionId,
        admin: &UserId,
    ) -> EngineResult<Transaction> {
        let mut transaction = self.parts.transactions.get(transaction_id).await?;
        if transaction.status != TransactionStatus::PendingApproval {
            return Err(EngineError::Validation(format!(
                "transaction {transaction_id} is not awaiting approval"
            )));
        }
        self.transition(&mut transaction, TransactionStatus::Processing)?;
        self.price(&mut transaction).await?;

        let _guard = self.posting_lock.lock().await;
        let reserved = self
            .parts
            .wallets
            .reserve(&transaction.sender_wallet_id, &transaction.net)
            .await;
        match reserved {
            Ok(_) => {}
            Err(WalletError::InsufficientFunds { .. }) => {
                self.transition(&mut transaction, TransactionStatus::Failed)?;
                transaction.status_reason = Some(reason::INSUFFICIENT_FUNDS.to_string());
                return self.parts.transactions.save(transaction).await;
            }
            Err(err) => return Err(self.internal("wallet reserve", err)),
        }
        if let Err(err) = self
            .parts
            .activity
            .record_debit(&transaction.sender_id, transaction.net.amount, transaction.created_at)
            .await
        {
            warn!(error = %err, "activity debit record failed");
        }
        self.transition(&mut transaction, TransactionStatus::Reserved)?;

        if let Err(err) = self
            .post_and_apply(&mut transaction, EntryPurpose::Payment)
            .await
        {
            self.compensate_reservation(&mut transaction, err).await?;
            return self.parts.transactions.save(transaction).await;
        }
        let transaction = self.parts.transactions.save(transaction).await?;
        self.audit(
            &transaction.id,
            admin,
            AuditAction::PaymentApproved,
            serde_json::json!({"status": transaction.status}),
        )
        .await;
        Ok(transaction)
    }

    pub async fn reject_payment(
        &self,
        transaction_id: &TransactionId,
        admin: &UserId,
        rejection_reason: &str,
    ) -> EngineResult<Transaction> {
        let mut transaction = self.parts.transactions.get(transaction_id).await?;
        if transaction.status != TransactionStatus::PendingApproval {
            return Err(EngineError::Validation(format!(
                "transaction {transaction_id} is not awaiting approval"
            )));
        }
        self.transition(&mut transaction, TransactionStatus::Cancelled)?;
        transaction.status_reason = Some(format!("{}: {rejection_reason}", reason::ADMIN_REJECTED));
        let transaction = self.parts.transactions.save(transaction).await?;
        self.audit(
            &transaction.id,
            admin,
            AuditAction::PaymentAdminRejected,
            serde_json::json!({"reason": rejection_reason}),
        )
        .await;
        self.notify(
            &transaction.sender_id,
            NotificationEvent::PaymentFailed,
            &transaction,
        )
        .await;
        Ok(transaction)
    }

    pub async fn list_pending_approvals(&self) -> EngineResult<Vec<Transaction>> {
        self.parts
            .transactions
            .list_by_status(TransactionStatus::PendingApproval)
            .await
    }

    // ---- escrow ----

    pub async fn release_escrow(
        &self,
        transaction_id: &TransactionId,
        actor: &UserId,
    ) -> EngineResult<Transaction> {
        let mut transaction = self.parts.transactions.get(transaction_id).await?;
        if transaction.transaction_type != TransactionType::Escrow {
            return Err(EngineError::Validation(format!(
                "transaction {transaction_id} is not an escrow"
            )));
        }
        if transaction.status != TransactionStatus::Reserved {
            return Err(EngineError::Validation(format!(
                "escrow {transaction_id} is not releasable from {:?}",
                transaction.status
            )));
        }
        let terms = transaction
            .escrow
            .clone()
            .ok_or_else(|| self.internal("escrow terms", "missing on escrow transaction"))?;
        if actor != &terms.release_actor {
            return Err(EngineError::Forbidden {
                actor: actor.clone(),
            });
        }
        if let Some(expires_at) = terms.expires_at
            && Utc::now() >= expires_at
        {
            return Err(EngineError::Validation(format!(
                "escrow {transaction_id} expired at {expires_at}"
            )));
        }

        let _guard = self.posting_lock.lock().await;
        if let Err(err) = self
            .post_and_apply(&mut transaction, EntryPurpose::EscrowRelease)
            .await
        {
            self.compensate_reservation(&mut transaction, err).await?;
            return self.parts.transactions.save(transaction).await;
        }
        let transaction = self.parts.transactions.save(transaction).await?;
        self.audit(
            &transaction.id,
            actor,
            AuditAction::EscrowReleased,
            serde_json::json!({"status": transaction.status}),
        )
        .await;
        self.notify(
            &transaction.receiver_id,
            NotificationEvent::EscrowReleased,
            &transaction,
        )
        .await;
        Ok(transaction)
    }

    pub async fn expire_escrow(&self, transaction_id: &TransactionId) -> EngineResult<Transaction> {
        let mut transaction = self.parts.transactions.get(transaction_id).await?;
        if transaction.transaction_type != TransactionType::Escrow
            || transaction.status != TransactionStatus::Reserved
        {
            return Err(EngineError::Validation(format!(
                "transaction {transaction_id} is not an expirable escrow"
            )));
        }
        let terms = transaction
            .escrow
            .clone()
            .ok_or_else(|| self.internal("escrow terms", "missing on escrow transaction"))?;
        let Some(expires_at) = terms.expires_at else {
            return Err(EngineError::Validation(format!(
                "escrow {transaction_id} has no expiry"
            )));
        };
        if Utc::now() < expires_at {
            return Err(EngineError::Validation(format!(
                "escrow {transaction_id} does not expire until {expires_at}"
            )));
        }

        let _guard = self.posting_lock.lock().await;
        self.parts
            .wallets
            .release(&transaction.sender_wallet_id, &transaction.net)
            .await
            .map_err(|err| self.internal("escrow release", err))?;
        if let Err(err) = self
            .parts
            .activity
            .forget_debit(
                &transaction.sender_id,
                transaction.net.amount,
                transaction.created_at,
            )
            .await
        {
            warn!(error = %err, "activity forget failed");
        }
        self.transition(&mut transaction, TransactionStatus::Cancelled)?;
        transaction.status_reason = Some(reason::ESCROW_EXPIRED.to_string());
        let transaction = self.parts.transactions.save(transaction).await?;
        self.audit(
            &transaction.id,
            "engine",
            AuditAction::EscrowExpired,
            serde_json::json!({"expires_at": expires_at}),
        )
        .await;
        self.notify(
            &transaction.sender_id,
            NotificationEvent::EscrowExpired,
            &transaction,
        )
        .await;
        Ok(transaction)
    }

    /// Voluntary return of the principal by the receiver. The fee stays
    /// earned; a full claw-back including fees is the dispute path.
    /// Cross-border payments refund through a new payment in the opposite
    /// direction, so only same-currency transactions are accepted here.
    pub async fn refund_payment(
        &self,
        transaction_id: &TransactionId,
        actor: &UserId,
    ) -> EngineResult<Transaction> {
        let mut transaction = self.parts.transactions.get(transaction_id).await?;
        if actor != &transaction.receiver_id {
            return Err(EngineError::Forbidden {
                actor: actor.clone(),
            });
        }
        if transaction.status != TransactionStatus::Completed {
            return Err(EngineError::Validation(format!(
                "only completed transactions can be refunded, {transaction_id} is {:?}",
                transaction.status
            )));
        }
        if transaction.is_cross_currency() {
            return Err(EngineError::Validation(
                "cross-currency transactions cannot be refunded in place".into(),
            ));
        }

        let _guard = self.posting_lock.lock().await;
        self.parts
            .wallets
            .debit(
                &transaction.receiver_wallet_id,
                &transaction.amount,
                DebitSource::Available,
            )
            .await
            .map_err(|err| match err {
                WalletError::InsufficientFunds { .. } => EngineError::Validation(format!(
                    "receiver balance too low to refund {}",
                    transaction.id
                )),
                other => self.internal("refund debit", other),
            })?;

        let posted = self
            .parts
            .ledger
            .post(NewJournalEntry {
                transaction_id: transaction.id.clone(),
                purpose: EntryPurpose::Refund,
                memo: Some(format!("refund of {}", transaction.id)),
                postings: vec![
                    NewPosting::debit(
                        AccountRef::Wallet(transaction.receiver_wallet_id.clone()),
                        transaction.amount,
                    ),
                    NewPosting::credit(
                        AccountRef::Wallet(transaction.sender_wallet_id.clone()),
                        transaction.amount,
                    ),
                ],
            })
            .await;
        let entry = match posted {
            Ok(entry) => entry,
            Err(err) => {
                if let Err(credit_err) = self
                    .parts
                    .wallets
                    .credit(&transaction.receiver_wallet_id, &transaction.amount)
                    .await
                {
                    return Err(self.internal("refund unwind", credit_err));
                }
                return Err(self.internal("refund post", err));
            }
        };
        self.parts
            .wallets
            .credit(&transaction.sender_wallet_id, &transaction.amount)
            .await
            .map_err(|err| self.internal("refund credit", err))?;

        transaction.journal_entry_ids.push(entry.id);
        self.transition(&mut transaction, TransactionStatus::Refunded)?;
        transaction.status_reason = Some(format!("refunded by {actor}"));
        let transaction = self.parts.transactions.save(transaction).await?;
        self.audit(
            &transaction.id,
            actor,
            AuditAction::PaymentRefunded,
            serde_json::json!({"amount": transaction.amount}),
        )
        .await;
        self.notify(
            &transaction.sender_id,
            NotificationEvent::PaymentReversed,
            &transaction,
        )
        .await;
        Ok(transaction)
    }

    // ---- dispute / reverse ----

    pub async fn open_dispute(
        &self,
        transaction_id: &TransactionId,
        initiator: &UserId,
        dispute_reason: &str,
    ) -> EngineResult<Transaction> {
        let mut transaction = self.parts.transactions.get(transaction_id).await?;
        if initiator != &transaction.sender_id && initiator != &transaction.receiver_id {
            return Err(EngineError::Forbidden {
                actor: initiator.clone(),
            });
        }
        if transaction.status != TransactionStatus::Completed {
            return Err(EngineError::Validation(format!(
                "only completed transactions can be disputed, {transaction_id} is {:?}",
                transaction.status
            )));
        }
        self.transition(&mut transaction, TransactionStatus::Disputed)?;
        transaction.dispute = Some(Dispute {
            reason: dispute_reason.to_string(),
            initiator: initiator.clone(),
            opened_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        });
        let transaction = self.parts.transactions.save(transaction).await?;
        self.audit(
            &transaction.id,
            initiator,
            AuditAction::DisputeOpened,
            serde_json::json!({"reason": dispute_reason}),
        )
        .await;
        self.notify(
            &transaction.sender_id,
            NotificationEvent::DisputeOpened,
            &transaction,
        )
        .await;
        self.notify(
            &transaction.receiver_id,
            NotificationEvent::DisputeOpened,
            &transaction,
        )
        .await;
        Ok(transaction)
    }

    pub async fn resolve_dispute(
        &self,
        transaction_id: &TransactionId,
        admin: &UserId,
        resolution: DisputeResolution,
    ) -> EngineResult<Transaction> {
        let mut transaction = self.parts.transactions.get(transaction_id).await?;
        if transaction.status != TransactionStatus::Disputed {
            return Err(EngineError::Validation(format!(
                "transaction {transaction_id} is not disputed"
            )));
        }
        let mut dispute = transaction
            .dispute
            .clone()
            .ok_or_else(|| self.internal("dispute record", "missing on disputed transaction"))?;
        dispute.resolved_at = Some(Utc::now());
        dispute.resolution = Some(resolution);

        match resolution {
            DisputeResolution::Rejected => {
                self.transition(&mut transaction, TransactionStatus::Completed)?;
                transaction.dispute = Some(dispute);
                let transaction = self.parts.transactions.save(transaction).await?;
                self.audit(
                    &transaction.id,
                    admin,
                    AuditAction::DisputeRejected,
                    serde_json::json!({}),
                )
                .await;
                Ok(transaction)
            }
            DisputeResolution::Reversed => {
                let _guard = self.posting_lock.lock().await;
                self.reverse_posted_transaction(&mut transaction, EntryPurpose::DisputeReversal)
                    .await?;
                transaction.dispute = Some(dispute);
                transaction.status_reason = Some(reason::DISPUTE_REVERSED.to_string());
                let transaction = self.parts.transactions.save(transaction).await?;
                self.audit(
                    &transaction.id,
                    admin,
                    AuditAction::DisputeReversed,
                    serde_json::json!({}),
                )
                .await;
                self.notify(
                    &transaction.sender_id,
                    NotificationEvent::PaymentReversed,
                    &transaction,
                )
                .await;
                self.notify(
                    &transaction.receiver_id,
                    NotificationEvent::PaymentReversed,
                    &transaction,
                )
                .await;
                Ok(transaction)
            }
        }
    }

    /// Posts the mirror image of everything this transaction ever posted,
    /// claws the money back in the wallet store, and marks the transaction
    /// REVERSED. The original entries are never touched.
    async fn reverse_posted_transaction(
        &self,
        transaction: &mut Transaction,
        purpose: EntryPurpose,
    ) -> EngineResult<()> {
        let entries = self
            .parts
            .ledger
            .entries_for_transaction(&transaction.id)
            .await
            .map_err(|err| self.internal("entry lookup", err))?;
        let mut postings: Vec<NewPosting> = Vec::new();
        for entry in &entries {
            if matches!(entry.purpose, EntryPurpose::Reversal | EntryPurpose::DisputeReversal) {
                return Err(EngineError::Validation(format!(
                    "transaction {} was already reversed",
                    transaction.id
                )));
            }
            postings.extend(entry.reversing_postings());
        }
        if postings.is_empty() {
            return Err(self.internal("reversal", "no journal entries to reverse"));
        }

        // Claw back from the receiver first so an insufficient receiver
        // balance fails the reversal cleanly before anything is written.
        self.parts
            .wallets
            .debit(
                &transaction.receiver_wallet_id,
                &transaction.converted,
                DebitSource::Available,
            )
            .await
            .map_err(|err| match err {
                WalletError::InsufficientFunds { .. } => EngineError::Validation(format!(
                    "receiver balance too low to reverse {}",
                    transaction.id
                )),
                other => self.internal("reversal debit", other),
            })?;

        let entry = match self
            .parts
            .ledger
            .post(NewJournalEntry {
                transaction_id: transaction.id.clone(),
                purpose,
                memo: Some(format!("reversal of {}", transaction.id)),
                postings,
            })
            .await
        {
            Ok(entry) => entry,
            Err(err) => {
                // Put the receiver's money back; the reversal never
                // happened.
                if let Err(credit_err) = self
                    .parts
                    .wallets
                    .credit(&transaction.receiver_wallet_id, &transaction.converted)
                    .await
                {
                    return Err(self.internal("reversal unwind", credit_err));
                }
                return Err(self.internal("reversal post", err));
            }
        };
        self.parts
            .wallets
            .credit(&transaction.sender_wallet_id, &transaction.net)
            .await
            .map_err(|err| self.internal("reversal credit", err))?;

        transaction.journal_entry_ids.push(entry.id);
        self.transition(transaction, TransactionStatus::Reversed)?;
        Ok(())
    }

    // ---- queries ----

    pub async fn get_payment(&self, transaction_id: &TransactionId) -> EngineResult<Transaction> {
        self.parts.transactions.get(transaction_id).await
    }

    pub async fn payment_journal(
        &self,
        transaction_id: &TransactionId,
    ) -> EngineResult<Vec<JournalEntry>> {
        self.parts
            .ledger
            .entries_for_transaction(transaction_id)
            .await
            .map_err(|err| self.internal("entry lookup", err))
    }

    pub async fn receipt(&self, transaction_id: &TransactionId) -> EngineResult<Receipt> {
        let transaction = self.parts.transactions.get(transaction_id).await?;
        let sender = self
            .parts
            .directory
            .find_by_id(&transaction.sender_id)
            .await
            .map_err(|err| self.internal("sender lookup", err))?;
        let receiver = self
            .parts
            .directory
            .find_by_id(&transaction.receiver_id)
            .await
            .map_err(|err| self.internal("receiver lookup", err))?;
        let sender_wallet = self
            .parts
            .wallets
            .get(&transaction.sender_wallet_id)
            .await
            .map_err(|err| self.internal("sender wallet lookup", err))?;
        let receiver_wallet = self
            .parts
            .wallets
            .get(&transaction.receiver_wallet_id)
            .await
            .map_err(|err| self.internal("receiver wallet lookup", err))?;

        Ok(Receipt {
            transaction_id: transaction.id.clone(),
            status: transaction.status,
            sender_name: sender.display_name,
            receiver_name: receiver.display_name,
            sender_wallet_suffix: address_suffix(&sender_wallet.address),
            receiver_wallet_suffix: address_suffix(&receiver_wallet.address),
            amount: transaction.amount,
            fee: transaction.fee,
            total_debited: transaction.net,
            converted: transaction.converted,
            quoted_rate: transaction.quoted_rate,
            completed_at: transaction.completed_at,
        })
    }

    pub async fn wallet_transactions(
        &self,
        wallet_id: &WalletId,
    ) -> EngineResult<Vec<Transaction>> {
        self.parts.transactions.list_for_wallet(wallet_id).await
    }
}

fn address_suffix(address: &str) -> String {
    let suffix: String = address
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{suffix}")
}

#[async_trait]
impl SettlementOutcomeHandler for PaymentEngine {
    async fn settlement_completed(&self, settlement: &Settlement) -> SettlementResult<()> {
        for transaction_id in &settlement.transaction_ids {
            let mut transaction = self
                .parts
                .transactions
                .get(transaction_id)
                .await
                .map_err(|err| SettlementError::Handler(err.to_string()))?;
            if transaction.status == TransactionStatus::Completed {
                continue;
            }
            if transaction.status != TransactionStatus::Settling {
                return Err(SettlementError::Handler(format!(
                    "transaction {transaction_id} is {:?}, expected SETTLING",
                    transaction.status
                )));
            }

            let source = transaction.amount.currency;
            let destination = transaction.destination_currency;
            let spread_gain = spread_gain(&transaction);
            let mut postings = vec![
                NewPosting::debit(AccountRef::SuspenseInflight(source), transaction.amount),
                NewPosting::credit(AccountRef::SettlementNostro(source), transaction.amount),
                NewPosting::credit(
                    AccountRef::SuspenseInflight(destination),
                    transaction.converted,
                ),
                NewPosting::debit(
                    AccountRef::SettlementNostro(destination),
                    transaction
                        .converted
                        .checked_add(&spread_gain)
                        .map_err(|err| SettlementError::Handler(err.to_string()))?,
                ),
            ];
            if spread_gain.is_positive() {
                postings.push(NewPosting::credit(
                    AccountRef::FxSpread(destination),
                    spread_gain,
                ));
            }

            let posted = self
                .parts
                .ledger
                .post(NewJournalEntry {
                    transaction_id: transaction.id.clone(),
                    purpose: EntryPurpose::SettlementCompletion,
                    memo: Some(format!("settlement {}", settlement.batch_reference)),
                    postings,
                })
                .await;
            match posted {
                Ok(entry) => transaction.journal_entry_ids.push(entry.id),
                // A replayed completion already posted this entry; fall
                // through and make sure the transaction row caught up.
                Err(LedgerError::DuplicateEntry { .. }) => {}
                Err(err) => return Err(SettlementError::Handler(err.to_string())),
            }

            self.parts
                .wallets
                .credit(&transaction.receiver_wallet_id, &transaction.converted)
                .await
                .map_err(|err| SettlementError::Handler(err.to_string()))?;

            transaction.external_hash = settlement.external_hash.clone();
            if transaction
                .status
                .can_transition_to(TransactionStatus::Completed)
            {
                transaction.status = TransactionStatus::Completed;
            }
            transaction.completed_at = Some(Utc::now());
            transaction.updated_at = Utc::now();
            self.parts
                .transactions
                .save(transaction.clone())
                .await
                .map_err(|err| SettlementError::Handler(err.to_string()))?;

            self.settle_bookkeeping(&transaction).await;
            self.audit(
                &transaction.id,
                "settlement-worker",
                AuditAction::PaymentSettled,
                serde_json::json!({
                    "settlement_id": settlement.id,
                    "external_hash": settlement.external_hash,
                }),
            )
            .await;
            self.notify(
                &transaction.sender_id,
                NotificationEvent::PaymentCompleted,
                &transaction,
            )
            .await;
            self.notify(
                &transaction.receiver_id,
                NotificationEvent::PaymentReceived,
                &transaction,
            )
            .await;
            info!(
                transaction_id = transaction.id,
                settlement_id = settlement.id,
                "cross-border payment settled"
            );
        }
        Ok(())
    }

    async fn settlement_failed(&self, settlement: &Settlement) -> SettlementResult<()> {
        for transaction_id in &settlement.transaction_ids {
            let mut transaction = self
                .parts
                .transactions
                .get(transaction_id)
                .await
                .map_err(|err| SettlementError::Handler(err.to_string()))?;
            if transaction.status == TransactionStatus::Reversed {
                continue;
            }
            if transaction.status != TransactionStatus::Settling {
                return Err(SettlementError::Handler(format!(
                    "transaction {transaction_id} is {:?}, expected SETTLING",
                    transaction.status
                )));
            }

            // Reverse the payment entry; the receiver was never credited in
            // the wallet store, so only the sender needs making whole.
            let entries = self
                .parts
                .ledger
                .entries_for_transaction(&transaction.id)
                .await
                .map_err(|err| SettlementError::Handler(err.to_string()))?;
            let postings: Vec<NewPosting> = entries
                .iter()
                .filter(|entry| {
                    matches!(
                        entry.purpose,
                        EntryPurpose::Payment | EntryPurpose::EscrowRelease
                    )
                })
                .flat_map(JournalEntry::reversing_postings)
                .collect();
            let posted = self
                .parts
                .ledger
                .post(NewJournalEntry {
                    transaction_id: transaction.id.clone(),
                    purpose: EntryPurpose::Reversal,
                    memo: Some(format!(
                        "settlement {} failed after {} attempts",
                        settlement.batch_reference, settlement.submission_count
                    )),
                    postings,
                })
                .await;
            match posted {
                Ok(entry) => transaction.journal_entry_ids.push(entry.id),
                Err(LedgerError::DuplicateEntry { .. }) => {}
                Err(err) => return Err(SettlementError::Handler(err.to_string())),
            }

            self.parts
                .wallets
                .credit(&transaction.sender_wallet_id, &transaction.net)
                .await
                .map_err(|err| SettlementError::Handler(err.to_string()))?;
            if let Err(err) = self
                .parts
                .activity
                .forget_debit(
                    &transaction.sender_id,
                    transaction.net.amount,
                    transaction.created_at,
                )
                .await
            {
                warn!(error = %err, "activity forget failed");
            }

            if transaction
                .status
                .can_transition_to(TransactionStatus::Reversed)
            {
                transaction.status = TransactionStatus::Reversed;
            }
            transaction.status_reason = Some(reason::SETTLEMENT_FAILED.to_string());
            transaction.updated_at = Utc::now();
            self.parts
                .transactions
                .save(transaction.clone())
                .await
                .map_err(|err| SettlementError::Handler(err.to_string()))?;

            self.audit(
                &transaction.id,
                "settlement-worker",
                AuditAction::PaymentReversed,
                serde_json::json!({"settlement_id": settlement.id}),
            )
            .await;
            self.notify(
                &transaction.sender_id,
                NotificationEvent::PaymentReversed,
                &transaction,
            )
            .await;
            warn!(
                transaction_id = transaction.id,
                settlement_id = settlement.id,
                "cross-border payment reversed after settlement failure"
            );
        }
        Ok(())
    }
}

/// The spread realized at settlement: what the mid would have delivered
/// minus what the sell rate actually delivered, in destination currency.
fn spread_gain(transaction: &Transaction) -> Money {
    let destination = transaction.destination_currency;
    let Some(mid) = transaction.quoted_mid else {
        return Money::zero(destination);
    };
    let Ok(at_mid) = transaction.amount.convert(mid, destination) else {
        return Money::zero(destination);
    };
    match at_mid.checked_sub(&transaction.converted) {
        Ok(gain) if gain.is_positive() => gain,
        _ => Money::zero(destination),
    }
}
