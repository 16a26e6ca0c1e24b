use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lipa_audit::InMemoryAuditLog;
use lipa_audit::InMemoryNotificationSink;
use lipa_directory::InMemoryUserDirectory;
use lipa_directory::KycLevel;
use lipa_directory::KycStatus;
use lipa_directory::User;
use lipa_engine::DisputeResolution;
use lipa_engine::EngineConfig;
use lipa_engine::EngineError;
use lipa_engine::EngineParts;
use lipa_engine::EscrowTerms;
use lipa_engine::InMemoryTransactionStore;
use lipa_engine::PaymentEngine;
use lipa_engine::PaymentRequest;
use lipa_engine::ReceiverRef;
use lipa_engine::TransactionStatus;
use lipa_fx::FxService;
use lipa_fx::InMemoryRateHistory;
use lipa_fx::RateProvider;
use lipa_fx::SpreadConfig;
use lipa_fx::SpreadEngine;
use lipa_fx::StaticRateProvider;
use lipa_idempotency::InMemoryIdempotencyStore;
use lipa_ledger::AccountRef;
use lipa_ledger::InMemoryLedgerStore;
use lipa_ledger::LedgerStore;
use lipa_money::Currency;
use lipa_money::Money;
use lipa_monitor::BehavioralMonitor;
use lipa_risk::ActivityStore;
use lipa_risk::Blocklist;
use lipa_risk::BreakerConfig;
use lipa_risk::CircuitBreaker;
use lipa_risk::InMemoryActivityStore;
use lipa_risk::InMemoryBlocklist;
use lipa_risk::RiskConfig;
use lipa_risk::RiskEngine;
use lipa_settlement::InMemorySettlementStore;
use lipa_settlement::NetworkStatus;
use lipa_settlement::Settlement;
use lipa_settlement::SettlementError;
use lipa_settlement::SettlementNetwork;
use lipa_settlement::SettlementOutcomeHandler;
use lipa_settlement::SettlementResult;
use lipa_settlement::SettlementStore;
use lipa_settlement::SettlementWorker;
use lipa_settlement::WorkerConfig;
use lipa_wallet::InMemoryWalletStore;
use lipa_wallet::WalletStore;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

struct ReliableNetwork;

#[async_trait]
impl SettlementNetwork for ReliableNetwork {
    fn name(&self) -> &str {
        "reliable"
    }

    async fn submit(&self, settlement: &Settlement) -> SettlementResult<String> {
        Ok(format!("0x{}", settlement.batch_reference))
    }

    async fn confirm(&self, _external_hash: &str) -> SettlementResult<NetworkStatus> {
        Ok(NetworkStatus::Confirmed)
    }
}

struct BrokenNetwork;

#[async_trait]
impl SettlementNetwork for BrokenNetwork {
    fn name(&self) -> &str {
        "broken"
    }

    async fn submit(&self, _settlement: &Settlement) -> SettlementResult<String> {
        Err(SettlementError::Network("permanently rejected".into()))
    }

    async fn confirm(&self, _external_hash: &str) -> SettlementResult<NetworkStatus> {
        Ok(NetworkStatus::Failed {
            reason: "permanently rejected".into(),
        })
    }
}

struct Stack {
    engine: Arc<PaymentEngine>,
    ledger: Arc<InMemoryLedgerStore>,
    wallets: Arc<InMemoryWalletStore>,
    settlements: Arc<InMemorySettlementStore>,
    directory: Arc<InMemoryUserDirectory>,
    notifications: Arc<InMemoryNotificationSink>,
}

impl Stack {
    async fn worker(&self, network: Arc<dyn SettlementNetwork>, max_attempts: u32) -> SettlementWorker {
        SettlementWorker::new(
            Arc::clone(&self.settlements) as Arc<dyn SettlementStore>,
            network,
            Arc::clone(&self.engine) as Arc<dyn SettlementOutcomeHandler>,
            WorkerConfig {
                max_attempts,
                backoff_unit: chrono::Duration::zero(),
                backoff_cap: chrono::Duration::zero(),
                ..WorkerConfig::default()
            },
        )
    }

    async fn balance(&self, account: AccountRef) -> Decimal {
        self.ledger
            .balance(&account)
            .await
            .expect("account balance")
            .amount
    }

    async fn wallet_available(&self, wallet_id: &str) -> Decimal {
        self.wallets
            .get(&wallet_id.to_string())
            .await
            .expect("wallet")
            .available
    }

    async fn assert_books_balance(&self) {
        for currency in Currency::ALL {
            assert_eq!(
                self.ledger
                    .trial_balance(currency)
                    .await
                    .expect("trial balance"),
                Decimal::ZERO,
                "trial balance for {currency} must be zero"
            );
        }
    }
}

fn user(id: &str, name: &str, country: &str) -> User {
    User {
        id: id.into(),
        display_name: name.into(),
        country: country.into(),
        kyc_level: KycLevel::FULL,
        kyc_status: KycStatus::Verified,
        active: true,
        risk_score: 0,
        created_at: Utc::now(),
    }
}

async fn stack() -> Stack {
    stack_with(RiskConfig::default(), EngineConfig::default()).await
}

async fn stack_with(risk_config: RiskConfig, engine_config: EngineConfig) -> Stack {
    stack_custom(risk_config, engine_config, None).await
}

type LedgerWrapper = Box<dyn Fn(Arc<dyn LedgerStore>) -> Arc<dyn LedgerStore>>;

async fn stack_custom(
    risk_config: RiskConfig,
    engine_config: EngineConfig,
    ledger_wrapper: Option<LedgerWrapper>,
) -> Stack {
    let directory = Arc::new(InMemoryUserDirectory::new());
    directory
        .register(user("alice", "Alice Phiri", "MW"))
        .await
        .expect("register alice");
    directory
        .register(user("bob", "Bob Chen", "CN"))
        .await
        .expect("register bob");
    directory
        .trust_device(&"alice".to_string(), "device-1")
        .await
        .expect("trust device");

    let provider: Arc<dyn RateProvider> = Arc::new(
        StaticRateProvider::new("primary")
            .with_rate(Currency::Mwk, Currency::Cny, dec!(0.0085))
            .with_rate(Currency::Cny, Currency::Mwk, dec!(117.65)),
    );
    let fx = Arc::new(FxService::new(
        vec![provider],
        SpreadEngine::new(SpreadConfig::neutral(dec!(0.015))),
        Arc::new(InMemoryRateHistory::new()),
        None,
    ));

    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let activity = Arc::new(InMemoryActivityStore::new());
    let risk = Arc::new(RiskEngine::new(
        risk_config,
        Arc::clone(&breaker),
        Arc::new(InMemoryBlocklist::new()) as Arc<dyn Blocklist>,
        Arc::clone(&activity) as Arc<dyn ActivityStore>,
        Arc::clone(&directory) as Arc<dyn lipa_directory::UserDirectory>,
    ));

    let ledger = Arc::new(InMemoryLedgerStore::new());
    let wallets = Arc::new(InMemoryWalletStore::default());
    let settlements = Arc::new(InMemorySettlementStore::new());
    let notifications = Arc::new(InMemoryNotificationSink::new());

    let engine_ledger = {
        let base = Arc::clone(&ledger) as Arc<dyn LedgerStore>;
        match ledger_wrapper {
            Some(wrap) => wrap(base),
            None => base,
        }
    };

    let engine = Arc::new(PaymentEngine::new(
        engine_config,
        EngineParts {
            ledger: engine_ledger,
            wallets: Arc::clone(&wallets) as Arc<dyn WalletStore>,
            transactions: Arc::new(InMemoryTransactionStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            fx,
            risk,
            monitor: Arc::new(BehavioralMonitor::default()),
            activity: Arc::clone(&activity) as Arc<dyn ActivityStore>,
            directory: Arc::clone(&directory) as Arc<dyn lipa_directory::UserDirectory>,
            settlements: Arc::clone(&settlements) as Arc<dyn SettlementStore>,
            audit: InMemoryAuditLog::shared(),
            notifications: Arc::clone(&notifications)
                as Arc<dyn lipa_audit::NotificationSink>,
            settlement_kick: None,
        },
    ));

    Stack {
        engine,
        ledger,
        wallets,
        settlements,
        directory,
        notifications,
    }
}

async fn funded_wallet(stack: &Stack, user_id: &str, currency: Currency, amount: Decimal) -> String {
    let wallet = stack
        .engine
        .create_wallet(&user_id.to_string(), currency)
        .await
        .expect("create wallet");
    if amount > Decimal::ZERO {
        stack
            .engine
            .deposit(
                &wallet.id,
                Money::new(amount, currency),
                &format!("seed-{user_id}-{currency}"),
            )
            .await
            .expect("deposit");
    }
    wallet.id
}

fn payment(reference: &str, amount: Decimal, currency: Currency, receiver: ReceiverRef) -> PaymentRequest {
    PaymentRequest {
        reference: reference.into(),
        sender_id: "alice".into(),
        receiver,
        amount: Money::new(amount, currency),
        destination_currency: None,
        description: Some("test payment".into()),
        channel: None,
        device_hash: Some("device-1".into()),
        ip_address: None,
        location_suspicious: false,
        metadata: serde_json::json!({}),
    }
}

#[tokio::test]
async fn s1_same_currency_payment_completes_with_fee() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(2000.00)).await;
    let bob = funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-s1",
            dec!(1000.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("payment");

    assert_eq!(result.transaction.status, TransactionStatus::Completed);
    assert_eq!(result.transaction.fee.amount, dec!(15.00));
    assert_eq!(stack.wallet_available(&alice).await, dec!(985.00));
    assert_eq!(stack.wallet_available(&bob).await, dec!(1000.00));
    assert_eq!(
        stack.balance(AccountRef::FeeIncome(Currency::Mwk)).await,
        dec!(15.00)
    );
    stack.assert_books_balance().await;

    // Invariant 3: the journal shows the full sender debit.
    let entries = stack
        .engine
        .payment_journal(&result.transaction.id)
        .await
        .expect("journal");
    assert_eq!(entries.len(), 1);
    let sender_posting = entries[0]
        .postings
        .iter()
        .find(|posting| posting.account == AccountRef::Wallet(alice.clone()))
        .expect("sender posting");
    assert_eq!(sender_posting.amount.amount, dec!(-1015.00));
}

#[tokio::test]
async fn s2_cross_currency_payment_settles_with_spread() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(100000.00)).await;
    let bob = funded_wallet(&stack, "bob", Currency::Cny, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-s2",
            dec!(50000.00),
            Currency::Mwk,
            ReceiverRef::WalletAddress(
                stack
                    .wallets
                    .get(&bob)
                    .await
                    .expect("bob wallet")
                    .address
                    .clone(),
            ),
        ))
        .await
        .expect("payment");

    let transaction = result.transaction;
    assert_eq!(transaction.status, TransactionStatus::Settling);
    assert_eq!(transaction.quoted_rate, Some(dec!(0.00843625)));
    assert_eq!(transaction.converted.amount, dec!(421.81));
    assert_eq!(transaction.fee.amount, dec!(750.00));
    // Sender is already debited; receiver sees nothing until settlement.
    assert_eq!(stack.wallet_available(&alice).await, dec!(49250.00));
    assert_eq!(stack.wallet_available(&bob).await, dec!(0));

    // Drive the settlement: submit, then confirm + finalize.
    let worker = stack.worker(Arc::new(ReliableNetwork), 10).await;
    worker.drain_once().await;
    worker.drain_once().await;

    let settled = stack
        .engine
        .get_payment(&transaction.id)
        .await
        .expect("reload");
    assert_eq!(settled.status, TransactionStatus::Completed);
    assert!(settled.external_hash.is_some());
    assert_eq!(stack.wallet_available(&bob).await, dec!(421.81));

    // Suspense reconciles to zero per currency; the spread gain lands in
    // FX_SPREAD (50 000 · 0.0085 = 425.00 at mid, 421.81 delivered).
    assert_eq!(
        stack
            .balance(AccountRef::SuspenseInflight(Currency::Mwk))
            .await,
        Decimal::ZERO
    );
    assert_eq!(
        stack
            .balance(AccountRef::SuspenseInflight(Currency::Cny))
            .await,
        Decimal::ZERO
    );
    assert_eq!(
        stack.balance(AccountRef::FxSpread(Currency::Cny)).await,
        dec!(3.19)
    );
    assert_eq!(
        stack.balance(AccountRef::FeeIncome(Currency::Mwk)).await,
        dec!(750.00)
    );
    stack.assert_books_balance().await;
}

#[tokio::test]
async fn s3_idempotent_retry_replays_without_side_effects() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(2000.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let request = payment(
        "pay-s3",
        dec!(1000.00),
        Currency::Mwk,
        ReceiverRef::UserId("bob".into()),
    );
    let first = stack
        .engine
        .initiate_payment(request.clone())
        .await
        .expect("first submit");
    let second = stack
        .engine
        .initiate_payment(request.clone())
        .await
        .expect("replay");

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.transaction, second.transaction);
    assert_eq!(stack.wallet_available(&alice).await, dec!(985.00));
    let entries = stack
        .engine
        .payment_journal(&first.transaction.id)
        .await
        .expect("journal");
    assert_eq!(entries.len(), 1);

    // Same key, different body: conflict.
    let mut altered = request;
    altered.amount = Money::new(dec!(999.00), Currency::Mwk);
    let err = stack
        .engine
        .initiate_payment(altered)
        .await
        .expect_err("conflict");
    assert!(matches!(err, EngineError::IdempotencyConflict));
}

#[tokio::test]
async fn s4_insufficient_funds_fails_without_reservation() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(100.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-s4",
            dec!(200.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("initiate");

    assert_eq!(result.transaction.status, TransactionStatus::Failed);
    assert_eq!(
        result.transaction.status_reason.as_deref(),
        Some("INSUFFICIENT_FUNDS")
    );
    let wallet = stack.wallets.get(&alice).await.expect("wallet");
    assert_eq!(wallet.available, dec!(100.00));
    assert_eq!(wallet.reserved, dec!(0.00));
    assert!(
        stack
            .engine
            .payment_journal(&result.transaction.id)
            .await
            .expect("journal")
            .is_empty()
    );
    stack.assert_books_balance().await;
}

#[tokio::test]
async fn s4_boundary_one_minor_unit_over_available_fails() {
    let stack = stack().await;
    // 1000.00 available; 985.23 + 14.78 fee = 1000.01, one cent over.
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(1000.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-s4b",
            dec!(985.23),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("initiate");
    assert_eq!(result.transaction.status, TransactionStatus::Failed);
    assert_eq!(result.transaction.net.amount, dec!(1000.01));
    assert_eq!(stack.wallet_available(&alice).await, dec!(1000.00));

    // 985.22 + 14.78 fee = 1000.00: exactly the available balance fits.
    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-s4c",
            dec!(985.22),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("initiate");
    assert_eq!(result.transaction.status, TransactionStatus::Completed);
    assert_eq!(stack.wallet_available(&alice).await, dec!(0.00));
}

#[tokio::test]
async fn s5_admin_approval_holds_no_funds_and_reject_cancels() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(1000000.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-s5",
            dec!(600000.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("initiate");

    assert_eq!(
        result.transaction.status,
        TransactionStatus::PendingApproval
    );
    let wallet = stack.wallets.get(&alice).await.expect("wallet");
    assert_eq!(wallet.available, dec!(1000000.00));
    assert_eq!(wallet.reserved, dec!(0.00));

    let pending = stack
        .engine
        .list_pending_approvals()
        .await
        .expect("pending list");
    assert_eq!(pending.len(), 1);

    let rejected = stack
        .engine
        .reject_payment(&result.transaction.id, &"admin-1".to_string(), "over limit")
        .await
        .expect("reject");
    assert_eq!(rejected.status, TransactionStatus::Cancelled);
    assert_eq!(
        stack.wallet_available(&alice).await,
        dec!(1000000.00)
    );
    stack.assert_books_balance().await;
}

#[tokio::test]
async fn s5_admin_approval_approve_posts_the_payment() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(1000000.00)).await;
    let bob = funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-s5b",
            dec!(600000.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("initiate");
    assert_eq!(
        result.transaction.status,
        TransactionStatus::PendingApproval
    );

    let approved = stack
        .engine
        .approve_payment(&result.transaction.id, &"admin-1".to_string())
        .await
        .expect("approve");
    assert_eq!(approved.status, TransactionStatus::Completed);
    // fee = 600 000 · 0.015 = 9 000.
    assert_eq!(stack.wallet_available(&alice).await, dec!(391000.00));
    assert_eq!(stack.wallet_available(&bob).await, dec!(600000.00));
    stack.assert_books_balance().await;
}

#[tokio::test]
async fn s6_settlement_failure_reverses_and_restores_the_sender() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(100000.00)).await;
    let bob = funded_wallet(&stack, "bob", Currency::Cny, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-s6",
            dec!(50000.00),
            Currency::Mwk,
            ReceiverRef::WalletAddress(
                stack
                    .wallets
                    .get(&bob)
                    .await
                    .expect("bob wallet")
                    .address
                    .clone(),
            ),
        ))
        .await
        .expect("payment");
    assert_eq!(result.transaction.status, TransactionStatus::Settling);

    let worker = stack.worker(Arc::new(BrokenNetwork), 3).await;
    for _ in 0..5 {
        worker.drain_once().await;
    }

    let settlement_id = result
        .transaction
        .settlement_id
        .clone()
        .expect("settlement id");
    let settlement = stack
        .settlements
        .get(&settlement_id)
        .await
        .expect("settlement");
    assert_eq!(
        settlement.status,
        lipa_settlement::SettlementStatus::Failed
    );

    let reversed = stack
        .engine
        .get_payment(&result.transaction.id)
        .await
        .expect("reload");
    assert_eq!(reversed.status, TransactionStatus::Reversed);
    assert_eq!(
        reversed.status_reason.as_deref(),
        Some("SETTLEMENT_FAILED")
    );
    // Sender fully restored, receiver never credited.
    assert_eq!(stack.wallet_available(&alice).await, dec!(100000.00));
    assert_eq!(stack.wallet_available(&bob).await, dec!(0));
    assert_eq!(
        stack
            .balance(AccountRef::SuspenseInflight(Currency::Mwk))
            .await,
        Decimal::ZERO
    );
    assert_eq!(
        stack
            .balance(AccountRef::SuspenseInflight(Currency::Cny))
            .await,
        Decimal::ZERO
    );
    // Invariant 4: the algebraic sum of the reversed transaction's
    // postings is zero per account.
    let entries = stack
        .engine
        .payment_journal(&reversed.id)
        .await
        .expect("journal");
    assert_eq!(entries.len(), 2);
    stack.assert_books_balance().await;
}

#[tokio::test]
async fn escrow_reserves_then_releases_on_demand() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(5000.00)).await;
    let bob = funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let created = stack
        .engine
        .create_escrow(
            payment(
                "escrow-1",
                dec!(1000.00),
                Currency::Mwk,
                ReceiverRef::UserId("bob".into()),
            ),
            EscrowTerms {
                release_actor: "alice".into(),
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            },
        )
        .await
        .expect("create escrow");
    assert_eq!(created.transaction.status, TransactionStatus::Reserved);

    let wallet = stack.wallets.get(&alice).await.expect("wallet");
    assert_eq!(wallet.available, dec!(3985.00));
    assert_eq!(wallet.reserved, dec!(1015.00));
    assert_eq!(stack.wallet_available(&bob).await, dec!(0));

    // Only the named actor may release.
    let err = stack
        .engine
        .release_escrow(&created.transaction.id, &"bob".to_string())
        .await
        .expect_err("forbidden");
    assert!(matches!(err, EngineError::Forbidden { .. }));

    let released = stack
        .engine
        .release_escrow(&created.transaction.id, &"alice".to_string())
        .await
        .expect("release");
    assert_eq!(released.status, TransactionStatus::Completed);
    assert_eq!(stack.wallet_available(&bob).await, dec!(1000.00));
    stack.assert_books_balance().await;
}

#[tokio::test]
async fn escrow_expiry_restores_the_reservation() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(5000.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let created = stack
        .engine
        .create_escrow(
            payment(
                "escrow-2",
                dec!(1000.00),
                Currency::Mwk,
                ReceiverRef::UserId("bob".into()),
            ),
            EscrowTerms {
                release_actor: "alice".into(),
                expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            },
        )
        .await
        .expect("create escrow");

    let expired = stack
        .engine
        .expire_escrow(&created.transaction.id)
        .await
        .expect("expire");
    assert_eq!(expired.status, TransactionStatus::Cancelled);
    assert_eq!(expired.status_reason.as_deref(), Some("ESCROW_EXPIRED"));

    let wallet = stack.wallets.get(&alice).await.expect("wallet");
    assert_eq!(wallet.available, dec!(5000.00));
    assert_eq!(wallet.reserved, dec!(0.00));
    stack.assert_books_balance().await;
}

#[tokio::test]
async fn dispute_reversal_mirrors_the_original_postings() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(2000.00)).await;
    let bob = funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-dispute",
            dec!(1000.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("payment");
    assert_eq!(result.transaction.status, TransactionStatus::Completed);

    // A stranger may not dispute.
    let err = stack
        .engine
        .open_dispute(&result.transaction.id, &"mallory".to_string(), "not mine")
        .await
        .expect_err("forbidden");
    assert!(matches!(err, EngineError::Forbidden { .. }));

    let disputed = stack
        .engine
        .open_dispute(&result.transaction.id, &"alice".to_string(), "goods not delivered")
        .await
        .expect("dispute");
    assert_eq!(disputed.status, TransactionStatus::Disputed);

    let reversed = stack
        .engine
        .resolve_dispute(
            &result.transaction.id,
            &"admin-1".to_string(),
            DisputeResolution::Reversed,
        )
        .await
        .expect("resolve");
    assert_eq!(reversed.status, TransactionStatus::Reversed);
    // Fee comes back too: the reversal mirrors every posting.
    assert_eq!(stack.wallet_available(&alice).await, dec!(2000.00));
    assert_eq!(stack.wallet_available(&bob).await, dec!(0.00));
    assert_eq!(
        stack.balance(AccountRef::FeeIncome(Currency::Mwk)).await,
        Decimal::ZERO
    );
    stack.assert_books_balance().await;
}

#[tokio::test]
async fn dispute_rejection_returns_to_completed() {
    let stack = stack().await;
    funded_wallet(&stack, "alice", Currency::Mwk, dec!(2000.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-dispute-2",
            dec!(1000.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("payment");
    stack
        .engine
        .open_dispute(&result.transaction.id, &"bob".to_string(), "wrong amount")
        .await
        .expect("dispute");

    let resolved = stack
        .engine
        .resolve_dispute(
            &result.transaction.id,
            &"admin-1".to_string(),
            DisputeResolution::Rejected,
        )
        .await
        .expect("resolve");
    assert_eq!(resolved.status, TransactionStatus::Completed);
    assert!(resolved.dispute.expect("dispute record").resolved_at.is_some());
}

#[tokio::test]
async fn receipt_masks_addresses_and_carries_totals() {
    let stack = stack().await;
    funded_wallet(&stack, "alice", Currency::Mwk, dec!(2000.00)).await;
    let bob = funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-receipt",
            dec!(1000.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("payment");

    let receipt = stack
        .engine
        .receipt(&result.transaction.id)
        .await
        .expect("receipt");
    assert_eq!(receipt.sender_name, "Alice Phiri");
    assert_eq!(receipt.receiver_name, "Bob Chen");
    assert_eq!(receipt.total_debited.amount, dec!(1015.00));
    let bob_address = stack.wallets.get(&bob).await.expect("wallet").address;
    assert!(
        receipt
            .receiver_wallet_suffix
            .ends_with(&bob_address[bob_address.len() - 4..])
    );
    assert_eq!(receipt.receiver_wallet_suffix.chars().count(), 5);
}

#[tokio::test]
async fn self_transfer_creates_the_destination_wallet() {
    let stack = stack().await;
    let alice_mwk = funded_wallet(&stack, "alice", Currency::Mwk, dec!(100000.00)).await;

    let mut request = payment(
        "self-1",
        dec!(50000.00),
        Currency::Mwk,
        ReceiverRef::UserId("alice".into()),
    );
    request.destination_currency = Some(Currency::Cny);

    let result = stack
        .engine
        .initiate_payment(request)
        .await
        .expect("self transfer");
    assert_eq!(result.transaction.status, TransactionStatus::Settling);
    assert_ne!(result.transaction.receiver_wallet_id, alice_mwk);

    let worker = stack.worker(Arc::new(ReliableNetwork), 10).await;
    worker.drain_once().await;
    worker.drain_once().await;

    let cny_wallet = stack
        .wallets
        .find_for_user(&"alice".to_string(), Currency::Cny)
        .await
        .expect("auto-created wallet");
    assert_eq!(cny_wallet.available, dec!(421.81));
    stack.assert_books_balance().await;
}

#[tokio::test]
async fn refund_returns_the_principal_but_keeps_the_fee() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(2000.00)).await;
    let bob = funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-refund",
            dec!(1000.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("payment");

    // Only the receiver may refund.
    let err = stack
        .engine
        .refund_payment(&result.transaction.id, &"alice".to_string())
        .await
        .expect_err("forbidden");
    assert!(matches!(err, EngineError::Forbidden { .. }));

    let refunded = stack
        .engine
        .refund_payment(&result.transaction.id, &"bob".to_string())
        .await
        .expect("refund");
    assert_eq!(refunded.status, TransactionStatus::Refunded);
    // Principal comes back; the fee stays earned.
    assert_eq!(stack.wallet_available(&alice).await, dec!(1985.00));
    assert_eq!(stack.wallet_available(&bob).await, dec!(0.00));
    assert_eq!(
        stack.balance(AccountRef::FeeIncome(Currency::Mwk)).await,
        dec!(15.00)
    );
    stack.assert_books_balance().await;

    // Refunded is terminal.
    let err = stack
        .engine
        .open_dispute(&refunded.id, &"alice".to_string(), "still unhappy")
        .await
        .expect_err("terminal");
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn velocity_limit_rejects_the_next_payment_within_the_hour() {
    let risk_config = RiskConfig {
        max_velocity_per_hour: 2,
        ..RiskConfig::default()
    };
    let stack = stack_with(risk_config, EngineConfig::default()).await;
    funded_wallet(&stack, "alice", Currency::Mwk, dec!(10000.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    for attempt in 0..2 {
        let result = stack
            .engine
            .initiate_payment(payment(
                &format!("pay-velocity-{attempt}"),
                dec!(100.00),
                Currency::Mwk,
                ReceiverRef::UserId("bob".into()),
            ))
            .await
            .expect("payment");
        assert_eq!(result.transaction.status, TransactionStatus::Completed);
    }

    let third = stack
        .engine
        .initiate_payment(payment(
            "pay-velocity-2",
            dec!(100.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("initiate");
    assert_eq!(third.transaction.status, TransactionStatus::Failed);
    assert!(
        third
            .transaction
            .status_reason
            .as_deref()
            .expect("reason")
            .contains("VELOCITY")
    );
}

#[tokio::test]
async fn books_stay_balanced_across_a_mixed_workload() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(100000.00)).await;
    let bob = funded_wallet(&stack, "bob", Currency::Mwk, dec!(50000.00)).await;

    let amounts = [
        dec!(10.00),
        dec!(999.99),
        dec!(1.01),
        dec!(2500.00),
        dec!(73.42),
        dec!(18000.00),
    ];
    for (index, amount) in amounts.iter().enumerate() {
        let (sender, receiver) = if index % 2 == 0 {
            ("alice", "bob")
        } else {
            ("bob", "alice")
        };
        let mut request = payment(
            &format!("mixed-{index}"),
            *amount,
            Currency::Mwk,
            ReceiverRef::UserId(receiver.into()),
        );
        request.sender_id = sender.into();
        let result = stack
            .engine
            .initiate_payment(request)
            .await
            .expect("payment");
        assert_eq!(result.transaction.status, TransactionStatus::Completed);

        // Wallet invariant holds at every commit boundary.
        for wallet_id in [&alice, &bob] {
            let wallet = stack.wallets.get(wallet_id).await.expect("wallet");
            assert_eq!(wallet.ledger, wallet.available + wallet.reserved);
            assert!(wallet.available >= Decimal::ZERO);
            assert!(wallet.reserved >= Decimal::ZERO);
        }
        stack.assert_books_balance().await;
    }

    // Total customer money only shrank by the fees earned.
    let fees = stack.balance(AccountRef::FeeIncome(Currency::Mwk)).await;
    let total = stack.wallet_available(&alice).await + stack.wallet_available(&bob).await;
    assert_eq!(total + fees, dec!(150000.00));
}

#[tokio::test]
async fn notifications_reach_both_parties() {
    let stack = stack().await;
    funded_wallet(&stack, "alice", Currency::Mwk, dec!(2000.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    stack
        .engine
        .initiate_payment(payment(
            "pay-notify",
            dec!(1000.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("payment");

    let deliveries = stack.notifications.deliveries().await;
    assert!(deliveries.iter().any(|delivery| {
        delivery.user_id == "alice"
            && delivery.event == lipa_audit::NotificationEvent::PaymentCompleted
    }));
    assert!(deliveries.iter().any(|delivery| {
        delivery.user_id == "bob"
            && delivery.event == lipa_audit::NotificationEvent::PaymentReceived
    }));
}

/// Delegating ledger that stalls `post` long enough to trip the engine's
/// request-scoped deadline.
struct StallingLedger {
    inner: Arc<dyn LedgerStore>,
    delay: std::time::Duration,
}

#[async_trait]
impl LedgerStore for StallingLedger {
    async fn open_account(
        &self,
        account: lipa_ledger::AccountRef,
        currency: Currency,
    ) -> lipa_ledger::LedgerResult<()> {
        self.inner.open_account(account, currency).await
    }

    async fn post(
        &self,
        entry: lipa_ledger::NewJournalEntry,
    ) -> lipa_ledger::LedgerResult<lipa_ledger::JournalEntry> {
        tokio::time::sleep(self.delay).await;
        self.inner.post(entry).await
    }

    async fn balance(
        &self,
        account: &lipa_ledger::AccountRef,
    ) -> lipa_ledger::LedgerResult<lipa_money::Money> {
        self.inner.balance(account).await
    }

    async fn balance_as_of(
        &self,
        account: &lipa_ledger::AccountRef,
        at: chrono::DateTime<Utc>,
    ) -> lipa_ledger::LedgerResult<lipa_money::Money> {
        self.inner.balance_as_of(account, at).await
    }

    async fn entries_for_transaction(
        &self,
        transaction_id: &String,
    ) -> lipa_ledger::LedgerResult<Vec<lipa_ledger::JournalEntry>> {
        self.inner.entries_for_transaction(transaction_id).await
    }

    async fn entry(
        &self,
        entry_id: &String,
    ) -> lipa_ledger::LedgerResult<lipa_ledger::JournalEntry> {
        self.inner.entry(entry_id).await
    }

    async fn trial_balance(
        &self,
        currency: Currency,
    ) -> lipa_ledger::LedgerResult<rust_decimal::Decimal> {
        self.inner.trial_balance(currency).await
    }
}

#[tokio::test]
async fn post_timeout_compensates_and_frees_the_idempotency_key() {
    let engine_config = EngineConfig {
        db_timeout: std::time::Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let stack = stack_custom(
        RiskConfig::default(),
        engine_config,
        Some(Box::new(|inner| {
            Arc::new(StallingLedger {
                inner,
                delay: std::time::Duration::from_millis(400),
            }) as Arc<dyn LedgerStore>
        })),
    )
    .await;

    // Seeding goes through the stalling ledger too, but deposits are not
    // deadline-wrapped, so funding still works.
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(2000.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;

    let request = payment(
        "pay-timeout",
        dec!(1000.00),
        Currency::Mwk,
        ReceiverRef::UserId("bob".into()),
    );
    let err = stack
        .engine
        .initiate_payment(request.clone())
        .await
        .expect_err("deadline expiry");
    assert!(matches!(err, EngineError::DownstreamTimeout(_)));

    // Compensation released the reservation.
    let wallet = stack.wallets.get(&alice).await.expect("wallet");
    assert_eq!(wallet.available, dec!(2000.00));
    assert_eq!(wallet.reserved, dec!(0.00));
    stack.assert_books_balance().await;

    // The key was freed: the same reference claims fresh instead of
    // replaying or conflicting.
    let retry = stack
        .engine
        .initiate_payment(request)
        .await
        .expect_err("still timing out, but as a fresh attempt");
    assert!(matches!(retry, EngineError::DownstreamTimeout(_)));
}

#[tokio::test]
async fn inactive_sender_wallets_cannot_pay() {
    let stack = stack().await;
    let alice = funded_wallet(&stack, "alice", Currency::Mwk, dec!(2000.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;
    stack
        .wallets
        .set_status(&alice, lipa_wallet::WalletStatus::Suspended)
        .await
        .expect("suspend");

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-suspended",
            dec!(100.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("initiate");
    assert_eq!(result.transaction.status, TransactionStatus::Failed);
    assert_eq!(
        result.transaction.status_reason.as_deref(),
        Some("WALLET_NOT_ACTIVE")
    );
}

#[tokio::test]
async fn directory_backed_risk_rejection_is_recorded() {
    let stack = stack().await;
    funded_wallet(&stack, "alice", Currency::Mwk, dec!(2000.00)).await;
    funded_wallet(&stack, "bob", Currency::Mwk, dec!(0)).await;
    stack
        .directory
        .set_kyc(&"alice".to_string(), KycLevel::FULL, KycStatus::Pending)
        .await
        .expect("set kyc");

    let result = stack
        .engine
        .initiate_payment(payment(
            "pay-kyc",
            dec!(100.00),
            Currency::Mwk,
            ReceiverRef::UserId("bob".into()),
        ))
        .await
        .expect("initiate");
    assert_eq!(result.transaction.status, TransactionStatus::Failed);
    assert!(
        result
            .transaction
            .status_reason
            .as_deref()
            .expect("reason")
            .starts_with("RISK_REJECTED")
    );
}
