use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lipa_audit::AuditSink;
use lipa_audit::InMemoryAuditLog;
use lipa_audit::InMemoryNotificationSink;
use lipa_audit::NotificationSink;
use lipa_directory::InMemoryUserDirectory;
use lipa_directory::KycLevel;
use lipa_directory::KycStatus;
use lipa_directory::User;
use lipa_directory::UserDirectory;
use lipa_engine::EngineConfig;
use lipa_engine::EngineParts;
use lipa_engine::InMemoryTransactionStore;
use lipa_engine::PaymentEngine;
use lipa_fx::FxService;
use lipa_fx::InMemoryRateHistory;
use lipa_fx::InMemorySharedCache;
use lipa_fx::RateProvider;
use lipa_fx::SharedCache;
use lipa_fx::SpreadConfig;
use lipa_fx::SpreadEngine;
use lipa_fx::StaticRateProvider;
use lipa_idempotency::InMemoryIdempotencyStore;
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
use lipa_settlement::SettlementNetwork;
use lipa_settlement::SettlementOutcomeHandler;
use lipa_settlement::SettlementResult;
use lipa_settlement::SettlementStore;
use lipa_settlement::SettlementWorker;
use lipa_settlement::WorkerConfig;
use lipa_wallet::InMemoryWalletStore;
use lipa_wallet::WalletStore;
use rust_decimal_macros::dec;

use crate::ControlsFacade;
use crate::PaymentsFacade;

pub const DEMO_SENDER: &str = "user-chimwemwe";
pub const DEMO_RECEIVER: &str = "user-li";
pub const DEMO_DEVICE: &str = "demo-device";

/// Settlement rail that always accepts and confirms immediately. Good for
/// demos; tests that need failure inject their own network.
struct LoopbackNetwork;

#[async_trait]
impl SettlementNetwork for LoopbackNetwork {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn submit(&self, settlement: &Settlement) -> SettlementResult<String> {
        Ok(format!("0x{}", settlement.batch_reference))
    }

    async fn confirm(&self, _external_hash: &str) -> SettlementResult<NetworkStatus> {
        Ok(NetworkStatus::Confirmed)
    }
}

/// A complete in-memory stack: two verified users, a funded MWK wallet, a
/// CNY wallet, warm MWK/CNY rates and a settlement worker on a loopback
/// rail.
pub struct DemoStack {
    pub facade: PaymentsFacade,
    pub controls: ControlsFacade,
    pub engine: Arc<PaymentEngine>,
    pub directory: Arc<InMemoryUserDirectory>,
    pub wallets: Arc<InMemoryWalletStore>,
    pub ledger: Arc<InMemoryLedgerStore>,
    pub settlements: Arc<InMemorySettlementStore>,
    pub notifications: Arc<InMemoryNotificationSink>,
    pub shared_cache: Arc<InMemorySharedCache>,
    pub blocklist: Arc<InMemoryBlocklist>,
    pub breaker: Arc<CircuitBreaker>,
    worker: SettlementWorker,
    pub sender_wallet_id: String,
    pub receiver_wallet_id: String,
}

impl DemoStack {
    /// Drives pending settlements to a terminal state, as the background
    /// worker loop would.
    pub async fn drain_settlements(&self) {
        self.worker.drain_once().await;
        self.worker.drain_once().await;
    }
}

fn demo_user(id: &str, name: &str, country: &str) -> User {
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

pub async fn demo_stack() -> DemoStack {
    let directory = Arc::new(InMemoryUserDirectory::new());
    directory
        .register(demo_user(DEMO_SENDER, "Chimwemwe Banda", "MW"))
        .await
        .expect("register demo sender");
    directory
        .register(demo_user(DEMO_RECEIVER, "Li Wei", "CN"))
        .await
        .expect("register demo receiver");
    directory
        .trust_device(&DEMO_SENDER.to_string(), DEMO_DEVICE)
        .await
        .expect("trust demo device");

    let provider: Arc<dyn RateProvider> = Arc::new(
        StaticRateProvider::new("demo-rates")
            .with_rate(Currency::Mwk, Currency::Cny, dec!(0.0085))
            .with_rate(Currency::Cny, Currency::Mwk, dec!(117.65))
            .with_rate(Currency::Mwk, Currency::Usd, dec!(0.00058))
            .with_rate(Currency::Usd, Currency::Mwk, dec!(1730.00)),
    );
    let shared_cache = Arc::new(InMemorySharedCache::new());
    let fx = Arc::new(FxService::new(
        vec![provider],
        SpreadEngine::new(SpreadConfig::neutral(dec!(0.015))),
        Arc::new(InMemoryRateHistory::new()),
        Some(Arc::clone(&shared_cache) as Arc<dyn SharedCache>),
    ));

    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let activity = Arc::new(InMemoryActivityStore::new());
    let blocklist = Arc::new(InMemoryBlocklist::new());
    let risk = Arc::new(RiskEngine::new(
        RiskConfig::default(),
        Arc::clone(&breaker),
        Arc::clone(&blocklist) as Arc<dyn Blocklist>,
        Arc::clone(&activity) as Arc<dyn ActivityStore>,
        Arc::clone(&directory) as Arc<dyn UserDirectory>,
    ));

    let ledger = Arc::new(InMemoryLedgerStore::new());
    let wallets = Arc::new(InMemoryWalletStore::default());
    let settlements = Arc::new(InMemorySettlementStore::new());
    let notifications = Arc::new(InMemoryNotificationSink::new());
    let audit = InMemoryAuditLog::shared();

    let engine = Arc::new(PaymentEngine::new(
        EngineConfig::default(),
        EngineParts {
            ledger: Arc::clone(&ledger) as Arc<dyn LedgerStore>,
            wallets: Arc::clone(&wallets) as Arc<dyn WalletStore>,
            transactions: Arc::new(InMemoryTransactionStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            fx: Arc::clone(&fx),
            risk,
            monitor: Arc::new(BehavioralMonitor::default()),
            activity: Arc::clone(&activity) as Arc<dyn ActivityStore>,
            directory: Arc::clone(&directory) as Arc<dyn UserDirectory>,
            settlements: Arc::clone(&settlements) as Arc<dyn SettlementStore>,
            audit: Arc::clone(&audit) as Arc<dyn AuditSink>,
            notifications: Arc::clone(&notifications) as Arc<dyn NotificationSink>,
            settlement_kick: None,
        },
    ));

    let worker = SettlementWorker::new(
        Arc::clone(&settlements) as Arc<dyn SettlementStore>,
        Arc::new(LoopbackNetwork),
        Arc::clone(&engine) as Arc<dyn SettlementOutcomeHandler>,
        WorkerConfig::default(),
    );

    let sender_wallet = engine
        .create_wallet(&DEMO_SENDER.to_string(), Currency::Mwk)
        .await
        .expect("create sender wallet");
    engine
        .deposit(
            &sender_wallet.id,
            Money::new(dec!(250000.00), Currency::Mwk),
            "demo-seed-mwk",
        )
        .await
        .expect("fund sender wallet");
    let receiver_wallet = engine
        .create_wallet(&DEMO_RECEIVER.to_string(), Currency::Cny)
        .await
        .expect("create receiver wallet");

    let facade = PaymentsFacade::new(
        Arc::clone(&engine),
        Arc::clone(&directory) as Arc<dyn UserDirectory>,
        Arc::clone(&wallets) as Arc<dyn WalletStore>,
        fx,
        Arc::clone(&audit) as Arc<dyn AuditSink>,
    );
    let controls = ControlsFacade::new(
        Arc::clone(&engine),
        Arc::clone(&blocklist) as Arc<dyn Blocklist>,
        Arc::clone(&breaker),
    );

    DemoStack {
        facade,
        controls,
        engine,
        directory,
        wallets,
        ledger,
        settlements,
        notifications,
        shared_cache,
        blocklist,
        breaker,
        worker,
        sender_wallet_id: sender_wallet.id,
        receiver_wallet_id: receiver_wallet.id,
    }
}
