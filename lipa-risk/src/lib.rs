#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use lipa_directory::KycLevel;
use lipa_directory::KycStatus;
use lipa_directory::User;
use lipa_directory::UserDirectory;
use lipa_monitor::AnomalyFlag;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

mod activity;
mod breaker;

pub use activity::ActivityStore;
pub use activity::InMemoryActivityStore;
pub use breaker::BreakerConfig;
pub use breaker::CircuitBreaker;

pub type UserId = String;

pub type RiskResult<T> = Result<T, RiskError>;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("directory error: {0}")]
    Directory(#[from] lipa_directory::DirectoryError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-transaction limit for each KYC level, and the minimum level required
/// by amount tier. Amounts are magnitudes in the payment's source currency.
#[derive(Debug, Clone)]
pub struct KycTiers {
    pub tier1_max: Decimal,
    pub tier2_max: Decimal,
    pub level3_limit: Decimal,
}

impl Default for KycTiers {
    fn default() -> Self {
        Self {
            tier1_max: Decimal::from(10_000),
            tier2_max: Decimal::from(100_000),
            level3_limit: Decimal::from(1_000_000),
        }
    }
}

impl KycTiers {
    /// The minimum KYC level a sender needs for `amount`.
    #[must_use]
    pub fn required_level(&self, amount: Decimal) -> KycLevel {
        if amount < self.tier1_max {
            KycLevel::BASIC
        } else if amount < self.tier2_max {
            KycLevel::STANDARD
        } else {
            KycLevel::FULL
        }
    }

    /// The comfort limit for a level; exceeding it weighs into the risk
    /// score without hard-rejecting.
    #[must_use]
    pub fn level_limit(&self, level: KycLevel) -> Decimal {
        if level >= KycLevel::FULL {
            self.level3_limit
        } else if level >= KycLevel::STANDARD {
            self.tier2_max
        } else if level >= KycLevel::BASIC {
            self.tier1_max
        } else {
            Decimal::ZERO
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_daily_limit: Decimal,
    pub max_velocity_per_hour: u32,
    pub high_value_threshold: Decimal,
    pub admin_approval_threshold: Decimal,
    pub restricted_countries: HashSet<String>,
    pub kyc_tiers: KycTiers,
    /// Score weights, clamped into [0, 100] after summing.
    pub weight_over_kyc_limit: u8,
    pub weight_untrusted_device: u8,
    pub weight_high_value: u8,
    pub weight_suspicious_location: u8,
    pub weight_per_anomaly: u8,
    pub reject_score: u8,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_limit: Decimal::from(1_000_000),
            max_velocity_per_hour: 10,
            high_value_threshold: Decimal::from(500_000),
            admin_approval_threshold: Decimal::from(500_000),
            restricted_countries: HashSet::new(),
            kyc_tiers: KycTiers::default(),
            weight_over_kyc_limit: 40,
            weight_untrusted_device: 60,
            weight_high_value: 40,
            weight_suspicious_location: 50,
            weight_per_anomaly: 15,
            reject_score: 100,
        }
    }
}

/// Why a payment was turned away. Every variant maps onto the public
/// RISK_REJECTED code except `SystemPaused`, which is its own 503.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "reason")]
pub enum RiskRejection {
    SystemPaused,
    Blacklisted { subject: String },
    KycNotVerified,
    KycLevelTooLow { required: u8, actual: u8 },
    RestrictedCountry { country: String },
    DailyLimitExceeded,
    VelocityExceeded,
    CoolOff { until: DateTime<Utc> },
    ScoreTooHigh { score: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskOutcome {
    Allow { score: u8 },
    RequireApproval { score: u8 },
    Reject(RiskRejection),
}

/// Everything the checks need about one prospective payment. The engine
/// gathers user, device and anomaly context before calling `assess`.
#[derive(Debug, Clone)]
pub struct RiskRequest {
    pub sender: UserId,
    pub receiver: UserId,
    pub amount: Decimal,
    pub device_hash: Option<String>,
    pub ip_address: Option<String>,
    pub location_suspicious: bool,
    pub anomalies: Vec<AnomalyFlag>,
}

/// Mutable block/allow state consulted by check 2. Admin surfaces add and
/// remove entries; the engine only reads.
#[async_trait]
pub trait Blocklist: Send + Sync {
    async fn is_blocked(&self, value: &str) -> RiskResult<bool>;

    async fn block(&self, value: &str) -> RiskResult<()>;

    async fn unblock(&self, value: &str) -> RiskResult<()>;
}

#[derive(Default)]
pub struct InMemoryBlocklist {
    entries: RwLock<HashSet<String>>,
}

impl InMemoryBlocklist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Blocklist for InMemoryBlocklist {
    async fn is_blocked(&self, value: &str) -> RiskResult<bool> {
        let entries = self.entries.read().await;
        Ok(entries.contains(value))
    }

    async fn block(&self, value: &str) -> RiskResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(value.to_string());
        Ok(())
    }

    async fn unblock(&self, value: &str) -> RiskResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(value);
        Ok(())
    }
}

/// One evaluated request, as recorded for compliance review. Mirrors what
/// the checks saw, not what the engine later did with the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvaluationEvent {
    pub sender: UserId,
    pub receiver: UserId,
    pub amount: Decimal,
    pub outcome: RiskEvaluationOutcome,
    pub anomalies: Vec<AnomalyFlag>,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "decision")]
pub enum RiskEvaluationOutcome {
    Allowed { score: u8 },
    ApprovalRequired { score: u8 },
    Rejected { rejection: RiskRejection },
}

#[async_trait]
pub trait RiskEventSink: Send + Sync {
    async fn record(&self, event: RiskEvaluationEvent);
}

#[derive(Clone, Default)]
pub struct NoopRiskEventSink;

#[async_trait]
impl RiskEventSink for NoopRiskEventSink {
    async fn record(&self, _event: RiskEvaluationEvent) {}
}

#[derive(Default)]
pub struct InMemoryRiskEventSink {
    events: RwLock<Vec<RiskEvaluationEvent>>,
}

impl InMemoryRiskEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RiskEvaluationEvent> {
        let guard = self.events.read().await;
        guard.clone()
    }
}

#[async_trait]
impl RiskEventSink for InMemoryRiskEventSink {
    async fn record(&self, event: RiskEvaluationEvent) {
        let mut guard = self.events.write().await;
        guard.push(event);
    }
}

/// The ordered check chain run for every payment. Any failing check
/// short-circuits; checks that pass fall through to scoring, and scoring
/// falls through to the admin-approval threshold.
pub struct RiskEngine {
    config: RiskConfig,
    breaker: Arc<CircuitBreaker>,
    blocklist: Arc<dyn Blocklist>,
    activity: Arc<dyn ActivityStore>,
    directory: Arc<dyn UserDirectory>,
    event_sink: Arc<dyn RiskEventSink>,
}

impl RiskEngine {
    #[must_use]
    pub fn new(
        config: RiskConfig,
        breaker: Arc<CircuitBreaker>,
        blocklist: Arc<dyn Blocklist>,
        activity: Arc<dyn ActivityStore>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            config,
            breaker,
            blocklist,
            activity,
            directory,
            event_sink: Arc::new(NoopRiskEventSink),
        }
    }

    #[must_use]
    pub fn with_event_sink(mut self, event_sink: Arc<dyn RiskEventSink>) -> Self {
        self.event_sink = event_sink;
        self
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn assess(&self, request: &RiskRequest) -> RiskResult<RiskOutcome> {
        let outcome = self.run_checks(request).await?;
        let recorded = match &outcome {
            RiskOutcome::Allow { score } => RiskEvaluationOutcome::Allowed { score: *score },
            RiskOutcome::RequireApproval { score } => {
                RiskEvaluationOutcome::ApprovalRequired { score: *score }
            }
            RiskOutcome::Reject(rejection) => RiskEvaluationOutcome::Rejected {
                rejection: rejection.clone(),
            },
        };
        self.event_sink
            .record(RiskEvaluationEvent {
                sender: request.sender.clone(),
                receiver: request.receiver.clone(),
                amount: request.amount,
                outcome: recorded,
                anomalies: request.anomalies.clone(),
                evaluated_at: Utc::now(),
            })
            .await;
        Ok(outcome)
    }

    async fn run_checks(&self, request: &RiskRequest) -> RiskResult<RiskOutcome> {
        let now = Utc::now();

        // 1. Global circuit breaker / manual pause.
        if self.breaker.is_open(now) {
            return Ok(RiskOutcome::Reject(RiskRejection::SystemPaused));
        }

        // 2. Blocklist over every identifying handle on the request.
        for subject in self.blocklist_subjects(request) {
            if self.blocklist.is_blocked(&subject).await? {
                warn!(subject, "payment blocked by blocklist");
                return Ok(RiskOutcome::Reject(RiskRejection::Blacklisted { subject }));
            }
        }

        let sender = self.directory.find_by_id(&request.sender).await?;

        // 3. KYC status and amount-tier level.
        if sender.kyc_status != KycStatus::Verified {
            return Ok(RiskOutcome::Reject(RiskRejection::KycNotVerified));
        }
        let required = self.config.kyc_tiers.required_level(request.amount);
        if sender.kyc_level < required {
            return Ok(RiskOutcome::Reject(RiskRejection::KycLevelTooLow {
                required: required.0,
                actual: sender.kyc_level.0,
            }));
        }

        // 4. Restricted sender country.
        if self
            .config
            .restricted_countries
            .contains(&sender.country.to_ascii_uppercase())
        {
            return Ok(RiskOutcome::Reject(RiskRejection::RestrictedCountry {
                country: sender.country.clone(),
            }));
        }

        // 5. Daily debit limit, counting completed and pending debits.
        let daily = self
            .activity
            .daily_debit_total(&request.sender, now)
            .await?;
        if daily + request.amount > self.config.max_daily_limit {
            return Ok(RiskOutcome::Reject(RiskRejection::DailyLimitExceeded));
        }

        // 6. Hourly velocity.
        let recent = self
            .activity
            .successes_in_hour(&request.sender, now)
            .await?;
        if recent >= self.config.max_velocity_per_hour {
            return Ok(RiskOutcome::Reject(RiskRejection::VelocityExceeded));
        }

        // 7. Cool-off window.
        if let Some(until) = self.activity.cooloff_until(&request.sender).await?
            && until > now
        {
            return Ok(RiskOutcome::Reject(RiskRejection::CoolOff { until }));
        }

        // 8. Risk score.
        let score = self.score(&sender, request).await?;
        if score >= self.config.reject_score {
            return Ok(RiskOutcome::Reject(RiskRejection::ScoreTooHigh { score }));
        }

        // 9. Admin approval threshold.
        if request.amount >= self.config.admin_approval_threshold {
            return Ok(RiskOutcome::RequireApproval { score });
        }

        Ok(RiskOutcome::Allow { score })
    }

    fn blocklist_subjects(&self, request: &RiskRequest) -> Vec<String> {
        let mut subjects = vec![request.sender.clone(), request.receiver.clone()];
        if let Some(device) = &request.device_hash {
            subjects.push(device.clone());
        }
        if let Some(ip) = &request.ip_address {
            subjects.push(ip.clone());
        }
        subjects
    }

    async fn score(&self, sender: &User, request: &RiskRequest) -> RiskResult<u8> {
        let config = &self.config;
        let mut score: u32 = 0;

        if request.amount > config.kyc_tiers.level_limit(sender.kyc_level) {
            score += u32::from(config.weight_over_kyc_limit);
        }

        let device_trusted = match &request.device_hash {
            Some(device) => {
                self.directory
                    .is_device_trusted(&request.sender, device)
                    .await?
            }
            None => false,
        };
        if !device_trusted {
            score += u32::from(config.weight_untrusted_device);
        }

        if request.amount > config.high_value_threshold {
            score += u32::from(config.weight_high_value);
        }

        if request.location_suspicious {
            score += u32::from(config.weight_suspicious_location);
        }

        score += request.anomalies.len() as u32 * u32::from(config.weight_per_anomaly);

        Ok(score.min(100) as u8)
    }
}
