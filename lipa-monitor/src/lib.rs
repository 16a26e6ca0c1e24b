#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::collections::VecDeque;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

pub type UserId = String;

/// Flags a rolling profile can raise about a payment. Flags weight into the
/// risk score; they never reject on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyFlag {
    SuddenSpike,
    HighVelocity,
    NewBeneficiary,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Flags are suppressed until a user has this many observations.
    pub min_samples: u64,
    /// SUDDEN_SPIKE when amount exceeds this multiple of the rolling mean.
    pub spike_multiplier: Decimal,
    /// HIGH_VELOCITY when two payments land within this window.
    pub velocity_window: Duration,
    /// NEW_BENEFICIARY only fires above this amount.
    pub new_beneficiary_threshold: Decimal,
    /// How many recent timestamps to retain per user.
    pub history_len: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            spike_multiplier: Decimal::from(5),
            velocity_window: Duration::seconds(60),
            new_beneficiary_threshold: Decimal::from(10_000),
            history_len: 20,
        }
    }
}

/// Per-user rolling state: Welford mean/variance of amounts, recent
/// timestamps, counterparty frequencies and the last seen location.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub samples: u64,
    mean: Decimal,
    m2: Decimal,
    timestamps: VecDeque<DateTime<Utc>>,
    counterparties: HashMap<String, u64>,
    pub last_location: Option<String>,
}

impl Profile {
    fn observe(&mut self, amount: Decimal, at: DateTime<Utc>, history_len: usize) {
        self.samples += 1;
        let count = Decimal::from(self.samples);
        let delta = amount - self.mean;
        self.mean += delta / count;
        let delta2 = amount - self.mean;
        self.m2 += delta * delta2;
        self.timestamps.push_back(at);
        while self.timestamps.len() > history_len {
            self.timestamps.pop_front();
        }
    }

    #[must_use]
    pub fn mean(&self) -> Decimal {
        self.mean
    }

    /// Population variance of observed amounts.
    #[must_use]
    pub fn variance(&self) -> Decimal {
        if self.samples == 0 {
            Decimal::ZERO
        } else {
            self.m2 / Decimal::from(self.samples)
        }
    }

    #[must_use]
    pub fn knows_counterparty(&self, counterparty: &str) -> bool {
        self.counterparties.contains_key(counterparty)
    }

    #[must_use]
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.timestamps.back().copied()
    }
}

/// Rolling behavioral profiles, one per user. `observe` is called on every
/// successful payment; `detect` is consulted before the risk score is
/// finalized.
pub struct BehavioralMonitor {
    config: MonitorConfig,
    profiles: RwLock<HashMap<UserId, Profile>>,
}

impl Default for BehavioralMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl BehavioralMonitor {
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            profiles: RwLock::new(HashMap::new()),
        }
    }

    pub async fn observe(
        &self,
        user_id: &UserId,
        amount: Decimal,
        counterparty: &str,
        location: Option<&str>,
        at: DateTime<Utc>,
    ) {
        let mut profiles = self.profiles.write().await;
        let profile = profiles.entry(user_id.clone()).or_default();
        profile.observe(amount, at, self.config.history_len);
        *profile
            .counterparties
            .entry(counterparty.to_string())
            .or_default() += 1;
        if let Some(location) = location {
            profile.last_location = Some(location.to_string());
        }
    }

    /// Evaluates a prospective payment against the profile. Quiet until the
    /// user has at least `min_samples` observations.
    pub async fn detect(
        &self,
        user_id: &UserId,
        amount: Decimal,
        counterparty: &str,
        at: DateTime<Utc>,
    ) -> Vec<AnomalyFlag> {
        let profiles = self.profiles.read().await;
        let Some(profile) = profiles.get(user_id) else {
            return Vec::new();
        };
        if profile.samples < self.config.min_samples {
            return Vec::new();
        }

        let mut flags = Vec::new();
        if profile.mean() > Decimal::ZERO && amount > profile.mean() * self.config.spike_multiplier
        {
            flags.push(AnomalyFlag::SuddenSpike);
        }
        if let Some(last) = profile.last_seen()
            && at - last < self.config.velocity_window
        {
            flags.push(AnomalyFlag::HighVelocity);
        }
        if !profile.knows_counterparty(counterparty)
            && amount > self.config.new_beneficiary_threshold
        {
            flags.push(AnomalyFlag::NewBeneficiary);
        }
        flags
    }

    pub async fn profile(&self, user_id: &UserId) -> Option<Profile> {
        let profiles = self.profiles.read().await;
        profiles.get(user_id).cloned()
    }
}
