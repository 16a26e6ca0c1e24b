use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use anyhow::Context;
use anyhow::Result;
use chrono::Duration;
use lipa_risk::BreakerConfig;
use lipa_risk::RiskConfig;
use rust_decimal::Decimal;

use lipa_engine::EngineConfig;
use lipa_fx::SpreadConfig;
use lipa_settlement::WorkerConfig;

/// Runtime configuration for the whole core, assembled from the
/// environment (a `.env` file is honored). Every knob has the documented
/// default, so an empty environment yields a working configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub cache_url: Option<String>,
    pub engine: EngineConfig,
    pub risk: RiskConfig,
    pub breaker: BreakerConfig,
    pub spread: SpreadConfig,
    pub worker: WorkerConfig,
    pub idempotency_ttl: Duration,
    pub signature_ttl: Duration,
    /// Manual kill switch; the breaker treats it as permanently open.
    pub global_pause: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Testable core of `from_env`: resolve every knob through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let engine = EngineConfig {
            fee_rate: decimal(&lookup, "FEE_RATE", "0.015")?,
            min_fee: decimal(&lookup, "MIN_FEE", "0")?,
            ..EngineConfig::default()
        };

        let spread = SpreadConfig {
            base_spread: decimal(&lookup, "BASE_SPREAD", "0.015")?,
            min_spread: decimal(&lookup, "MIN_SPREAD", "0.001")?,
            max_spread: decimal(&lookup, "MAX_SPREAD", "0.05")?,
            vol_weight: decimal(&lookup, "VOL_MULT", "10")?,
            liq_weight: decimal(&lookup, "LIQ_MULT", "0.5")?,
            business_hours: (
                number(&lookup, "BUSINESS_HOURS_START", "8")?,
                number(&lookup, "BUSINESS_HOURS_END", "17")?,
            ),
            ..SpreadConfig::default()
        };

        let risk = RiskConfig {
            max_daily_limit: decimal(&lookup, "MAX_DAILY_LIMIT", "1000000")?,
            max_velocity_per_hour: number(&lookup, "MAX_VELOCITY_PER_HOUR", "10")?,
            high_value_threshold: decimal(&lookup, "HIGH_VALUE_THRESHOLD", "500000")?,
            admin_approval_threshold: decimal(&lookup, "ADMIN_APPROVAL_THRESHOLD", "500000")?,
            restricted_countries: country_set(&lookup, "RESTRICTED_COUNTRIES"),
            ..RiskConfig::default()
        };

        let breaker = BreakerConfig {
            threshold: number(&lookup, "BREAKER_THRESHOLD", "5")?,
            window: Duration::seconds(number(&lookup, "BREAKER_WINDOW", "60")?),
        };

        let worker = WorkerConfig {
            poll_every: StdDuration::from_secs(number(&lookup, "SETTLEMENT_POLL_SECONDS", "10")?),
            ..WorkerConfig::default()
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            cache_url: lookup("CACHE_URL"),
            engine,
            risk,
            breaker,
            spread,
            worker,
            idempotency_ttl: Duration::seconds(number(&lookup, "IDEMPOTENCY_TTL", "86400")?),
            signature_ttl: Duration::seconds(number(&lookup, "SIGNATURE_TTL", "300")?),
            global_pause: flag(&lookup, "GLOBAL_PAUSE"),
        })
    }
}

fn decimal(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<Decimal> {
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    Decimal::from_str(raw.trim()).with_context(|| format!("{key}={raw} is not a decimal"))
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .with_context(|| format!("{key}={raw} is not a number"))
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn country_set(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> HashSet<String> {
    lookup(key)
        .map(|raw| {
            raw.split(',')
                .map(|entry| entry.trim().to_ascii_uppercase())
                .filter(|entry| !entry.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
