#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use lipa_money::Currency;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::warn;

mod refresh;
mod spread;

pub use refresh::RateRefresher;
pub use refresh::RefreshSchedule;
pub use spread::SpreadConfig;
pub use spread::SpreadEngine;
pub use spread::VolatilityTracker;

pub type FxResult<T> = Result<T, FxError>;

/// Per-provider fetch deadline (§5 gives providers 2 s each).
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a freshly quoted rate stays servable from cache.
pub const QUOTE_VALIDITY_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum FxError {
    #[error("no rate available for {base}->{target}")]
    RateUnavailable { base: Currency, target: Currency },
    #[error("provider {provider} failed: {message}")]
    ProviderFailure { provider: String, message: String },
    #[error("provider {0} timed out")]
    ProviderTimeout(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// A raw mid-rate as delivered by an upstream provider, before the spread
/// engine touches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRate {
    pub mid: Decimal,
    pub source: String,
    pub captured_at: DateTime<Utc>,
}

/// A fully quoted rate: mid plus the buy/sell pair the spread engine
/// derived from it. Historical rows of this shape are retained for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateQuote {
    pub base: Currency,
    pub target: Currency,
    pub mid: Decimal,
    pub buy: Decimal,
    pub sell: Decimal,
    pub spread: Decimal,
    pub source: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
}

impl RateQuote {
    #[must_use]
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_to > at
    }

    /// The synthetic 1:1 quote for same-currency "conversions".
    #[must_use]
    pub fn identity(currency: Currency, now: DateTime<Utc>) -> Self {
        Self {
            base: currency,
            target: currency,
            mid: Decimal::ONE,
            buy: Decimal::ONE,
            sell: Decimal::ONE,
            spread: Decimal::ZERO,
            source: "identity".into(),
            valid_from: now,
            valid_to: now + chrono::Duration::seconds(QUOTE_VALIDITY_SECS),
            captured_at: now,
        }
    }
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, base: Currency, target: Currency) -> FxResult<ProviderRate>;
}

/// Distributed cache seam (Redis in production). Values are opaque strings;
/// the FX service stores serialized quotes under `fx:<base>-<target>`.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> FxResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> FxResult<()>;
}

#[derive(Default)]
pub struct InMemorySharedCache {
    entries: RwLock<HashMap<String, (String, DateTime<Utc>)>>,
}

impl InMemorySharedCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn get(&self, key: &str) -> FxResult<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> FxResult<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|err| FxError::Cache(format!("ttl out of range: {err}")))?;
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value.to_string(), Utc::now() + ttl));
        Ok(())
    }
}

/// Historical quote log, append-only, queryable for audit.
#[async_trait]
pub trait RateHistory: Send + Sync {
    async fn append(&self, quote: RateQuote) -> FxResult<()>;

    async fn latest(&self, base: Currency, target: Currency) -> FxResult<Option<RateQuote>>;

    async fn range(
        &self,
        base: Currency,
        target: Currency,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FxResult<Vec<RateQuote>>;
}

#[derive(Default)]
pub struct InMemoryRateHistory {
    quotes: RwLock<Vec<RateQuote>>,
}

impl InMemoryRateHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateHistory for InMemoryRateHistory {
    async fn append(&self, quote: RateQuote) -> FxResult<()> {
        let mut quotes = self.quotes.write().await;
        quotes.push(quote);
        Ok(())
    }

    async fn latest(&self, base: Currency, target: Currency) -> FxResult<Option<RateQuote>> {
        let quotes = self.quotes.read().await;
        Ok(quotes
            .iter()
            .rev()
            .find(|quote| quote.base == base && quote.target == target)
            .cloned())
    }

    async fn range(
        &self,
        base: Currency,
        target: Currency,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FxResult<Vec<RateQuote>> {
        let quotes = self.quotes.read().await;
        Ok(quotes
            .iter()
            .filter(|quote| {
                quote.base == base
                    && quote.target == target
                    && quote.captured_at >= from
                    && quote.captured_at <= to
            })
            .cloned()
            .collect())
    }
}

/// Fixed-table provider used by tests and the demo wiring.
pub struct StaticRateProvider {
    name: String,
    rates: HashMap<(Currency, Currency), Decimal>,
}

impl StaticRateProvider {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rates: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_rate(mut self, base: Currency, target: Currency, mid: Decimal) -> Self {
        self.rates.insert((base, target), mid);
        self
    }
}

#[async_trait]
impl RateProvider for StaticRateProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, base: Currency, target: Currency) -> FxResult<ProviderRate> {
        match self.rates.get(&(base, target)) {
            Some(mid) => Ok(ProviderRate {
                mid: *mid,
                source: self.name.clone(),
                captured_at: Utc::now(),
            }),
            None => Err(FxError::ProviderFailure {
                provider: self.name.clone(),
                message: format!("no quote for {base}->{target}"),
            }),
        }
    }
}

/// Provider that always fails; tests use it to exercise chain fallthrough.
pub struct FailingRateProvider {
    name: String,
}

impl FailingRateProvider {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl RateProvider for FailingRateProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _base: Currency, _target: Currency) -> FxResult<ProviderRate> {
        Err(FxError::ProviderFailure {
            provider: self.name.clone(),
            message: "provider unavailable".into(),
        })
    }
}

/// Rate resolution: identity → local cache → shared cache → history →
/// provider chain. Only a full provider-chain failure surfaces
/// `RateUnavailable`.
pub struct FxService {
    providers: Vec<Arc<dyn RateProvider>>,
    spread: SpreadEngine,
    history: Arc<dyn RateHistory>,
    shared_cache: Option<Arc<dyn SharedCache>>,
    local_cache: RwLock<HashMap<(Currency, Currency), RateQuote>>,
    volatility: Mutex<VolatilityTracker>,
    provider_timeout: Duration,
}

impl FxService {
    #[must_use]
    pub fn new(
        providers: Vec<Arc<dyn RateProvider>>,
        spread: SpreadEngine,
        history: Arc<dyn RateHistory>,
        shared_cache: Option<Arc<dyn SharedCache>>,
    ) -> Self {
        Self {
            providers,
            spread,
            history,
            shared_cache,
            local_cache: RwLock::new(HashMap::new()),
            volatility: Mutex::new(VolatilityTracker::new()),
            provider_timeout: PROVIDER_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    fn cache_key(base: Currency, target: Currency) -> String {
        format!("fx:{base}-{target}")
    }

    pub async fn rate(&self, base: Currency, target: Currency) -> FxResult<RateQuote> {
        let now = Utc::now();
        if base == target {
            return Ok(RateQuote::identity(base, now));
        }

        {
            let cache = self.local_cache.read().await;
            if let Some(quote) = cache.get(&(base, target))
                && quote.is_valid_at(now)
            {
                return Ok(quote.clone());
            }
        }

        if let Some(shared) = &self.shared_cache {
            match shared.get(&Self::cache_key(base, target)).await {
                Ok(Some(raw)) => {
                    if let Ok(quote) = serde_json::from_str::<RateQuote>(&raw)
                        && quote.is_valid_at(now)
                    {
                        let mut cache = self.local_cache.write().await;
                        cache.insert((base, target), quote.clone());
                        return Ok(quote);
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "shared rate cache read failed"),
            }
        }

        match self.history.latest(base, target).await {
            Ok(Some(quote)) if quote.is_valid_at(now) => {
                let mut cache = self.local_cache.write().await;
                cache.insert((base, target), quote.clone());
                return Ok(quote);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "rate history read failed"),
        }

        self.fetch_from_providers(base, target).await
    }

    /// Goes straight to the provider chain, bypassing every cache. The
    /// refresher uses this to keep the supported pairs warm.
    pub async fn refresh_pair(&self, base: Currency, target: Currency) -> FxResult<RateQuote> {
        if base == target {
            return Err(FxError::Validation(
                "cannot refresh an identity pair".into(),
            ));
        }
        self.fetch_from_providers(base, target).await
    }

    async fn fetch_from_providers(
        &self,
        base: Currency,
        target: Currency,
    ) -> FxResult<RateQuote> {
        for provider in &self.providers {
            let fetched =
                tokio::time::timeout(self.provider_timeout, provider.fetch(base, target)).await;
            let rate = match fetched {
                Ok(Ok(rate)) => rate,
                Ok(Err(err)) => {
                    warn!(provider = provider.name(), error = %err, "rate provider failed");
                    continue;
                }
                Err(_) => {
                    warn!(provider = provider.name(), "rate provider timed out");
                    continue;
                }
            };

            let sigma = {
                let mut volatility = self.volatility.lock().await;
                volatility.observe(base, target, rate.mid, rate.captured_at);
                volatility.realized(base, target, rate.captured_at)
            };
            let quote = self.spread.quote(base, target, &rate, sigma)?;
            self.store_quote(&quote).await;
            debug!(
                base = %base,
                target = %target,
                mid = %quote.mid,
                spread = %quote.spread,
                source = quote.source,
                "quoted fresh rate"
            );
            return Ok(quote);
        }
        Err(FxError::RateUnavailable { base, target })
    }

    /// Feeds the most recent cached mid back into the volatility tracker.
    /// The refresher calls this once a minute.
    pub async fn sample_volatility(&self) {
        let cached: Vec<RateQuote> = {
            let cache = self.local_cache.read().await;
            cache.values().cloned().collect()
        };
        let now = Utc::now();
        let mut volatility = self.volatility.lock().await;
        for quote in cached {
            volatility.observe(quote.base, quote.target, quote.mid, now);
        }
    }

    async fn store_quote(&self, quote: &RateQuote) {
        if let Err(err) = self.history.append(quote.clone()).await {
            warn!(error = %err, "failed to append rate history");
        }
        if let Some(shared) = &self.shared_cache {
            let ttl = (quote.valid_to - quote.valid_from)
                .to_std()
                .unwrap_or(Duration::from_secs(QUOTE_VALIDITY_SECS as u64));
            match serde_json::to_string(quote) {
                Ok(raw) => {
                    if let Err(err) = shared
                        .set(&Self::cache_key(quote.base, quote.target), &raw, ttl)
                        .await
                    {
                        warn!(error = %err, "failed to write shared rate cache");
                    }
                }
                Err(err) => warn!(error = %err, "failed to serialize rate quote"),
            }
        }
        let mut cache = self.local_cache.write().await;
        cache.insert((quote.base, quote.target), quote.clone());
    }
}
