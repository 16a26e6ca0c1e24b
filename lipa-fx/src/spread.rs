use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use chrono::DateTime;
use chrono::Datelike;
use chrono::Duration;
use chrono::Timelike;
use chrono::Utc;
use chrono::Weekday;
use lipa_money::Currency;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::prelude::ToPrimitive;

use crate::FxError;
use crate::FxResult;
use crate::ProviderRate;
use crate::QUOTE_VALIDITY_SECS;
use crate::RateQuote;

/// Knobs for turning a mid-rate into a buy/sell pair. The base spread is
/// widened multiplicatively by volatility, thin liquidity, trading hours and
/// pair exoticism, then clamped into `[min_spread, max_spread]`.
#[derive(Debug, Clone)]
pub struct SpreadConfig {
    pub base_spread: Decimal,
    pub min_spread: Decimal,
    pub max_spread: Decimal,
    /// Weight on realized volatility: factor = 1 + weight · sigma.
    pub vol_weight: Decimal,
    /// Weight on illiquidity: factor = 1 + weight · (1 − pair liquidity).
    pub liq_weight: Decimal,
    pub off_hours_multiplier: Decimal,
    pub weekend_multiplier: Decimal,
    pub exotic_multiplier: Decimal,
    /// Business hours in UTC, start inclusive, end exclusive.
    pub business_hours: (u32, u32),
    /// Currencies considered major. A pair is exotic when either side is
    /// outside this set.
    pub major_currencies: HashSet<Currency>,
    /// Per-currency liquidity in [0, 1]; absent currencies count as fully
    /// liquid. Pair liquidity is the minimum of the two sides.
    pub liquidity: HashMap<Currency, Decimal>,
}

impl Default for SpreadConfig {
    fn default() -> Self {
        Self {
            base_spread: Decimal::new(15, 3),
            min_spread: Decimal::new(1, 3),
            max_spread: Decimal::new(5, 2),
            vol_weight: Decimal::TEN,
            liq_weight: Decimal::new(5, 1),
            off_hours_multiplier: Decimal::new(125, 2),
            weekend_multiplier: Decimal::new(15, 1),
            exotic_multiplier: Decimal::new(15, 1),
            business_hours: (8, 17),
            major_currencies: Currency::ALL.into_iter().collect(),
            liquidity: HashMap::new(),
        }
    }
}

impl SpreadConfig {
    /// A configuration where every adjustment factor is 1, so the effective
    /// spread equals `base_spread` regardless of clock or volatility. Tests
    /// and fixed-spread deployments use this.
    #[must_use]
    pub fn neutral(base_spread: Decimal) -> Self {
        Self {
            base_spread,
            min_spread: Decimal::ZERO,
            max_spread: Decimal::ONE,
            vol_weight: Decimal::ZERO,
            liq_weight: Decimal::ZERO,
            off_hours_multiplier: Decimal::ONE,
            weekend_multiplier: Decimal::ONE,
            exotic_multiplier: Decimal::ONE,
            business_hours: (0, 24),
            major_currencies: Currency::ALL.into_iter().collect(),
            liquidity: HashMap::new(),
        }
    }

    fn pair_liquidity(&self, base: Currency, target: Currency) -> Decimal {
        let of = |currency: Currency| {
            self.liquidity
                .get(&currency)
                .copied()
                .unwrap_or(Decimal::ONE)
        };
        of(base).min(of(target))
    }

    fn is_exotic(&self, base: Currency, target: Currency) -> bool {
        !self.major_currencies.contains(&base) || !self.major_currencies.contains(&target)
    }

    fn is_off_hours(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour();
        let (start, end) = self.business_hours;
        hour < start || hour >= end
    }

    fn is_weekend(at: DateTime<Utc>) -> bool {
        matches!(at.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

pub struct SpreadEngine {
    config: SpreadConfig,
}

impl SpreadEngine {
    #[must_use]
    pub fn new(config: SpreadConfig) -> Self {
        Self { config }
    }

    /// The clamped effective spread for a pair at an instant. `sigma` is the
    /// realized volatility of the pair's log-returns, the one input allowed
    /// to come from floating point.
    #[must_use]
    pub fn effective_spread(
        &self,
        base: Currency,
        target: Currency,
        sigma: f64,
        at: DateTime<Utc>,
    ) -> Decimal {
        let config = &self.config;
        let sigma = Decimal::from_f64(sigma.max(0.0)).unwrap_or(Decimal::ZERO);

        let mut spread = config.base_spread;
        spread *= Decimal::ONE + config.vol_weight * sigma;
        spread *=
            Decimal::ONE + config.liq_weight * (Decimal::ONE - config.pair_liquidity(base, target));
        if config.is_off_hours(at) {
            spread *= config.off_hours_multiplier;
        }
        if SpreadConfig::is_weekend(at) {
            spread *= config.weekend_multiplier;
        }
        if config.is_exotic(base, target) {
            spread *= config.exotic_multiplier;
        }
        spread.clamp(config.min_spread, config.max_spread)
    }

    /// Builds the full quote: buy = mid·(1 + s/2), sell = mid·(1 − s/2).
    pub fn quote(
        &self,
        base: Currency,
        target: Currency,
        rate: &ProviderRate,
        sigma: f64,
    ) -> FxResult<RateQuote> {
        if rate.mid <= Decimal::ZERO {
            return Err(FxError::Validation(format!(
                "provider {} returned non-positive mid {}",
                rate.source, rate.mid
            )));
        }
        let spread = self.effective_spread(base, target, sigma, rate.captured_at);
        let half = spread / Decimal::TWO;
        let now = Utc::now();
        Ok(RateQuote {
            base,
            target,
            mid: rate.mid,
            buy: rate.mid * (Decimal::ONE + half),
            sell: rate.mid * (Decimal::ONE - half),
            spread,
            source: rate.source.clone(),
            valid_from: now,
            valid_to: now + Duration::seconds(QUOTE_VALIDITY_SECS),
            captured_at: rate.captured_at,
        })
    }
}

/// Rolling log-return volatility per pair over a one-hour window. This is a
/// heuristic input to the spread, not a balance, so `f64` is acceptable
/// here and nowhere else.
pub struct VolatilityTracker {
    window: Duration,
    samples: HashMap<(Currency, Currency), VecDeque<(DateTime<Utc>, f64)>>,
}

impl Default for VolatilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl VolatilityTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: Duration::hours(1),
            samples: HashMap::new(),
        }
    }

    pub fn observe(
        &mut self,
        base: Currency,
        target: Currency,
        mid: Decimal,
        at: DateTime<Utc>,
    ) {
        let Some(mid) = mid.to_f64() else {
            return;
        };
        if mid <= 0.0 {
            return;
        }
        let series = self.samples.entry((base, target)).or_default();
        series.push_back((at, mid));
        let cutoff = at - self.window;
        while series.front().is_some_and(|(stamp, _)| *stamp < cutoff) {
            series.pop_front();
        }
    }

    /// Population standard deviation of consecutive log-returns inside the
    /// window. Fewer than three samples reads as calm.
    #[must_use]
    pub fn realized(&self, base: Currency, target: Currency, now: DateTime<Utc>) -> f64 {
        let Some(series) = self.samples.get(&(base, target)) else {
            return 0.0;
        };
        let cutoff = now - self.window;
        let mids: Vec<f64> = series
            .iter()
            .filter(|(stamp, _)| *stamp >= cutoff)
            .map(|(_, mid)| *mid)
            .collect();
        if mids.len() < 3 {
            return 0.0;
        }
        let returns: Vec<f64> = mids.windows(2).map(|pair| (pair[1] / pair[0]).ln()).collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns
            .iter()
            .map(|value| (value - mean).powi(2))
            .sum::<f64>()
            / returns.len() as f64;
        variance.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn weekday_business_hour() -> DateTime<Utc> {
        // 2026-03-04 is a Wednesday.
        DateTime::parse_from_rfc3339("2026-03-04T10:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    fn saturday() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-07T10:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn base_spread_passes_through_when_factors_are_neutral() {
        let engine = SpreadEngine::new(SpreadConfig::neutral(dec!(0.015)));
        let spread = engine.effective_spread(
            Currency::Mwk,
            Currency::Cny,
            0.0,
            weekday_business_hour(),
        );
        assert_eq!(spread, dec!(0.015));
    }

    #[test]
    fn quote_splits_the_spread_around_the_mid() {
        let engine = SpreadEngine::new(SpreadConfig::neutral(dec!(0.015)));
        let quote = engine
            .quote(
                Currency::Mwk,
                Currency::Cny,
                &ProviderRate {
                    mid: dec!(0.0085),
                    source: "test".into(),
                    captured_at: weekday_business_hour(),
                },
                0.0,
            )
            .expect("quote");
        assert_eq!(quote.sell, dec!(0.00843625));
        assert_eq!(quote.buy, dec!(0.00856375));
        assert_eq!(quote.spread, dec!(0.015));
    }

    #[test]
    fn weekend_and_off_hours_widen_the_spread() {
        let config = SpreadConfig {
            base_spread: dec!(0.010),
            min_spread: Decimal::ZERO,
            max_spread: Decimal::ONE,
            ..SpreadConfig::default()
        };
        let engine = SpreadEngine::new(config);

        let weekday = engine.effective_spread(
            Currency::Mwk,
            Currency::Cny,
            0.0,
            weekday_business_hour(),
        );
        assert_eq!(weekday, dec!(0.010));

        let weekend = engine.effective_spread(Currency::Mwk, Currency::Cny, 0.0, saturday());
        assert_eq!(weekend, dec!(0.015));

        let midnight = DateTime::parse_from_rfc3339("2026-03-04T02:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);
        let off_hours = engine.effective_spread(Currency::Mwk, Currency::Cny, 0.0, midnight);
        assert_eq!(off_hours, dec!(0.0125));
    }

    #[test]
    fn volatility_widens_and_clamp_caps() {
        let config = SpreadConfig {
            base_spread: dec!(0.010),
            max_spread: dec!(0.018),
            ..SpreadConfig::default()
        };
        let engine = SpreadEngine::new(config);

        let calm = engine.effective_spread(
            Currency::Mwk,
            Currency::Cny,
            0.0,
            weekday_business_hour(),
        );
        let stressed = engine.effective_spread(
            Currency::Mwk,
            Currency::Cny,
            0.5,
            weekday_business_hour(),
        );
        assert!(stressed > calm);
        // weight 10 · sigma 0.5 would put the raw spread at 0.06; the clamp
        // holds it at the ceiling.
        assert_eq!(stressed, dec!(0.018));
    }

    #[test]
    fn illiquid_currencies_widen_the_spread() {
        let mut config = SpreadConfig {
            base_spread: dec!(0.010),
            min_spread: Decimal::ZERO,
            max_spread: Decimal::ONE,
            ..SpreadConfig::default()
        };
        config.liquidity.insert(Currency::Mwk, dec!(0.2));
        let engine = SpreadEngine::new(config);

        let spread = engine.effective_spread(
            Currency::Mwk,
            Currency::Cny,
            0.0,
            weekday_business_hour(),
        );
        // factor = 1 + 0.5 · (1 − 0.2) = 1.4
        assert_eq!(spread, dec!(0.0140));
    }

    #[test]
    fn non_major_pairs_pay_the_exotic_multiplier() {
        let mut config = SpreadConfig {
            base_spread: dec!(0.010),
            min_spread: Decimal::ZERO,
            max_spread: Decimal::ONE,
            ..SpreadConfig::default()
        };
        config.major_currencies.remove(&Currency::Mwk);
        let engine = SpreadEngine::new(config);

        let spread = engine.effective_spread(
            Currency::Mwk,
            Currency::Cny,
            0.0,
            weekday_business_hour(),
        );
        assert_eq!(spread, dec!(0.0150));
    }

    #[test]
    fn realized_volatility_needs_samples_and_forgets_old_ones() {
        let mut tracker = VolatilityTracker::new();
        let start = weekday_business_hour();

        assert_eq!(tracker.realized(Currency::Mwk, Currency::Cny, start), 0.0);

        tracker.observe(Currency::Mwk, Currency::Cny, dec!(0.0085), start);
        tracker.observe(
            Currency::Mwk,
            Currency::Cny,
            dec!(0.0086),
            start + Duration::minutes(1),
        );
        assert_eq!(
            tracker.realized(Currency::Mwk, Currency::Cny, start + Duration::minutes(1)),
            0.0
        );

        tracker.observe(
            Currency::Mwk,
            Currency::Cny,
            dec!(0.0083),
            start + Duration::minutes(2),
        );
        let sigma = tracker.realized(Currency::Mwk, Currency::Cny, start + Duration::minutes(2));
        assert!(sigma > 0.0);

        // Two hours later the window is empty again.
        tracker.observe(
            Currency::Mwk,
            Currency::Cny,
            dec!(0.0085),
            start + Duration::hours(2),
        );
        assert_eq!(
            tracker.realized(Currency::Mwk, Currency::Cny, start + Duration::hours(2)),
            0.0
        );
    }

    #[test]
    fn non_positive_mids_are_rejected() {
        let engine = SpreadEngine::new(SpreadConfig::neutral(dec!(0.015)));
        let err = engine
            .quote(
                Currency::Mwk,
                Currency::Cny,
                &ProviderRate {
                    mid: Decimal::ZERO,
                    source: "test".into(),
                    captured_at: weekday_business_hour(),
                },
                0.0,
            )
            .expect_err("zero mid");
        assert!(matches!(err, FxError::Validation(_)));
    }
}
