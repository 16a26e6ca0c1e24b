#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub type MoneyResult<T> = Result<T, MoneyError>;

/// Monetary amounts carry at most this many fractional digits. Exchange
/// rates are quoted at the same scale, so products stay exact before the
/// final rounding step.
pub const MAX_FRACTIONAL_DIGITS: u32 = 8;

/// Monetary amounts carry at most this many integer digits.
pub const MAX_INTEGER_DIGITS: u32 = 18;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },
    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("arithmetic overflow")]
    Overflow,
}

/// Supported currency tags. The minor-unit scale drives every rounding
/// decision downstream, so it lives here rather than in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Currency {
    Mwk,
    Cny,
    Usd,
    Eur,
}

impl Currency {
    pub const ALL: [Currency; 4] = [Currency::Mwk, Currency::Cny, Currency::Usd, Currency::Eur];

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Mwk => "MWK",
            Currency::Cny => "CNY",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }

    /// Number of fractional digits a stored balance in this currency may
    /// carry. All supported currencies settle at two decimal places.
    #[must_use]
    pub fn minor_units(&self) -> u32 {
        match self {
            Currency::Mwk | Currency::Cny | Currency::Usd | Currency::Eur => 2,
        }
    }

    /// Smallest representable increment, e.g. `0.01` for two minor units.
    #[must_use]
    pub fn minor_unit_step(&self) -> Decimal {
        Decimal::new(1, self.minor_units())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "MWK" => Ok(Currency::Mwk),
            "CNY" => Ok(Currency::Cny),
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            other => Err(MoneyError::UnsupportedCurrency(other.to_string())),
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.code().to_string()
    }
}

/// An exact-decimal amount tagged with its currency. Arithmetic across
/// currencies is always an error, never a coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    #[must_use]
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    #[must_use]
    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    /// Parses a string decimal (the HTTP wire form) into this currency,
    /// rejecting magnitudes outside the supported 18.8 envelope.
    pub fn parse(value: &str, currency: Currency) -> MoneyResult<Self> {
        let amount = Decimal::from_str_exact(value.trim())
            .map_err(|err| MoneyError::InvalidAmount(format!("{value}: {err}")))?;
        if amount.scale() > MAX_FRACTIONAL_DIGITS {
            return Err(MoneyError::InvalidAmount(format!(
                "{value}: more than {MAX_FRACTIONAL_DIGITS} fractional digits"
            )));
        }
        let integer_digits = amount
            .abs()
            .trunc()
            .to_string()
            .trim_start_matches('0')
            .len() as u32;
        if integer_digits > MAX_INTEGER_DIGITS {
            return Err(MoneyError::InvalidAmount(format!(
                "{value}: more than {MAX_INTEGER_DIGITS} integer digits"
            )));
        }
        Ok(Self { amount, currency })
    }

    fn ensure_same_currency(&self, other: &Money) -> MoneyResult<()> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            })
        }
    }

    pub fn checked_add(&self, other: &Money) -> MoneyResult<Money> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(amount, self.currency))
    }

    pub fn checked_sub(&self, other: &Money) -> MoneyResult<Money> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(amount, self.currency))
    }

    /// Converts into `target` at `rate`, rounding half-even to the target's
    /// minor units. This is the only rounding mode permitted for
    /// conversions.
    pub fn convert(&self, rate: Decimal, target: Currency) -> MoneyResult<Money> {
        let product = self
            .amount
            .checked_mul(rate)
            .ok_or(MoneyError::Overflow)?;
        let rounded =
            product.round_dp_with_strategy(target.minor_units(), RoundingStrategy::MidpointNearestEven);
        Ok(Money::new(rounded, target))
    }

    /// Rounds up to this currency's minor unit. Fee amounts always round in
    /// the house's favour.
    #[must_use]
    pub fn round_up_minor(&self) -> Money {
        let rounded = self
            .amount
            .round_dp_with_strategy(self.currency.minor_units(), RoundingStrategy::ToPositiveInfinity);
        Money::new(rounded, self.currency)
    }

    /// Rounds half-even to this currency's minor unit.
    #[must_use]
    pub fn round_minor(&self) -> Money {
        let rounded = self
            .amount
            .round_dp_with_strategy(self.currency.minor_units(), RoundingStrategy::MidpointNearestEven);
        Money::new(rounded, self.currency)
    }

    pub fn checked_cmp(&self, other: &Money) -> MoneyResult<Ordering> {
        self.ensure_same_currency(other)?;
        Ok(self.amount.cmp(&other.amount))
    }

    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    #[must_use]
    pub fn abs(&self) -> Money {
        Money::new(self.amount.abs(), self.currency)
    }

    #[must_use]
    pub fn negate(&self) -> Money {
        Money::new(-self.amount, self.currency)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn mwk(value: Decimal) -> Money {
        Money::new(value, Currency::Mwk)
    }

    #[test]
    fn currency_round_trips_through_strings() {
        for currency in Currency::ALL {
            let parsed: Currency = currency.code().parse().expect("code parses");
            assert_eq!(parsed, currency);
        }
        assert_eq!("mwk".parse::<Currency>().expect("lowercase"), Currency::Mwk);
        assert!(matches!(
            "XXX".parse::<Currency>(),
            Err(MoneyError::UnsupportedCurrency(_))
        ));
    }

    #[test]
    fn add_and_sub_require_matching_currency() {
        let a = mwk(dec!(10.00));
        let b = Money::new(dec!(1.00), Currency::Usd);
        assert_eq!(
            a.checked_add(&b),
            Err(MoneyError::CurrencyMismatch {
                left: Currency::Mwk,
                right: Currency::Usd,
            })
        );
        let c = a.checked_add(&mwk(dec!(2.50))).expect("same currency");
        assert_eq!(c.amount, dec!(12.50));
    }

    #[test]
    fn convert_rounds_half_even_to_minor_units() {
        let amount = mwk(dec!(50000));
        let converted = amount
            .convert(dec!(0.00843625), Currency::Cny)
            .expect("convert");
        assert_eq!(converted, Money::new(dec!(421.81), Currency::Cny));

        // Exact midpoints round to the even neighbour.
        let tie = mwk(dec!(1));
        assert_eq!(
            tie.convert(dec!(2.345), Currency::Usd).expect("convert").amount,
            dec!(2.34)
        );
        assert_eq!(
            tie.convert(dec!(2.355), Currency::Usd).expect("convert").amount,
            dec!(2.36)
        );
    }

    #[test]
    fn fees_round_up_to_the_minor_unit() {
        assert_eq!(mwk(dec!(0.001)).round_up_minor().amount, dec!(0.01));
        assert_eq!(mwk(dec!(15.0000001)).round_up_minor().amount, dec!(15.01));
        assert_eq!(mwk(dec!(15.00)).round_up_minor().amount, dec!(15.00));
    }

    #[test]
    fn parse_enforces_scale_limits() {
        assert!(Money::parse("1000.00", Currency::Mwk).is_ok());
        assert!(Money::parse("0.00000001", Currency::Mwk).is_ok());
        assert!(matches!(
            Money::parse("0.000000001", Currency::Mwk),
            Err(MoneyError::InvalidAmount(_))
        ));
        assert!(matches!(
            Money::parse("1234567890123456789.00", Currency::Mwk),
            Err(MoneyError::InvalidAmount(_))
        ));
        assert!(matches!(
            Money::parse("not-a-number", Currency::Mwk),
            Err(MoneyError::InvalidAmount(_))
        ));
    }

    #[test]
    fn comparisons_stay_within_one_currency() {
        let a = mwk(dec!(5));
        let b = mwk(dec!(7));
        assert_eq!(a.checked_cmp(&b).expect("same currency"), Ordering::Less);
        let usd = Money::new(dec!(7), Currency::Usd);
        assert!(a.checked_cmp(&usd).is_err());
    }
}
