#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use lipa_money::Currency;
use lipa_money::Money;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod memory;

pub use memory::InMemoryLedgerStore;

pub type TransactionId = String;
pub type WalletId = String;
pub type EntryId = String;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid entry: {0}")]
    InvalidEntry(String),
    #[error("entry for transaction {transaction_id} with purpose {purpose} already posted")]
    DuplicateEntry {
        transaction_id: TransactionId,
        purpose: EntryPurpose,
    },
    #[error("account {0} is not open")]
    UnknownAccount(AccountRef),
    #[error("account {0} is already open")]
    AccountExists(AccountRef),
    #[error("posting currency {got} does not match account {account} currency {expected}")]
    CurrencyMismatch {
        account: AccountRef,
        expected: Currency,
        got: Currency,
    },
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Every ledger account the system posts to. Wallet accounts mirror a
/// wallet's ledger balance; the rest are house accounts, one per currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind", content = "key")]
pub enum AccountRef {
    Wallet(WalletId),
    FeeIncome(Currency),
    FxSpread(Currency),
    SuspenseInflight(Currency),
    SettlementNostro(Currency),
}

impl AccountRef {
    /// House accounts carry their currency in the tag; wallet accounts take
    /// theirs from the wallet at open time.
    #[must_use]
    pub fn fixed_currency(&self) -> Option<Currency> {
        match self {
            AccountRef::Wallet(_) => None,
            AccountRef::FeeIncome(currency)
            | AccountRef::FxSpread(currency)
            | AccountRef::SuspenseInflight(currency)
            | AccountRef::SettlementNostro(currency) => Some(*currency),
        }
    }

    /// Wallet balances mirror customer funds and may never go negative.
    /// House accounts swing both ways while value is in flight.
    #[must_use]
    pub fn must_stay_non_negative(&self) -> bool {
        matches!(self, AccountRef::Wallet(_))
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountRef::Wallet(wallet_id) => write!(f, "WALLET:{wallet_id}"),
            AccountRef::FeeIncome(currency) => write!(f, "FEE_INCOME:{currency}"),
            AccountRef::FxSpread(currency) => write!(f, "FX_SPREAD:{currency}"),
            AccountRef::SuspenseInflight(currency) => write!(f, "SUSPENSE_INFLIGHT:{currency}"),
            AccountRef::SettlementNostro(currency) => write!(f, "SETTLEMENT_NOSTRO:{currency}"),
        }
    }
}

/// Why an entry was posted. At most one committed entry may exist per
/// `(transaction, purpose)` pair, which is what makes posting idempotent
/// under engine retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryPurpose {
    Payment,
    EscrowRelease,
    SettlementCompletion,
    Reversal,
    DisputeReversal,
    Refund,
}

impl fmt::Display for EntryPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntryPurpose::Payment => "PAYMENT",
            EntryPurpose::EscrowRelease => "ESCROW_RELEASE",
            EntryPurpose::SettlementCompletion => "SETTLEMENT_COMPLETION",
            EntryPurpose::Reversal => "REVERSAL",
            EntryPurpose::DisputeReversal => "DISPUTE_REVERSAL",
            EntryPurpose::Refund => "REFUND",
        };
        f.write_str(label)
    }
}

/// A posting as submitted by a caller. Positive amounts credit the account,
/// negative amounts debit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPosting {
    pub account: AccountRef,
    pub amount: Money,
}

impl NewPosting {
    #[must_use]
    pub fn credit(account: AccountRef, amount: Money) -> Self {
        Self { account, amount }
    }

    #[must_use]
    pub fn debit(account: AccountRef, amount: Money) -> Self {
        Self {
            account,
            amount: amount.negate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJournalEntry {
    pub transaction_id: TransactionId,
    pub purpose: EntryPurpose,
    pub memo: Option<String>,
    pub postings: Vec<NewPosting>,
}

impl NewJournalEntry {
    /// A valid entry is non-empty, has no zero postings, and sums to exactly
    /// zero within every currency it touches.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.postings.is_empty() {
            return Err(LedgerError::InvalidEntry(
                "journal entry must contain at least one posting".into(),
            ));
        }
        if self.transaction_id.trim().is_empty() {
            return Err(LedgerError::InvalidEntry(
                "journal entry must reference a transaction".into(),
            ));
        }

        let mut sums: HashMap<Currency, Decimal> = HashMap::new();
        for posting in &self.postings {
            if posting.amount.is_zero() {
                return Err(LedgerError::InvalidEntry(format!(
                    "zero-amount posting on {}",
                    posting.account
                )));
            }
            *sums.entry(posting.amount.currency).or_default() += posting.amount.amount;
        }
        for (currency, sum) in sums {
            if !sum.is_zero() {
                return Err(LedgerError::InvalidEntry(format!(
                    "postings for {currency} sum to {sum}, expected zero"
                )));
            }
        }
        Ok(())
    }
}

/// A committed posting line. `sequence` is strictly increasing per account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub account: AccountRef,
    pub amount: Money,
    pub sequence: u64,
}

/// A committed, immutable journal entry. Corrections are new reversing
/// entries; nothing here is ever updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntryId,
    pub transaction_id: TransactionId,
    pub purpose: EntryPurpose,
    pub memo: Option<String>,
    pub postings: Vec<Posting>,
    pub committed_at: DateTime<Utc>,
}

impl JournalEntry {
    /// Builds the mirror-image entry: same accounts, opposite signs.
    #[must_use]
    pub fn reversing_postings(&self) -> Vec<NewPosting> {
        self.postings
            .iter()
            .map(|posting| NewPosting {
                account: posting.account.clone(),
                amount: posting.amount.negate(),
            })
            .collect()
    }
}

/// The append-only journal. Implementations must make `post` atomic and
/// durable before returning, and serialize postings per account.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Opens an account so it can be posted to. House accounts may also be
    /// opened implicitly on first use because their ref fixes the currency.
    async fn open_account(&self, account: AccountRef, currency: Currency) -> LedgerResult<()>;

    async fn post(&self, entry: NewJournalEntry) -> LedgerResult<JournalEntry>;

    async fn balance(&self, account: &AccountRef) -> LedgerResult<Money>;

    /// Balance from postings committed at or before `at`.
    async fn balance_as_of(&self, account: &AccountRef, at: DateTime<Utc>) -> LedgerResult<Money>;

    async fn entries_for_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> LedgerResult<Vec<JournalEntry>>;

    async fn entry(&self, entry_id: &EntryId) -> LedgerResult<JournalEntry>;

    /// Signed sum over every account in `currency`. Always zero on a
    /// consistent ledger.
    async fn trial_balance(&self, currency: Currency) -> LedgerResult<Decimal>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use lipa_money::Currency;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn mwk(value: Decimal) -> Money {
        Money::new(value, Currency::Mwk)
    }

    fn balanced_entry() -> NewJournalEntry {
        NewJournalEntry {
            transaction_id: "txn-1".into(),
            purpose: EntryPurpose::Payment,
            memo: None,
            postings: vec![
                NewPosting::debit(AccountRef::Wallet("w-1".into()), mwk(dec!(1015.00))),
                NewPosting::credit(AccountRef::FeeIncome(Currency::Mwk), mwk(dec!(15.00))),
                NewPosting::credit(AccountRef::Wallet("w-2".into()), mwk(dec!(1000.00))),
            ],
        }
    }

    #[test]
    fn balanced_entry_validates() {
        assert!(balanced_entry().validate().is_ok());
    }

    #[test]
    fn unbalanced_entry_is_rejected() {
        let mut entry = balanced_entry();
        entry.postings[2].amount = mwk(dec!(999.99));
        assert!(matches!(
            entry.validate(),
            Err(LedgerError::InvalidEntry(_))
        ));
    }

    #[test]
    fn zero_postings_are_rejected() {
        let mut entry = balanced_entry();
        entry.postings.push(NewPosting::credit(
            AccountRef::FxSpread(Currency::Mwk),
            mwk(dec!(0)),
        ));
        assert!(matches!(
            entry.validate(),
            Err(LedgerError::InvalidEntry(_))
        ));
    }

    #[test]
    fn balance_is_per_currency_not_global() {
        // A cross-currency entry balances within each currency leg even
        // though the raw decimal sums differ.
        let entry = NewJournalEntry {
            transaction_id: "txn-2".into(),
            purpose: EntryPurpose::Payment,
            memo: None,
            postings: vec![
                NewPosting::debit(AccountRef::Wallet("w-1".into()), mwk(dec!(50750.00))),
                NewPosting::credit(AccountRef::FeeIncome(Currency::Mwk), mwk(dec!(750.00))),
                NewPosting::credit(
                    AccountRef::SuspenseInflight(Currency::Mwk),
                    mwk(dec!(50000.00)),
                ),
                NewPosting::debit(
                    AccountRef::SuspenseInflight(Currency::Cny),
                    Money::new(dec!(421.81), Currency::Cny),
                ),
                NewPosting::credit(
                    AccountRef::Wallet("w-2".into()),
                    Money::new(dec!(421.81), Currency::Cny),
                ),
            ],
        };
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn reversing_postings_mirror_signs() {
        let posted = JournalEntry {
            id: "je-1".into(),
            transaction_id: "txn-1".into(),
            purpose: EntryPurpose::Payment,
            memo: None,
            postings: vec![
                Posting {
                    account: AccountRef::Wallet("w-1".into()),
                    amount: mwk(dec!(-1015.00)),
                    sequence: 1,
                },
                Posting {
                    account: AccountRef::FeeIncome(Currency::Mwk),
                    amount: mwk(dec!(15.00)),
                    sequence: 1,
                },
                Posting {
                    account: AccountRef::Wallet("w-2".into()),
                    amount: mwk(dec!(1000.00)),
                    sequence: 1,
                },
            ],
            committed_at: Utc::now(),
        };
        let reversed = posted.reversing_postings();
        assert_eq!(reversed[0].amount, mwk(dec!(1015.00)));
        assert_eq!(reversed[1].amount, mwk(dec!(-15.00)));
        assert_eq!(reversed[2].amount, mwk(dec!(-1000.00)));
    }
}
