use std::collections::HashMap;
use std::collections::HashSet;

use chrono::DateTime;
use chrono::Utc;
use lipa_money::Currency;
use lipa_money::Money;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::AccountRef;
use crate::EntryId;
use crate::EntryPurpose;
use crate::JournalEntry;
use crate::LedgerError;
use crate::LedgerResult;
use crate::LedgerStore;
use crate::NewJournalEntry;
use crate::Posting;
use crate::TransactionId;

/// In-memory `LedgerStore`. A single mutex stands in for the serialized
/// database transaction of the production store: every `post` observes and
/// mutates balances atomically, and per-account sequences are handed out
/// under the same lock.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<AccountRef, AccountState>,
    entries: Vec<JournalEntry>,
    by_transaction: HashMap<TransactionId, Vec<usize>>,
    posted_keys: HashSet<(TransactionId, EntryPurpose)>,
}

struct AccountState {
    currency: Currency,
    balance: Decimal,
    next_sequence: u64,
}

impl AccountState {
    fn new(currency: Currency) -> Self {
        Self {
            currency,
            balance: Decimal::ZERO,
            next_sequence: 1,
        }
    }
}

impl InMemoryLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the account for a posting, implicitly opening house
    /// accounts whose ref fixes the currency.
    fn resolve_account<'a>(
        accounts: &'a mut HashMap<AccountRef, AccountState>,
        account: &AccountRef,
    ) -> LedgerResult<&'a mut AccountState> {
        if !accounts.contains_key(account) {
            match account.fixed_currency() {
                Some(currency) => {
                    accounts.insert(account.clone(), AccountState::new(currency));
                }
                None => return Err(LedgerError::UnknownAccount(account.clone())),
            }
        }
        accounts
            .get_mut(account)
            .ok_or_else(|| LedgerError::Storage(format!("account {account} vanished")))
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn open_account(&self, account: AccountRef, currency: Currency) -> LedgerResult<()> {
        if let Some(fixed) = account.fixed_currency()
            && fixed != currency
        {
            return Err(LedgerError::CurrencyMismatch {
                account,
                expected: fixed,
                got: currency,
            });
        }
        let mut state = self.state.lock().await;
        if state.accounts.contains_key(&account) {
            return Err(LedgerError::AccountExists(account));
        }
        state.accounts.insert(account, AccountState::new(currency));
        Ok(())
    }

    async fn post(&self, entry: NewJournalEntry) -> LedgerResult<JournalEntry> {
        entry.validate()?;

        let mut state = self.state.lock().await;
        let key = (entry.transaction_id.clone(), entry.purpose);
        if state.posted_keys.contains(&key) {
            return Err(LedgerError::DuplicateEntry {
                transaction_id: entry.transaction_id,
                purpose: entry.purpose,
            });
        }

        // First pass: every posting must target an open (or openable)
        // account in the posting's currency, and wallet accounts must not
        // be driven negative, even transiently within the entry. Nothing is
        // written until all checks pass.
        let mut projected: HashMap<AccountRef, Decimal> = HashMap::new();
        for posting in &entry.postings {
            let account = Self::resolve_account(&mut state.accounts, &posting.account)?;
            if account.currency != posting.amount.currency {
                return Err(LedgerError::CurrencyMismatch {
                    account: posting.account.clone(),
                    expected: account.currency,
                    got: posting.amount.currency,
                });
            }
            let balance = projected
                .entry(posting.account.clone())
                .or_insert(account.balance);
            *balance += posting.amount.amount;
            if posting.account.must_stay_non_negative() && *balance < Decimal::ZERO {
                return Err(LedgerError::Invariant(format!(
                    "posting would drive {} negative",
                    posting.account
                )));
            }
        }

        let committed_at = Utc::now();
        let mut committed = Vec::with_capacity(entry.postings.len());
        for posting in entry.postings {
            let account = Self::resolve_account(&mut state.accounts, &posting.account)?;
            account.balance += posting.amount.amount;
            let sequence = account.next_sequence;
            account.next_sequence += 1;
            committed.push(Posting {
                account: posting.account,
                amount: posting.amount,
                sequence,
            });
        }

        let journal_entry = JournalEntry {
            id: Uuid::new_v4().to_string(),
            transaction_id: entry.transaction_id,
            purpose: entry.purpose,
            memo: entry.memo,
            postings: committed,
            committed_at,
        };

        let index = state.entries.len();
        state
            .by_transaction
            .entry(journal_entry.transaction_id.clone())
            .or_default()
            .push(index);
        state.posted_keys.insert(key);
        state.entries.push(journal_entry.clone());
        Ok(journal_entry)
    }

    async fn balance(&self, account: &AccountRef) -> LedgerResult<Money> {
        let state = self.state.lock().await;
        let account_state = state
            .accounts
            .get(account)
            .ok_or_else(|| LedgerError::UnknownAccount(account.clone()))?;
        Ok(Money::new(account_state.balance, account_state.currency))
    }

    async fn balance_as_of(&self, account: &AccountRef, at: DateTime<Utc>) -> LedgerResult<Money> {
        let state = self.state.lock().await;
        let account_state = state
            .accounts
            .get(account)
            .ok_or_else(|| LedgerError::UnknownAccount(account.clone()))?;
        let mut sum = Decimal::ZERO;
        for entry in &state.entries {
            if entry.committed_at > at {
                continue;
            }
            for posting in &entry.postings {
                if &posting.account == account {
                    sum += posting.amount.amount;
                }
            }
        }
        Ok(Money::new(sum, account_state.currency))
    }

    async fn entries_for_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> LedgerResult<Vec<JournalEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .by_transaction
            .get(transaction_id)
            .map(|indexes| {
                indexes
                    .iter()
                    .filter_map(|index| state.entries.get(*index).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn entry(&self, entry_id: &EntryId) -> LedgerResult<JournalEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .find(|entry| &entry.id == entry_id)
            .cloned()
            .ok_or_else(|| LedgerError::Storage(format!("entry {entry_id} not found")))
    }

    async fn trial_balance(&self, currency: Currency) -> LedgerResult<Decimal> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .filter(|account| account.currency == currency)
            .map(|account| account.balance)
            .sum())
    }
}
