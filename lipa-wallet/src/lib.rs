#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use lipa_money::Currency;
use lipa_money::Money;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type WalletId = String;
pub type UserId = String;
pub type WalletAddress = String;

pub type WalletResult<T> = Result<T, WalletError>;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet {0} not found")]
    NotFound(String),
    #[error("wallet for user {user_id} in {currency} already exists")]
    AlreadyExists { user_id: UserId, currency: Currency },
    #[error("currency {currency} is not permitted for country {country}")]
    CountryCurrencyMismatch { country: String, currency: Currency },
    #[error("wallet {0} is not active")]
    NotActive(WalletId),
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        available: Decimal,
        requested: Decimal,
    },
    #[error("insufficient reserved funds: reserved {reserved}, requested {requested}")]
    InsufficientReserved {
        reserved: Decimal,
        requested: Decimal,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletStatus {
    Active,
    Suspended,
    Closed,
}

/// A per-(user, currency) balance holder. `ledger` is the book value and
/// always equals `available + reserved`; the store re-asserts that after
/// every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub currency: Currency,
    pub available: Decimal,
    pub reserved: Decimal,
    pub ledger: Decimal,
    pub status: WalletStatus,
    pub address: WalletAddress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    #[must_use]
    pub fn available_money(&self) -> Money {
        Money::new(self.available, self.currency)
    }

    #[must_use]
    pub fn reserved_money(&self) -> Money {
        Money::new(self.reserved, self.currency)
    }

    #[must_use]
    pub fn ledger_money(&self) -> Money {
        Money::new(self.ledger, self.currency)
    }

    fn check_invariant(&self) -> WalletResult<()> {
        if self.available < Decimal::ZERO
            || self.reserved < Decimal::ZERO
            || self.ledger < Decimal::ZERO
        {
            return Err(WalletError::Invariant(format!(
                "wallet {} holds a negative balance",
                self.id
            )));
        }
        if self.ledger != self.available + self.reserved {
            return Err(WalletError::Invariant(format!(
                "wallet {}: ledger {} != available {} + reserved {}",
                self.id, self.ledger, self.available, self.reserved
            )));
        }
        Ok(())
    }
}

/// Which balance a debit is taken from. Reserved debits finish a payment
/// that already earmarked funds; available debits are direct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitSource {
    Available,
    Reserved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateWalletRequest {
    pub user_id: UserId,
    pub country: String,
    pub currency: Currency,
}

/// Country → permitted currencies. An absent country permits every
/// supported currency; an empty set blocks wallet creation outright.
#[derive(Debug, Clone, Default)]
pub struct CountryCurrencyPolicy {
    allowed: HashMap<String, HashSet<Currency>>,
}

impl CountryCurrencyPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn permit(mut self, country: &str, currencies: &[Currency]) -> Self {
        self.allowed
            .entry(country.to_ascii_uppercase())
            .or_default()
            .extend(currencies.iter().copied());
        self
    }

    #[must_use]
    pub fn allows(&self, country: &str, currency: Currency) -> bool {
        match self.allowed.get(&country.to_ascii_uppercase()) {
            Some(currencies) => currencies.contains(&currency),
            None => true,
        }
    }
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn create(&self, request: CreateWalletRequest) -> WalletResult<Wallet>;

    async fn get(&self, wallet_id: &WalletId) -> WalletResult<Wallet>;

    async fn find_by_address(&self, address: &str) -> WalletResult<Wallet>;

    async fn find_for_user(&self, user_id: &UserId, currency: Currency) -> WalletResult<Wallet>;

    async fn list_for_user(&self, user_id: &UserId) -> WalletResult<Vec<Wallet>>;

    /// Moves `amount` from available to reserved. Requires an active wallet
    /// with sufficient available funds.
    async fn reserve(&self, wallet_id: &WalletId, amount: &Money) -> WalletResult<Wallet>;

    /// Inverse of `reserve`.
    async fn release(&self, wallet_id: &WalletId, amount: &Money) -> WalletResult<Wallet>;

    async fn debit(
        &self,
        wallet_id: &WalletId,
        amount: &Money,
        source: DebitSource,
    ) -> WalletResult<Wallet>;

    async fn credit(&self, wallet_id: &WalletId, amount: &Money) -> WalletResult<Wallet>;

    async fn set_status(&self, wallet_id: &WalletId, status: WalletStatus) -> WalletResult<Wallet>;
}

/// In-memory `WalletStore`. A single mutex models the row-level lock of the
/// production store; each mutation is applied to a copy, invariant-checked,
/// and only then written back.
pub struct InMemoryWalletStore {
    state: Mutex<State>,
    policy: CountryCurrencyPolicy,
}

#[derive(Default)]
struct State {
    wallets: HashMap<WalletId, Wallet>,
    by_address: HashMap<WalletAddress, WalletId>,
    by_user: HashMap<(UserId, Currency), WalletId>,
}

impl Default for InMemoryWalletStore {
    fn default() -> Self {
        Self::new(CountryCurrencyPolicy::default())
    }
}

impl InMemoryWalletStore {
    #[must_use]
    pub fn new(policy: CountryCurrencyPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            policy,
        }
    }

    fn generate_address(state: &State) -> WalletAddress {
        let mut rng = rand::rng();
        loop {
            let candidate: u64 = rng.random_range(1_000_000_000_000_000..10_000_000_000_000_000);
            let address = candidate.to_string();
            if !state.by_address.contains_key(&address) {
                return address;
            }
        }
    }

    fn validate_amount(wallet: &Wallet, amount: &Money) -> WalletResult<()> {
        if amount.currency != wallet.currency {
            return Err(WalletError::Validation(format!(
                "amount currency {} does not match wallet currency {}",
                amount.currency, wallet.currency
            )));
        }
        if !amount.is_positive() {
            return Err(WalletError::Validation(format!(
                "amount must be positive, got {}",
                amount.amount
            )));
        }
        Ok(())
    }

    /// Applies `mutate` to a copy of the wallet, re-checks the balance
    /// invariant, and commits only on success.
    async fn mutate<F>(&self, wallet_id: &WalletId, mutate: F) -> WalletResult<Wallet>
    where
        F: FnOnce(&mut Wallet) -> WalletResult<()>,
    {
        let mut state = self.state.lock().await;
        let current = state
            .wallets
            .get(wallet_id)
            .ok_or_else(|| WalletError::NotFound(wallet_id.clone()))?;
        let mut updated = current.clone();
        mutate(&mut updated)?;
        updated.check_invariant()?;
        updated.updated_at = Utc::now();
        state.wallets.insert(wallet_id.clone(), updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl WalletStore for InMemoryWalletStore {
    async fn create(&self, request: CreateWalletRequest) -> WalletResult<Wallet> {
        if request.user_id.trim().is_empty() {
            return Err(WalletError::Validation("user id must be provided".into()));
        }
        if !self.policy.allows(&request.country, request.currency) {
            return Err(WalletError::CountryCurrencyMismatch {
                country: request.country,
                currency: request.currency,
            });
        }

        let mut state = self.state.lock().await;
        let user_key = (request.user_id.clone(), request.currency);
        if state.by_user.contains_key(&user_key) {
            return Err(WalletError::AlreadyExists {
                user_id: request.user_id,
                currency: request.currency,
            });
        }

        let now = Utc::now();
        let address = Self::generate_address(&state);
        let wallet = Wallet {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            currency: request.currency,
            available: Decimal::ZERO,
            reserved: Decimal::ZERO,
            ledger: Decimal::ZERO,
            status: WalletStatus::Active,
            address: address.clone(),
            created_at: now,
            updated_at: now,
        };

        state.by_address.insert(address, wallet.id.clone());
        state.by_user.insert(user_key, wallet.id.clone());
        state.wallets.insert(wallet.id.clone(), wallet.clone());
        Ok(wallet)
    }

    async fn get(&self, wallet_id: &WalletId) -> WalletResult<Wallet> {
        let state = self.state.lock().await;
        state
            .wallets
            .get(wallet_id)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(wallet_id.clone()))
    }

    async fn find_by_address(&self, address: &str) -> WalletResult<Wallet> {
        let state = self.state.lock().await;
        state
            .by_address
            .get(address)
            .and_then(|wallet_id| state.wallets.get(wallet_id))
            .cloned()
            .ok_or_else(|| WalletError::NotFound(format!("address {address}")))
    }

    async fn find_for_user(&self, user_id: &UserId, currency: Currency) -> WalletResult<Wallet> {
        let state = self.state.lock().await;
        state
            .by_user
            .get(&(user_id.clone(), currency))
            .and_then(|wallet_id| state.wallets.get(wallet_id))
            .cloned()
            .ok_or_else(|| WalletError::NotFound(format!("user {user_id} in {currency}")))
    }

    async fn list_for_user(&self, user_id: &UserId) -> WalletResult<Vec<Wallet>> {
        let state = self.state.lock().await;
        let mut wallets: Vec<Wallet> = state
            .wallets
            .values()
            .filter(|wallet| &wallet.user_id == user_id)
            .cloned()
            .collect();
        wallets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(wallets)
    }

    async fn reserve(&self, wallet_id: &WalletId, amount: &Money) -> WalletResult<Wallet> {
        self.mutate(wallet_id, |wallet| {
            Self::validate_amount(wallet, amount)?;
            if wallet.status != WalletStatus::Active {
                return Err(WalletError::NotActive(wallet.id.clone()));
            }
            if wallet.available < amount.amount {
                return Err(WalletError::InsufficientFunds {
                    available: wallet.available,
                    requested: amount.amount,
                });
            }
            wallet.available -= amount.amount;
            wallet.reserved += amount.amount;
            Ok(())
        })
        .await
    }

    async fn release(&self, wallet_id: &WalletId, amount: &Money) -> WalletResult<Wallet> {
        self.mutate(wallet_id, |wallet| {
            Self::validate_amount(wallet, amount)?;
            if wallet.reserved < amount.amount {
                return Err(WalletError::InsufficientReserved {
                    reserved: wallet.reserved,
                    requested: amount.amount,
                });
            }
            wallet.reserved -= amount.amount;
            wallet.available += amount.amount;
            Ok(())
        })
        .await
    }

    async fn debit(
        &self,
        wallet_id: &WalletId,
        amount: &Money,
        source: DebitSource,
    ) -> WalletResult<Wallet> {
        self.mutate(wallet_id, |wallet| {
            Self::validate_amount(wallet, amount)?;
            if wallet.status != WalletStatus::Active {
                return Err(WalletError::NotActive(wallet.id.clone()));
            }
            match source {
                DebitSource::Reserved => {
                    if wallet.reserved < amount.amount {
                        return Err(WalletError::InsufficientReserved {
                            reserved: wallet.reserved,
                            requested: amount.amount,
                        });
                    }
                    wallet.reserved -= amount.amount;
                }
                DebitSource::Available => {
                    if wallet.available < amount.amount {
                        return Err(WalletError::InsufficientFunds {
                            available: wallet.available,
                            requested: amount.amount,
                        });
                    }
                    wallet.available -= amount.amount;
                }
            }
            wallet.ledger -= amount.amount;
            Ok(())
        })
        .await
    }

    async fn credit(&self, wallet_id: &WalletId, amount: &Money) -> WalletResult<Wallet> {
        self.mutate(wallet_id, |wallet| {
            Self::validate_amount(wallet, amount)?;
            if wallet.status == WalletStatus::Closed {
                return Err(WalletError::NotActive(wallet.id.clone()));
            }
            wallet.available += amount.amount;
            wallet.ledger += amount.amount;
            Ok(())
        })
        .await
    }

    async fn set_status(&self, wallet_id: &WalletId, status: WalletStatus) -> WalletResult<Wallet> {
        self.mutate(wallet_id, |wallet| {
            wallet.status = status;
            Ok(())
        })
        .await
    }
}
