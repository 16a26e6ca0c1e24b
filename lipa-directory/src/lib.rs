#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

pub type UserId = String;

pub type DirectoryResult<T> = Result<T, DirectoryError>;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("user {0} not found")]
    NotFound(UserId),
    #[error("user {0} already exists")]
    Conflict(UserId),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KycStatus {
    Pending,
    Verified,
    Rejected,
}

/// KYC tiers 0 through 3. Tier 0 users can hold wallets but cannot send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KycLevel(pub u8);

impl KycLevel {
    pub const NONE: KycLevel = KycLevel(0);
    pub const BASIC: KycLevel = KycLevel(1);
    pub const STANDARD: KycLevel = KycLevel(2);
    pub const FULL: KycLevel = KycLevel(3);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub country: String,
    pub kyc_level: KycLevel,
    pub kyc_status: KycStatus,
    pub active: bool,
    pub risk_score: u8,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.id.trim().is_empty() {
            return Err(DirectoryError::Validation("user id must be provided".into()));
        }
        if self.country.trim().len() != 2 {
            return Err(DirectoryError::Validation(format!(
                "country must be a 2-letter code, got {:?}",
                self.country
            )));
        }
        if self.kyc_level > KycLevel::FULL {
            return Err(DirectoryError::Validation(format!(
                "kyc level {} out of range",
                self.kyc_level.0
            )));
        }
        Ok(())
    }
}

/// Identity lookups the payments core depends on. Issuance, sessions and
/// document verification live with the gateway; the core only reads.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, user_id: &UserId) -> DirectoryResult<User>;

    async fn is_device_trusted(&self, user_id: &UserId, device_hash: &str) -> DirectoryResult<bool>;
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
    state: RwLock<DirectoryState>,
}

#[derive(Default)]
struct DirectoryState {
    users: HashMap<UserId, User>,
    trusted_devices: HashMap<UserId, HashSet<String>>,
}

impl InMemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user: User) -> DirectoryResult<User> {
        user.validate()?;
        let mut state = self.state.write().await;
        if state.users.contains_key(&user.id) {
            return Err(DirectoryError::Conflict(user.id));
        }
        state.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    pub async fn trust_device(&self, user_id: &UserId, device_hash: &str) -> DirectoryResult<()> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(user_id) {
            return Err(DirectoryError::NotFound(user_id.clone()));
        }
        state
            .trusted_devices
            .entry(user_id.clone())
            .or_default()
            .insert(device_hash.to_string());
        Ok(())
    }

    pub async fn set_kyc(
        &self,
        user_id: &UserId,
        level: KycLevel,
        status: KycStatus,
    ) -> DirectoryResult<User> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| DirectoryError::NotFound(user_id.clone()))?;
        user.kyc_level = level;
        user.kyc_status = status;
        Ok(user.clone())
    }

    pub async fn set_active(&self, user_id: &UserId, active: bool) -> DirectoryResult<User> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| DirectoryError::NotFound(user_id.clone()))?;
        user.active = active;
        Ok(user.clone())
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_id(&self, user_id: &UserId) -> DirectoryResult<User> {
        let state = self.state.read().await;
        state
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(user_id.clone()))
    }

    async fn is_device_trusted(
        &self,
        user_id: &UserId,
        device_hash: &str,
    ) -> DirectoryResult<bool> {
        let state = self.state.read().await;
        if !state.users.contains_key(user_id) {
            return Err(DirectoryError::NotFound(user_id.clone()));
        }
        Ok(state
            .trusted_devices
            .get(user_id)
            .is_some_and(|devices| devices.contains(device_hash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_user(id: &str) -> User {
        User {
            id: id.into(),
            display_name: "Chimwemwe Banda".into(),
            country: "MW".into(),
            kyc_level: KycLevel::STANDARD,
            kyc_status: KycStatus::Verified,
            active: true,
            risk_score: 10,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let directory = InMemoryUserDirectory::new();
        directory
            .register(sample_user("user-1"))
            .await
            .expect("register");

        let found = directory
            .find_by_id(&"user-1".to_string())
            .await
            .expect("lookup");
        assert_eq!(found.country, "MW");

        let err = directory
            .register(sample_user("user-1"))
            .await
            .expect_err("duplicate register");
        assert!(matches!(err, DirectoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn device_trust_defaults_to_untrusted() {
        let directory = InMemoryUserDirectory::new();
        directory
            .register(sample_user("user-1"))
            .await
            .expect("register");

        assert!(
            !directory
                .is_device_trusted(&"user-1".to_string(), "device-a")
                .await
                .expect("query")
        );

        directory
            .trust_device(&"user-1".to_string(), "device-a")
            .await
            .expect("trust");
        assert!(
            directory
                .is_device_trusted(&"user-1".to_string(), "device-a")
                .await
                .expect("query")
        );
    }

    #[tokio::test]
    async fn rejects_bad_country_codes() {
        let directory = InMemoryUserDirectory::new();
        let mut user = sample_user("user-1");
        user.country = "MWI".into();
        let err = directory.register(user).await.expect_err("validation");
        assert!(matches!(err, DirectoryError::Validation(_)));
    }
}
