use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::RiskResult;
use crate::UserId;

/// Rolling per-user activity counters the limit checks read. The engine
/// writes debits when a payment reserves funds, forgets them when it
/// compensates, and records successes on completion.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Sum of debits (pending and completed) in the trailing 24 hours.
    async fn daily_debit_total(&self, user_id: &UserId, now: DateTime<Utc>)
    -> RiskResult<Decimal>;

    /// Count of successful payments in the trailing 60 minutes.
    async fn successes_in_hour(&self, user_id: &UserId, now: DateTime<Utc>) -> RiskResult<u32>;

    async fn cooloff_until(&self, user_id: &UserId) -> RiskResult<Option<DateTime<Utc>>>;

    async fn record_debit(
        &self,
        user_id: &UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> RiskResult<()>;

    /// Removes a previously recorded debit after compensation.
    async fn forget_debit(
        &self,
        user_id: &UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> RiskResult<()>;

    async fn record_success(&self, user_id: &UserId, at: DateTime<Utc>) -> RiskResult<()>;

    async fn set_cooloff(&self, user_id: &UserId, until: DateTime<Utc>) -> RiskResult<()>;
}

#[derive(Default)]
struct UserActivity {
    debits: Vec<(DateTime<Utc>, Decimal)>,
    successes: Vec<DateTime<Utc>>,
    cooloff_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryActivityStore {
    state: RwLock<HashMap<UserId, UserActivity>>,
}

impl InMemoryActivityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn daily_debit_total(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> RiskResult<Decimal> {
        let state = self.state.read().await;
        let cutoff = now - Duration::hours(24);
        Ok(state
            .get(user_id)
            .map(|activity| {
                activity
                    .debits
                    .iter()
                    .filter(|(at, _)| *at > cutoff)
                    .map(|(_, amount)| *amount)
                    .sum()
            })
            .unwrap_or(Decimal::ZERO))
    }

    async fn successes_in_hour(&self, user_id: &UserId, now: DateTime<Utc>) -> RiskResult<u32> {
        let state = self.state.read().await;
        let cutoff = now - Duration::minutes(60);
        Ok(state
            .get(user_id)
            .map(|activity| activity.successes.iter().filter(|at| **at > cutoff).count() as u32)
            .unwrap_or(0))
    }

    async fn cooloff_until(&self, user_id: &UserId) -> RiskResult<Option<DateTime<Utc>>> {
        let state = self.state.read().await;
        Ok(state.get(user_id).and_then(|activity| activity.cooloff_until))
    }

    async fn record_debit(
        &self,
        user_id: &UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> RiskResult<()> {
        let mut state = self.state.write().await;
        let activity = state.entry(user_id.clone()).or_default();
        activity.debits.push((at, amount));
        let cutoff = at - Duration::hours(24);
        activity.debits.retain(|(stamp, _)| *stamp > cutoff);
        Ok(())
    }

    async fn forget_debit(
        &self,
        user_id: &UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> RiskResult<()> {
        let mut state = self.state.write().await;
        if let Some(activity) = state.get_mut(user_id)
            && let Some(index) = activity
                .debits
                .iter()
                .position(|(stamp, value)| *stamp == at && *value == amount)
        {
            activity.debits.remove(index);
        }
        Ok(())
    }

    async fn record_success(&self, user_id: &UserId, at: DateTime<Utc>) -> RiskResult<()> {
        let mut state = self.state.write().await;
        let activity = state.entry(user_id.clone()).or_default();
        activity.successes.push(at);
        let cutoff = at - Duration::minutes(60);
        activity.successes.retain(|stamp| *stamp > cutoff);
        Ok(())
    }

    async fn set_cooloff(&self, user_id: &UserId, until: DateTime<Utc>) -> RiskResult<()> {
        let mut state = self.state.write().await;
        state.entry(user_id.clone()).or_default().cooloff_until = Some(until);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn daily_total_forgets_old_debits() {
        let store = InMemoryActivityStore::new();
        let user = "user-1".to_string();
        let now = Utc::now();

        store
            .record_debit(&user, dec!(100), now - Duration::hours(25))
            .await
            .expect("record");
        store
            .record_debit(&user, dec!(40), now - Duration::hours(2))
            .await
            .expect("record");
        store
            .record_debit(&user, dec!(60), now)
            .await
            .expect("record");

        assert_eq!(
            store.daily_debit_total(&user, now).await.expect("total"),
            dec!(100)
        );
    }

    #[tokio::test]
    async fn forget_debit_removes_the_matching_entry() {
        let store = InMemoryActivityStore::new();
        let user = "user-1".to_string();
        let now = Utc::now();
        store
            .record_debit(&user, dec!(40), now)
            .await
            .expect("record");
        store
            .forget_debit(&user, dec!(40), now)
            .await
            .expect("forget");
        assert_eq!(
            store.daily_debit_total(&user, now).await.expect("total"),
            dec!(0)
        );
    }

    #[tokio::test]
    async fn hourly_successes_roll_off() {
        let store = InMemoryActivityStore::new();
        let user = "user-1".to_string();
        let now = Utc::now();
        store
            .record_success(&user, now - Duration::minutes(61))
            .await
            .expect("record");
        store
            .record_success(&user, now - Duration::minutes(5))
            .await
            .expect("record");
        assert_eq!(
            store.successes_in_hour(&user, now).await.expect("count"),
            1
        );
    }
}
