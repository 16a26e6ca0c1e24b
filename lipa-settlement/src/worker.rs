use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration as StdDuration;

use chrono::Duration;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::NetworkStatus;
use crate::Settlement;
use crate::SettlementError;
use crate::SettlementNetwork;
use crate::SettlementOutcomeHandler;
use crate::SettlementResult;
use crate::SettlementStatus;
use crate::SettlementStore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_every: StdDuration,
    pub batch_size: usize,
    /// Total submission attempts before a settlement is declared FAILED and
    /// compensation runs.
    pub max_attempts: u32,
    /// Backoff is `backoff_unit · 2^attempts`, capped.
    pub backoff_unit: Duration,
    pub backoff_cap: Duration,
    pub lease: Duration,
    pub submit_timeout: StdDuration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_every: StdDuration::from_secs(10),
            batch_size: 10,
            max_attempts: 10,
            backoff_unit: Duration::seconds(5),
            backoff_cap: Duration::minutes(10),
            lease: Duration::seconds(60),
            submit_timeout: StdDuration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(16);
        let factor = 2_i64.saturating_pow(exponent);
        let backoff = self
            .backoff_unit
            .checked_mul(factor as i32)
            .unwrap_or(self.backoff_cap);
        backoff.min(self.backoff_cap)
    }
}

/// Drains pending settlements against the external network. Runs on a poll
/// interval plus an explicit `kick()` for freshly enqueued work. Each
/// settlement is driven one step per claim: submit, poll for confirmation,
/// or finalize through the outcome handler.
pub struct SettlementWorker {
    store: Arc<dyn SettlementStore>,
    network: Arc<dyn SettlementNetwork>,
    handler: Arc<dyn SettlementOutcomeHandler>,
    config: WorkerConfig,
    kick: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
}

impl SettlementWorker {
    #[must_use]
    pub fn new(
        store: Arc<dyn SettlementStore>,
        network: Arc<dyn SettlementNetwork>,
        handler: Arc<dyn SettlementOutcomeHandler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            network,
            handler,
            config,
            kick: Arc::new(Notify::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wakes the worker immediately; the engine calls this after enqueueing
    /// a settlement so cross-border legs do not wait a full poll cycle.
    #[must_use]
    pub fn kick_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.kick)
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.poll_every);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("settlement worker stopping");
                return;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.kick.notified() => {}
            }
            self.drain_once().await;
        }
    }

    /// One pass over the due queue. Public so tests and the engine can
    /// drive the worker synchronously.
    pub async fn drain_once(&self) {
        let now = Utc::now();
        let due = match self
            .store
            .claim_due(self.config.batch_size, now, self.config.lease)
            .await
        {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "failed to claim settlements");
                return;
            }
        };
        for settlement in due {
            if let Err(err) = self.drive(&settlement).await {
                error!(
                    settlement_id = settlement.id,
                    error = %err,
                    "settlement step failed"
                );
            }
        }
    }

    async fn drive(&self, settlement: &Settlement) -> SettlementResult<()> {
        match settlement.status {
            SettlementStatus::Pending => self.submit(settlement).await,
            SettlementStatus::Submitted => self.poll_confirmation(settlement).await,
            SettlementStatus::Confirmed => self.finalize(settlement).await,
            SettlementStatus::Completed | SettlementStatus::Failed => Ok(()),
        }
    }

    async fn submit(&self, settlement: &Settlement) -> SettlementResult<()> {
        let submitted =
            tokio::time::timeout(self.config.submit_timeout, self.network.submit(settlement))
                .await;
        match submitted {
            Ok(Ok(external_hash)) => {
                info!(
                    settlement_id = settlement.id,
                    batch_reference = settlement.batch_reference,
                    external_hash,
                    "settlement submitted"
                );
                self.store
                    .mark_submitted(&settlement.id, &external_hash, Utc::now())
                    .await?;
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(settlement_id = settlement.id, error = %err, "submission failed");
                self.fail_attempt(settlement).await
            }
            Err(_) => {
                warn!(settlement_id = settlement.id, "submission timed out");
                self.fail_attempt(settlement).await
            }
        }
    }

    async fn poll_confirmation(&self, settlement: &Settlement) -> SettlementResult<()> {
        let Some(external_hash) = settlement.external_hash.as_deref() else {
            // A submitted row without a hash is unrecoverable bookkeeping
            // damage; resubmit it under the same batch reference.
            return self.fail_attempt(settlement).await;
        };
        match self.network.confirm(external_hash).await {
            Ok(NetworkStatus::Confirmed) => {
                let confirmed = self
                    .store
                    .mark_confirmed(&settlement.id, Utc::now())
                    .await?;
                self.finalize(&confirmed).await
            }
            Ok(NetworkStatus::Pending) => {
                let next = Utc::now()
                    + Duration::from_std(self.config.poll_every)
                        .unwrap_or_else(|_| Duration::seconds(10));
                self.store.poll_later(&settlement.id, next).await?;
                Ok(())
            }
            Ok(NetworkStatus::Failed { reason }) => {
                warn!(
                    settlement_id = settlement.id,
                    reason, "network reported settlement failure"
                );
                self.fail_attempt(settlement).await
            }
            Err(err) => {
                warn!(settlement_id = settlement.id, error = %err, "confirmation poll failed");
                self.fail_attempt(settlement).await
            }
        }
    }

    async fn finalize(&self, settlement: &Settlement) -> SettlementResult<()> {
        match self.handler.settlement_completed(settlement).await {
            Ok(()) => {
                self.store.mark_completed(&settlement.id).await?;
                info!(settlement_id = settlement.id, "settlement completed");
                Ok(())
            }
            Err(err) => {
                warn!(settlement_id = settlement.id, error = %err, "completion handler failed");
                self.fail_attempt(settlement).await
            }
        }
    }

    async fn fail_attempt(&self, settlement: &Settlement) -> SettlementResult<()> {
        let attempts = settlement.submission_count + 1;
        if attempts >= self.config.max_attempts {
            let failed = self.store.mark_failed(&settlement.id).await?;
            error!(
                settlement_id = settlement.id,
                attempts, "settlement permanently failed, compensating"
            );
            self.handler
                .settlement_failed(&failed)
                .await
                .map_err(|err| SettlementError::Handler(err.to_string()))?;
            Ok(())
        } else {
            let next = Utc::now() + self.config.backoff_after(attempts);
            self.store.reschedule(&settlement.id, next).await?;
            Ok(())
        }
    }
}
