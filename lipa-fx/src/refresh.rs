use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use lipa_money::Currency;
use tracing::info;
use tracing::warn;

use crate::FxService;

/// Which pairs to keep warm and how often. Defaults follow the service
/// contract: full refresh every 5 minutes, volatility sampling every minute.
#[derive(Debug, Clone)]
pub struct RefreshSchedule {
    pub pairs: Vec<(Currency, Currency)>,
    pub refresh_every: Duration,
    pub volatility_every: Duration,
}

impl RefreshSchedule {
    #[must_use]
    pub fn new(pairs: Vec<(Currency, Currency)>) -> Self {
        Self {
            pairs,
            refresh_every: Duration::from_secs(300),
            volatility_every: Duration::from_secs(60),
        }
    }
}

/// Background task keeping the supported pair set quoted and the volatility
/// window fed. Runs until `shutdown` flips; the owner usually spawns
/// `run()` on the runtime and keeps the flag.
pub struct RateRefresher {
    service: Arc<FxService>,
    schedule: RefreshSchedule,
    shutdown: Arc<AtomicBool>,
}

impl RateRefresher {
    #[must_use]
    pub fn new(service: Arc<FxService>, schedule: RefreshSchedule) -> Self {
        Self {
            service,
            schedule,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// One full pass over the configured pairs, straight to the providers.
    pub async fn refresh_once(&self) {
        for (base, target) in &self.schedule.pairs {
            match self.service.refresh_pair(*base, *target).await {
                Ok(quote) => info!(
                    base = %base,
                    target = %target,
                    mid = %quote.mid,
                    source = quote.source,
                    "refreshed rate"
                ),
                Err(err) => warn!(
                    base = %base,
                    target = %target,
                    error = %err,
                    "rate refresh failed"
                ),
            }
        }
    }

    pub async fn run(self) {
        let mut refresh = tokio::time::interval(self.schedule.refresh_every);
        let mut volatility = tokio::time::interval(self.schedule.volatility_every);
        // The first tick of an interval fires immediately; that gives us a
        // warm cache at startup.
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("rate refresher stopping");
                return;
            }
            tokio::select! {
                _ = refresh.tick() => self.refresh_once().await,
                _ = volatility.tick() => self.service.sample_volatility().await,
            }
        }
    }
}
