use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use lipa_engine::PaymentEngine;
use lipa_engine::Transaction;
use lipa_risk::Blocklist;
use lipa_risk::CircuitBreaker;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::ApiError;
use crate::ApiResult;
use crate::Config;
use crate::ErrorCode;
use crate::facade::ApiResponse;

/// Snapshot of the approvals backlog for the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalsQueueView {
    pub generated_at: DateTime<Utc>,
    pub payments: Vec<Transaction>,
}

/// Operational controls: the manual pause switch, the blocklist, and the
/// admin-approval queue. Everything here is admin-authenticated upstream.
#[derive(Clone)]
pub struct ControlsFacade {
    engine: Arc<PaymentEngine>,
    blocklist: Arc<dyn Blocklist>,
    breaker: Arc<CircuitBreaker>,
}

impl ControlsFacade {
    #[must_use]
    pub fn new(
        engine: Arc<PaymentEngine>,
        blocklist: Arc<dyn Blocklist>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            engine,
            blocklist,
            breaker,
        }
    }

    /// Applies the configuration-held kill switch. Called at startup and
    /// whenever configuration is re-read.
    pub fn sync_pause_from(&self, config: &Config) {
        self.breaker.set_paused(config.global_pause);
        if config.global_pause {
            info!("global pause enabled from configuration");
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.breaker.set_paused(paused);
        info!(paused, "manual pause flag changed");
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.breaker.is_paused()
    }

    pub async fn block(&self, subject: &str) -> ApiResult<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.blocklist
            .block(subject)
            .await
            .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string(), &request_id))?;
        Ok(ApiResponse {
            request_id,
            status: 204,
            body: (),
        })
    }

    pub async fn unblock(&self, subject: &str) -> ApiResult<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.blocklist
            .unblock(subject)
            .await
            .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string(), &request_id))?;
        Ok(ApiResponse {
            request_id,
            status: 204,
            body: (),
        })
    }

    pub async fn approvals_queue(&self) -> ApiResult<ApprovalsQueueView> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut payments = self
            .engine
            .list_pending_approvals()
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        payments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(ApiResponse {
            request_id,
            status: 200,
            body: ApprovalsQueueView {
                generated_at: Utc::now(),
                payments,
            },
        })
    }
}
