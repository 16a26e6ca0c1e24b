use std::str::FromStr;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use lipa_audit::AuditEntry;
use lipa_audit::AuditFilter;
use lipa_audit::AuditSink;
use lipa_directory::UserDirectory;
use lipa_engine::DisputeResolution;
use lipa_engine::EngineError;
use lipa_engine::EscrowTerms;
use lipa_engine::PaymentEngine;
use lipa_engine::PaymentRequest;
use lipa_engine::Receipt;
use lipa_engine::ReceiverRef;
use lipa_engine::Transaction;
use lipa_engine::TransactionStatus;
use lipa_fx::FxService;
use lipa_money::Currency;
use lipa_money::Money;
use lipa_wallet::Wallet;
use lipa_wallet::WalletStatus;
use lipa_wallet::WalletStore;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::ApiError;
use crate::ApiResult;
use crate::ErrorCode;

/// Successful facade responses: the HTTP status the gateway should emit,
/// the request id echoed in `X-Request-ID`, and the body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub request_id: String,
    pub status: u16,
    pub body: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartySummary {
    pub id: String,
    pub display_name: String,
}

/// `GET /payments/{id}`: the transaction with embedded party summaries.
/// Journal entry ids ride along on the transaction itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentView {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub sender: PartySummary,
    pub receiver: PartySummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateView {
    pub base: Currency,
    pub target: Currency,
    pub mid: Decimal,
    pub buy: Decimal,
    pub sell: Decimal,
    pub spread: Decimal,
    pub source: String,
    pub valid_to: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletView {
    pub id: String,
    pub user_id: String,
    pub currency: Currency,
    pub available: Decimal,
    pub reserved: Decimal,
    pub ledger: Decimal,
    pub status: WalletStatus,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

impl From<Wallet> for WalletView {
    fn from(wallet: Wallet) -> Self {
        Self {
            id: wallet.id,
            user_id: wallet.user_id,
            currency: wallet.currency,
            available: wallet.available,
            reserved: wallet.reserved,
            ledger: wallet.ledger,
            status: wallet.status,
            address: wallet.address,
            created_at: wallet.created_at,
        }
    }
}

/// `POST /payments` body. Amounts arrive as string decimals; exactly one of
/// `receiver_id` / `receiver_wallet_address` names the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiatePaymentParams {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_wallet_address: Option<String>,
    pub amount: String,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// `POST /escrow` body: a payment plus the release condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEscrowParams {
    #[serde(flatten)]
    pub payment: InitiatePaymentParams,
    pub release_actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The inbound surface the gateway calls. Authentication and authorization
/// happen before this layer; the facade validates shape, maps errors onto
/// the public taxonomy, and stamps every response with a request id.
#[derive(Clone)]
pub struct PaymentsFacade {
    engine: Arc<PaymentEngine>,
    directory: Arc<dyn UserDirectory>,
    wallets: Arc<dyn WalletStore>,
    fx: Arc<FxService>,
    audit: Arc<dyn AuditSink>,
}

impl PaymentsFacade {
    #[must_use]
    pub fn new(
        engine: Arc<PaymentEngine>,
        directory: Arc<dyn UserDirectory>,
        wallets: Arc<dyn WalletStore>,
        fx: Arc<FxService>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            engine,
            directory,
            wallets,
            fx,
            audit,
        }
    }

    fn request_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn parse_currency(value: &str, request_id: &str) -> Result<Currency, ApiError> {
        Currency::from_str(value)
            .map_err(|err| ApiError::new(ErrorCode::Validation, err.to_string(), request_id))
    }

    fn parse_amount(value: &str, currency: Currency, request_id: &str) -> Result<Money, ApiError> {
        Money::parse(value, currency)
            .map_err(|err| ApiError::new(ErrorCode::Validation, err.to_string(), request_id))
    }

    fn engine_request(
        params: InitiatePaymentParams,
        idempotency_key: Option<String>,
        request_id: &str,
    ) -> Result<PaymentRequest, ApiError> {
        let currency = Self::parse_currency(&params.currency, request_id)?;
        let amount = Self::parse_amount(&params.amount, currency, request_id)?;
        let destination_currency = params
            .destination_currency
            .as_deref()
            .map(|value| Self::parse_currency(value, request_id))
            .transpose()?;

        let receiver = match (&params.receiver_wallet_address, &params.receiver_id) {
            (Some(address), None) => ReceiverRef::WalletAddress(address.clone()),
            (None, Some(user_id)) => ReceiverRef::UserId(user_id.clone()),
            _ => {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "exactly one of receiver_id or receiver_wallet_address is required",
                    request_id,
                ));
            }
        };

        let reference = idempotency_key.unwrap_or_else(|| params.reference.clone());
        if reference.trim().is_empty() {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "a reference or Idempotency-Key is required",
                request_id,
            ));
        }

        Ok(PaymentRequest {
            reference,
            sender_id: params.sender_id,
            receiver,
            amount,
            destination_currency,
            description: params.description,
            channel: None,
            device_hash: params.device_id,
            ip_address: params.ip_address,
            location_suspicious: false,
            metadata: params.metadata,
        })
    }

    async fn payment_view(
        &self,
        transaction: Transaction,
        request_id: &str,
    ) -> Result<PaymentView, ApiError> {
        let sender = self
            .directory
            .find_by_id(&transaction.sender_id)
            .await
            .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string(), request_id))?;
        let receiver = self
            .directory
            .find_by_id(&transaction.receiver_id)
            .await
            .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string(), request_id))?;
        Ok(PaymentView {
            transaction,
            sender: PartySummary {
                id: sender.id,
                display_name: sender.display_name,
            },
            receiver: PartySummary {
                id: receiver.id,
                display_name: receiver.display_name,
            },
        })
    }

    fn respond<T>(request_id: String, status: u16, body: T) -> ApiResult<T> {
        Ok(ApiResponse {
            request_id,
            status,
            body,
        })
    }

    /// Business failures surface as errors from the public surface even
    /// though the engine records them as FAILED transaction rows.
    fn reject_failed(transaction: &Transaction, request_id: &str) -> Result<(), ApiError> {
        if transaction.status == TransactionStatus::Failed
            && let Some(reason) = &transaction.status_reason
        {
            return Err(ApiError::from_status_reason(reason, request_id));
        }
        Ok(())
    }

    pub async fn initiate_payment(
        &self,
        params: InitiatePaymentParams,
        idempotency_key: Option<String>,
    ) -> ApiResult<PaymentView> {
        let request_id = Self::request_id();
        let request = Self::engine_request(params, idempotency_key, &request_id)?;
        let result = self
            .engine
            .initiate_payment(request)
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        Self::reject_failed(&result.transaction, &request_id)?;
        let status = if result.replayed {
            200
        } else if result.transaction.status == TransactionStatus::PendingApproval {
            202
        } else {
            201
        };
        let view = self.payment_view(result.transaction, &request_id).await?;
        Self::respond(request_id, status, view)
    }

    pub async fn get_payment(&self, transaction_id: &str) -> ApiResult<PaymentView> {
        let request_id = Self::request_id();
        let transaction = self
            .engine
            .get_payment(&transaction_id.to_string())
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        let view = self.payment_view(transaction, &request_id).await?;
        Self::respond(request_id, 200, view)
    }

    pub async fn payment_receipt(&self, transaction_id: &str) -> ApiResult<Receipt> {
        let request_id = Self::request_id();
        let receipt = self
            .engine
            .receipt(&transaction_id.to_string())
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        Self::respond(request_id, 200, receipt)
    }

    pub async fn open_dispute(
        &self,
        transaction_id: &str,
        initiator: &str,
        reason: &str,
    ) -> ApiResult<PaymentView> {
        let request_id = Self::request_id();
        let transaction = self
            .engine
            .open_dispute(&transaction_id.to_string(), &initiator.to_string(), reason)
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        let view = self.payment_view(transaction, &request_id).await?;
        Self::respond(request_id, 200, view)
    }

    pub async fn resolve_dispute(
        &self,
        transaction_id: &str,
        admin: &str,
        resolution: DisputeResolution,
    ) -> ApiResult<PaymentView> {
        let request_id = Self::request_id();
        let transaction = self
            .engine
            .resolve_dispute(&transaction_id.to_string(), &admin.to_string(), resolution)
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        let view = self.payment_view(transaction, &request_id).await?;
        Self::respond(request_id, 200, view)
    }

    pub async fn create_escrow(
        &self,
        params: CreateEscrowParams,
        idempotency_key: Option<String>,
    ) -> ApiResult<PaymentView> {
        let request_id = Self::request_id();
        let terms = EscrowTerms {
            release_actor: params.release_actor.clone(),
            expires_at: params.expires_at,
        };
        let request = Self::engine_request(params.payment, idempotency_key, &request_id)?;
        let result = self
            .engine
            .create_escrow(request, terms)
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        Self::reject_failed(&result.transaction, &request_id)?;
        let status = if result.replayed { 200 } else { 201 };
        let view = self.payment_view(result.transaction, &request_id).await?;
        Self::respond(request_id, status, view)
    }

    pub async fn release_escrow(&self, transaction_id: &str, actor: &str) -> ApiResult<PaymentView> {
        let request_id = Self::request_id();
        let transaction = self
            .engine
            .release_escrow(&transaction_id.to_string(), &actor.to_string())
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        let view = self.payment_view(transaction, &request_id).await?;
        Self::respond(request_id, 200, view)
    }

    pub async fn expire_escrow(&self, transaction_id: &str) -> ApiResult<PaymentView> {
        let request_id = Self::request_id();
        let transaction = self
            .engine
            .expire_escrow(&transaction_id.to_string())
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        let view = self.payment_view(transaction, &request_id).await?;
        Self::respond(request_id, 200, view)
    }

    pub async fn approve_payment(&self, transaction_id: &str, admin: &str) -> ApiResult<PaymentView> {
        let request_id = Self::request_id();
        let transaction = self
            .engine
            .approve_payment(&transaction_id.to_string(), &admin.to_string())
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        Self::reject_failed(&transaction, &request_id)?;
        let view = self.payment_view(transaction, &request_id).await?;
        Self::respond(request_id, 200, view)
    }

    pub async fn reject_payment(
        &self,
        transaction_id: &str,
        admin: &str,
        reason: &str,
    ) -> ApiResult<PaymentView> {
        let request_id = Self::request_id();
        let transaction = self
            .engine
            .reject_payment(&transaction_id.to_string(), &admin.to_string(), reason)
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        let view = self.payment_view(transaction, &request_id).await?;
        Self::respond(request_id, 200, view)
    }

    pub async fn list_approvals(&self) -> ApiResult<Vec<PaymentView>> {
        let request_id = Self::request_id();
        let pending = self
            .engine
            .list_pending_approvals()
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        let mut views = Vec::with_capacity(pending.len());
        for transaction in pending {
            views.push(self.payment_view(transaction, &request_id).await?);
        }
        Self::respond(request_id, 200, views)
    }

    /// `GET /forex/rate?from=&to=`.
    pub async fn fx_quote(&self, from: &str, to: &str) -> ApiResult<RateView> {
        let request_id = Self::request_id();
        let base = Self::parse_currency(from, &request_id)?;
        let target = Self::parse_currency(to, &request_id)?;
        let quote = self.fx.rate(base, target).await.map_err(|err| {
            ApiError::from_engine(
                match err {
                    lipa_fx::FxError::RateUnavailable { base, target } => {
                        EngineError::RateUnavailable { base, target }
                    }
                    other => EngineError::Internal(other.to_string()),
                },
                &request_id,
            )
        })?;
        Self::respond(
            request_id,
            200,
            RateView {
                base: quote.base,
                target: quote.target,
                mid: quote.mid,
                buy: quote.buy,
                sell: quote.sell,
                spread: quote.spread,
                source: quote.source,
                valid_to: quote.valid_to,
            },
        )
    }

    pub async fn create_wallet(&self, user_id: &str, currency: &str) -> ApiResult<WalletView> {
        let request_id = Self::request_id();
        let currency = Self::parse_currency(currency, &request_id)?;
        let wallet = self
            .engine
            .create_wallet(&user_id.to_string(), currency)
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        Self::respond(request_id, 201, wallet.into())
    }

    pub async fn list_wallets(&self, user_id: &str) -> ApiResult<Vec<WalletView>> {
        let request_id = Self::request_id();
        let wallets = self
            .wallets
            .list_for_user(&user_id.to_string())
            .await
            .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string(), &request_id))?;
        Self::respond(
            request_id,
            200,
            wallets.into_iter().map(WalletView::from).collect(),
        )
    }

    pub async fn wallet_transactions(&self, wallet_id: &str) -> ApiResult<Vec<Transaction>> {
        let request_id = Self::request_id();
        // Surface 404 for unknown wallets rather than an empty list.
        self.wallets
            .get(&wallet_id.to_string())
            .await
            .map_err(|err| ApiError::new(ErrorCode::NotFound, err.to_string(), &request_id))?;
        let transactions = self
            .engine
            .wallet_transactions(&wallet_id.to_string())
            .await
            .map_err(|err| ApiError::from_engine(err, &request_id))?;
        Self::respond(request_id, 200, transactions)
    }

    pub async fn audit_trail(
        &self,
        entity_id: Option<String>,
        limit: Option<usize>,
    ) -> ApiResult<Vec<AuditEntry>> {
        let request_id = Self::request_id();
        let records = self
            .audit
            .records(AuditFilter {
                entity_id,
                action: None,
                limit,
            })
            .await
            .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string(), &request_id))?;
        Self::respond(request_id, 200, records)
    }
}
