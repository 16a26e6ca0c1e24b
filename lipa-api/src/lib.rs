#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Public surface of the payments core: the facade the HTTP gateway calls,
//! the stable error taxonomy it maps onto status codes, environment-driven
//! configuration, and a fully in-memory demo wiring used by tests and local
//! development.

mod config;
mod controls;
mod demo;
mod error;
mod facade;
mod rate_limit;

pub use config::Config;
pub use controls::ApprovalsQueueView;
pub use controls::ControlsFacade;
pub use demo::DEMO_DEVICE;
pub use demo::DEMO_RECEIVER;
pub use demo::DEMO_SENDER;
pub use demo::DemoStack;
pub use demo::demo_stack;
pub use error::ApiError;
pub use error::ErrorBody;
pub use error::ErrorCode;
pub use facade::ApiResponse;
pub use facade::CreateEscrowParams;
pub use facade::InitiatePaymentParams;
pub use facade::PartySummary;
pub use facade::PaymentView;
pub use facade::PaymentsFacade;
pub use facade::RateView;
pub use facade::WalletView;
pub use rate_limit::RateLimitConfig;
pub use rate_limit::RateLimiter;

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;
