//! Payment gateway collaborator used for automatic refunds.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod stripe;

pub use stripe::{verify_webhook_signature, StripeGateway, StripeOptions};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Gateway rejected the request: {0}")]
    InvalidRequest(String),

    #[error("Gateway declined the refund: {0}")]
    Declined(String),

    #[error("Gateway unreachable: {0}")]
    Transport(String),

    #[error("Unexpected gateway response: {0}")]
    Decode(String),

    #[error("Refund amount {0} cannot be expressed in minor units")]
    InvalidAmount(Decimal),

    #[error("No payment gateway is configured")]
    NotConfigured,

    #[error("Webhook signature rejected: {0}")]
    InvalidSignature(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayRefundReason {
    Duplicate,
    Fraudulent,
    RequestedByCustomer,
}

impl GatewayRefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayRefundReason::Duplicate => "duplicate",
            GatewayRefundReason::Fraudulent => "fraudulent",
            GatewayRefundReason::RequestedByCustomer => "requested_by_customer",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRefundRequest {
    /// Captured payment the money goes back to.
    pub payment_reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub reason: GatewayRefundReason,
    pub metadata: Vec<(&'static str, String)>,
    /// Same key for the same processing attempt, so a replayed call cannot refund twice.
    pub idempotency_key: String,
}

impl GatewayRefundRequest {
    /// Amount in pence/cents.
    pub fn amount_minor_units(&self) -> Result<i64, GatewayError> {
        (self.amount * Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .filter(|minor| *minor > 0)
            .ok_or(GatewayError::InvalidAmount(self.amount))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub refund_id: String,
    pub status: String,
}

/// Status pushed back by the gateway after a refund was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayRefundState {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl GatewayRefundState {
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "pending" | "requires_action" => Some(GatewayRefundState::Pending),
            "succeeded" => Some(GatewayRefundState::Succeeded),
            "failed" => Some(GatewayRefundState::Failed),
            "canceled" => Some(GatewayRefundState::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayRefundState::Pending => "pending",
            GatewayRefundState::Succeeded => "succeeded",
            GatewayRefundState::Failed => "failed",
            GatewayRefundState::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRefundUpdate {
    pub refund_id: String,
    pub state: GatewayRefundState,
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_refund(
        &self,
        request: &GatewayRefundRequest,
    ) -> Result<GatewayRefund, GatewayError>;
}

/// Stands in when no gateway credentials are configured.
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    fn name(&self) -> &'static str {
        "Disabled"
    }

    async fn create_refund(
        &self,
        _request: &GatewayRefundRequest,
    ) -> Result<GatewayRefund, GatewayError> {
        Err(GatewayError::NotConfigured)
    }
}
