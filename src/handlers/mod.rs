use axum::response::Response;
use serde::{Deserialize, Serialize};

use crate::utils::response::success;

pub mod order_refunds;
pub mod participant_refunds;
pub mod quotes;
pub mod stock;
pub mod webhooks;

#[derive(Serialize)]
struct HealthPayload {
    status: &'static str,
    service: &'static str,
}

pub async fn health_check() -> Response {
    let payload = HealthPayload {
        status: "ok",
        service: "gathering-api",
    };

    success(payload, "Health check successful")
}

/// Optional filter shared by list and statistics endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub event_id: Option<uuid::Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessRefundRequest {
    pub notes: Option<String>,
    pub method: Option<String>,
    /// Process an automatic refund by hand instead of through the gateway.
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteRefundRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRefundRequest {
    pub reason: Option<String>,
}
