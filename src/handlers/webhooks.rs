use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use serde::Serialize;

use crate::gateway::stripe::StripeEvent;
use crate::gateway::verify_webhook_signature;
use crate::models::refund::{OrderRefund, ParticipantRefund};
use crate::routes::AppState;
use crate::utils::error::AppError;
use crate::utils::response::success;

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Serialize)]
struct WebhookReceipt {
    handled: bool,
    refund_reference: Option<String>,
    status_changed: bool,
}

impl WebhookReceipt {
    fn ignored() -> Self {
        Self {
            handled: false,
            refund_reference: None,
            status_changed: false,
        }
    }
}

fn verified_event(
    headers: &HeaderMap,
    body: &[u8],
    secret: Option<&str>,
) -> Result<StripeEvent, AppError> {
    let secret = secret.ok_or_else(|| {
        AppError::ValidationError("Webhook signing secret is not configured".to_string())
    })?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::ValidationError("Missing Stripe-Signature header".to_string()))?;

    verify_webhook_signature(body, signature, secret, Utc::now().timestamp())?;
    serde_json::from_slice(body)
        .map_err(|e| AppError::ValidationError(format!("Invalid webhook payload: {}", e)))
}

/// Reconciles gateway refund updates with the matching refund record.
///
/// Unknown events and unknown refunds are acknowledged so the gateway stops
/// redelivering them.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let event = match verified_event(&headers, &body, state.webhook_secret.as_deref()) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected gateway webhook");
            return Err(e);
        }
    };

    let Some(update) = event.refund_update() else {
        tracing::debug!(event_type = %event.event_type, "Ignoring gateway event");
        return Ok(success(WebhookReceipt::ignored(), "Event ignored"));
    };

    if let Some(mut refund) =
        OrderRefund::find_by_gateway_refund_id(&update.refund_id, &state.pool).await?
    {
        let changed = state.refunds.reconcile(&mut refund, &update).await?;
        return Ok(success(
            WebhookReceipt {
                handled: true,
                refund_reference: Some(refund.refund_reference),
                status_changed: changed,
            },
            "Order refund updated",
        ));
    }

    if let Some(mut refund) =
        ParticipantRefund::find_by_gateway_refund_id(&update.refund_id, &state.pool).await?
    {
        let changed = state.refunds.reconcile(&mut refund, &update).await?;
        return Ok(success(
            WebhookReceipt {
                handled: true,
                refund_reference: Some(refund.refund_reference),
                status_changed: changed,
            },
            "Participant refund updated",
        ));
    }

    tracing::warn!(gateway_refund = %update.refund_id, "No refund matches gateway update");
    Ok(success(WebhookReceipt::ignored(), "No matching refund"))
}
