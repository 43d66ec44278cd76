use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CancelRefundRequest, CompleteRefundRequest, EventFilter, ProcessRefundRequest};
use crate::models::event::Event;
use crate::models::payment::ProductPayment;
use crate::models::product::{CartStatus, EventCart, OrderStatus};
use crate::models::refund::{OrderRefund, OrderRefundReason};
use crate::routes::AppState;
use crate::services::refund::{
    build_order_refund, ensure_no_active_refund, ProcessOutcome, RefundStatistics,
};
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Debug, Deserialize)]
pub struct InitiateOrderRefundRequest {
    pub cart_id: Uuid,
    pub reason: OrderRefundReason,
    pub reason_details: Option<String>,
}

#[derive(Serialize)]
struct ProcessedOrderRefund {
    refund: OrderRefund,
    #[serde(flatten)]
    outcome: ProcessOutcome,
}

async fn load(id: Uuid, state: &AppState) -> Result<OrderRefund, AppError> {
    OrderRefund::find_by_id(id, &state.pool)
        .await?
        .ok_or_else(|| AppError::not_found("Order refund", id))
}

pub async fn initiate(
    State(state): State<AppState>,
    Json(body): Json<InitiateOrderRefundRequest>,
) -> Result<Response, AppError> {
    let cart = EventCart::find_by_id(body.cart_id, &state.pool)
        .await?
        .ok_or_else(|| AppError::not_found("Cart", body.cart_id))?;
    if cart.status == CartStatus::Refunded {
        return Err(AppError::Conflict(format!(
            "Order {} has already been refunded",
            cart.order_reference
        )));
    }
    let open = OrderRefund::find_active_for_cart(cart.id, &state.pool).await?;
    ensure_no_active_refund(open.as_ref())?;

    let event = Event::find_by_id(cart.event_id, &state.pool)
        .await?
        .ok_or_else(|| AppError::not_found("Event", cart.event_id))?;
    let payment = ProductPayment::find_for_cart(cart.id, &state.pool).await?;

    let refund = build_order_refund(
        &cart,
        payment.as_ref(),
        &event.event_code,
        body.reason,
        body.reason_details,
    )?;

    let mut tx = state.pool.begin().await?;
    refund.insert(&mut tx).await?;
    EventCart::set_status(cart.id, CartStatus::PendingRefund, OrderStatus::PendingRefund, &mut tx)
        .await?;
    tx.commit().await?;

    tracing::info!(
        refund = %refund.refund_reference,
        cart = %cart.id,
        amount = %refund.ledger.refund_amount,
        automatic = refund.ledger.is_automatic_refund,
        "Order refund initiated"
    );
    Ok(created(refund, "Order refund initiated"))
}

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Result<Response, AppError> {
    let refunds = OrderRefund::list(filter.event_id, &state.pool).await?;
    Ok(success(refunds, "Order refunds retrieved"))
}

/// Refunds waiting on staff or the gateway, oldest first.
pub async fn pending(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Result<Response, AppError> {
    let refunds = OrderRefund::list_pending(filter.event_id, &state.pool).await?;
    Ok(success(refunds, "Pending order refunds retrieved"))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    let refund = load(id, &state).await?;
    Ok(success(refund, "Order refund retrieved"))
}

pub async fn process(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ProcessRefundRequest>>,
) -> Result<Response, AppError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let mut refund = load(id, &state).await?;

    let outcome = state
        .refunds
        .process_as(
            &mut refund,
            body.notes.as_deref(),
            body.method.as_deref(),
            body.manual,
        )
        .await?;
    Ok(success(
        ProcessedOrderRefund { refund, outcome },
        "Order refund processed",
    ))
}

pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CompleteRefundRequest>>,
) -> Result<Response, AppError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let mut refund = load(id, &state).await?;

    state
        .refunds
        .complete_order_refund(&mut refund, body.notes.as_deref(), Utc::now())
        .await?;
    Ok(success(refund, "Order refund completed"))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRefundRequest>>,
) -> Result<Response, AppError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let mut refund = load(id, &state).await?;
    state
        .refunds
        .cancel(&mut refund, body.reason.as_deref())
        .await?;
    Ok(success(refund, "Order refund cancelled"))
}

pub async fn retry(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    let mut refund = load(id, &state).await?;
    let outcome = state.refunds.retry(&mut refund).await?;
    Ok(success(
        ProcessedOrderRefund { refund, outcome },
        "Order refund retried",
    ))
}

pub async fn statistics(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Result<Response, AppError> {
    let refunds = OrderRefund::list(filter.event_id, &state.pool).await?;
    Ok(success(
        RefundStatistics::for_orders(&refunds),
        "Order refund statistics",
    ))
}
