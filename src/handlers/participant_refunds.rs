use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CancelRefundRequest, CompleteRefundRequest, EventFilter, ProcessRefundRequest};
use crate::models::event::Event;
use crate::models::participant::{EventParticipant, ParticipantStatus};
use crate::models::payment::{EventPayment, PaymentStatus};
use crate::models::refund::{ParticipantRefund, ParticipantRefundReason};
use crate::routes::AppState;
use crate::services::refund::{
    build_participant_refund, ensure_no_active_refund, ProcessOutcome, RefundStatistics,
};
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Debug, Deserialize)]
pub struct InitiateParticipantRefundRequest {
    pub participant_id: Uuid,
    pub reason: ParticipantRefundReason,
    pub reason_details: Option<String>,
    /// Partial refund; the whole payment when omitted.
    pub amount: Option<Decimal>,
}

#[derive(Serialize)]
struct ProcessedParticipantRefund {
    refund: ParticipantRefund,
    #[serde(flatten)]
    outcome: ProcessOutcome,
}

async fn load(id: Uuid, state: &AppState) -> Result<ParticipantRefund, AppError> {
    ParticipantRefund::find_by_id(id, &state.pool)
        .await?
        .ok_or_else(|| AppError::not_found("Participant refund", id))
}

/// Cancels the registration and opens a refund for its latest payment.
pub async fn initiate(
    State(state): State<AppState>,
    Json(body): Json<InitiateParticipantRefundRequest>,
) -> Result<Response, AppError> {
    let participant = EventParticipant::find_by_id(body.participant_id, &state.pool)
        .await?
        .ok_or_else(|| AppError::not_found("Participant", body.participant_id))?;
    let event = Event::find_by_id(participant.event_id, &state.pool)
        .await?
        .ok_or_else(|| AppError::not_found("Event", participant.event_id))?;
    let open = ParticipantRefund::find_active_for_participant(participant.id, &state.pool).await?;
    ensure_no_active_refund(open.as_ref())?;
    let payment = EventPayment::find_latest_for_participant(participant.id, &state.pool).await?;

    let refund = build_participant_refund(
        &participant,
        payment.as_ref(),
        &event.event_code,
        body.reason,
        body.reason_details,
        body.amount,
    )?;

    let mut tx = state.pool.begin().await?;
    refund.insert(&mut tx).await?;
    EventParticipant::update_status(participant.id, ParticipantStatus::Cancelled, &mut tx).await?;
    if let Some(payment_id) = refund.event_payment_id {
        EventPayment::update_status(payment_id, PaymentStatus::RefundProcessing, &mut tx).await?;
    }
    tx.commit().await?;

    tracing::info!(
        refund = %refund.refund_reference,
        participant = %participant.id,
        amount = %refund.ledger.refund_amount,
        automatic = refund.ledger.is_automatic_refund,
        "Participant refund initiated"
    );
    Ok(created(refund, "Participant refund initiated"))
}

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Result<Response, AppError> {
    let refunds = ParticipantRefund::list(filter.event_id, &state.pool).await?;
    Ok(success(refunds, "Participant refunds retrieved"))
}

/// Refunds waiting on staff or the gateway, oldest first.
pub async fn pending(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Result<Response, AppError> {
    let refunds = ParticipantRefund::list_pending(filter.event_id, &state.pool).await?;
    Ok(success(refunds, "Pending participant refunds retrieved"))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    let refund = load(id, &state).await?;
    Ok(success(refund, "Participant refund retrieved"))
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
        .process_participant_refund(
            &mut refund,
            body.notes.as_deref(),
            body.method.as_deref(),
            body.manual,
        )
        .await?;
    Ok(success(
        ProcessedParticipantRefund { refund, outcome },
        "Participant refund processed",
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
        .complete_participant_refund(&mut refund, body.notes.as_deref(), Utc::now())
        .await?;
    Ok(success(refund, "Participant refund completed"))
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
    Ok(success(refund, "Participant refund cancelled"))
}

pub async fn retry(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    let mut refund = load(id, &state).await?;
    let outcome = state.refunds.retry_participant_refund(&mut refund).await?;
    Ok(success(
        ProcessedParticipantRefund { refund, outcome },
        "Participant refund retried",
    ))
}

pub async fn statistics(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Result<Response, AppError> {
    let refunds = ParticipantRefund::list(filter.event_id, &state.pool).await?;
    Ok(success(
        RefundStatistics::collect(&refunds),
        "Participant refund statistics",
    ))
}
