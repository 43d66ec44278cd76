//! Refund records and the refund status machine.
//!
//! Registration refunds (`ParticipantRefund`) and merchandise refunds
//! (`OrderRefund`) share the same money-and-status bookkeeping, held in a
//! flattened [`RefundLedger`]. Every status change goes through
//! [`RefundLedger::transition`], which enforces the transition table.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use thiserror::Error;
use uuid::Uuid;

use crate::gateway::GatewayRefundReason;
use crate::models::payment::PaymentStatus;

text_enum! {
    pub enum RefundStatus {
        Pending => "PENDING",
        InProgress => "IN_PROGRESS",
        Processed => "PROCESSED",
        Failed => "FAILED",
        Cancelled => "CANCELLED",
    }
}

impl RefundStatus {
    pub fn can_transition_to(self, next: RefundStatus) -> bool {
        use RefundStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Processed)
                | (Pending, Failed)
                | (InProgress, Failed)
                | (Failed, Pending)
                | (Pending, Cancelled)
                | (InProgress, Cancelled)
                | (Failed, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RefundStatus::Processed | RefundStatus::Cancelled)
    }

    /// Still open: blocks a second refund for the same order or registration.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RefundStatus::Pending | RefundStatus::InProgress | RefundStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundKind {
    Participant,
    Order,
}

impl RefundKind {
    pub fn table(self) -> &'static str {
        match self {
            RefundKind::Participant => "participant_refunds",
            RefundKind::Order => "order_refunds",
        }
    }
}

text_enum! {
    pub enum ParticipantRefundReason {
        UserRequested => "USER_REQUESTED",
        EventCancelled => "EVENT_CANCELLED",
        AdminDecision => "ADMIN_DECISION",
        DuplicatePayment => "DUPLICATE_PAYMENT",
        ParticipantRemoved => "PARTICIPANT_REMOVED",
        Other => "OTHER",
    }
}

impl ParticipantRefundReason {
    pub fn gateway_reason(&self) -> GatewayRefundReason {
        match self {
            ParticipantRefundReason::DuplicatePayment => GatewayRefundReason::Duplicate,
            _ => GatewayRefundReason::RequestedByCustomer,
        }
    }
}

text_enum! {
    pub enum OrderRefundReason {
        CustomerRequested => "CUSTOMER_REQUESTED",
        DuplicateOrder => "DUPLICATE_ORDER",
        DamagedItem => "DAMAGED_ITEM",
        NotAsDescribed => "NOT_AS_DESCRIBED",
        WrongSize => "WRONG_SIZE",
        ChangedMind => "CHANGED_MIND",
        EventCancelled => "EVENT_CANCELLED",
        AdminDecision => "ADMIN_DECISION",
        Other => "OTHER",
    }
}

impl OrderRefundReason {
    pub fn gateway_reason(&self) -> GatewayRefundReason {
        match self {
            OrderRefundReason::DuplicateOrder => GatewayRefundReason::Duplicate,
            _ => GatewayRefundReason::RequestedByCustomer,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RefundError {
    #[error("Refund cannot move from {from} to {to}")]
    InvalidTransition { from: RefundStatus, to: RefundStatus },

    #[error("Refund already processed")]
    AlreadyProcessed,

    #[error("Refund has been cancelled")]
    Cancelled,

    #[error("Only failed refunds can be retried (status is {0})")]
    NotRetryable(RefundStatus),

    #[error("Refund amount {amount} exceeds the original payment of {original}")]
    AmountExceedsPayment { amount: Decimal, original: Decimal },

    #[error("Refund amount must not be negative (got {0})")]
    NegativeAmount(Decimal),

    #[error("This refund is not configured for automatic processing")]
    NotAutomatic,

    #[error("No captured gateway payment reference found for this refund")]
    MissingPaymentReference,

    #[error("Processing notes are required to complete a manual refund")]
    MissingProcessingNotes,

    #[error("Gateway refund has not been created yet")]
    MissingGatewayRefund,

    #[error("Cannot refund an unpaid order: no payment record found")]
    MissingPayment,

    #[error("Cannot refund a payment with status {0}")]
    PaymentNotRefundable(PaymentStatus),

    #[error("Refund {0} is still open for this payment")]
    ActiveRefundExists(String),
}

/// Money and status bookkeeping shared by both refund kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RefundLedger {
    #[sqlx(try_from = "String")]
    pub status: RefundStatus,
    pub refund_amount: Decimal,
    pub original_amount: Decimal,
    pub currency: String,
    pub is_automatic_refund: bool,
    pub gateway_payment_reference: Option<String>,
    pub gateway_refund_id: Option<String>,
    pub gateway_refund_status: Option<String>,
    pub failure_reason: Option<String>,
    pub processing_notes: Option<String>,
    pub refund_method: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Number of times processing has started; part of the gateway idempotency key.
    pub processing_attempts: i32,
}

impl RefundLedger {
    pub fn new(
        refund_amount: Decimal,
        original_amount: Decimal,
        currency: impl Into<String>,
        gateway_payment_reference: Option<String>,
        is_automatic_refund: bool,
    ) -> Result<Self, RefundError> {
        if refund_amount.is_sign_negative() && !refund_amount.is_zero() {
            return Err(RefundError::NegativeAmount(refund_amount));
        }
        if refund_amount > original_amount {
            return Err(RefundError::AmountExceedsPayment {
                amount: refund_amount,
                original: original_amount,
            });
        }

        Ok(Self {
            status: RefundStatus::Pending,
            refund_amount,
            original_amount,
            currency: currency.into(),
            is_automatic_refund,
            gateway_payment_reference,
            gateway_refund_id: None,
            gateway_refund_status: None,
            failure_reason: None,
            processing_notes: None,
            refund_method: None,
            processed_at: None,
            processing_attempts: 0,
        })
    }

    pub fn check_transition(&self, next: RefundStatus) -> Result<(), RefundError> {
        if self.status.can_transition_to(next) {
            return Ok(());
        }

        Err(match self.status {
            RefundStatus::Processed => RefundError::AlreadyProcessed,
            RefundStatus::Cancelled => RefundError::Cancelled,
            from => RefundError::InvalidTransition { from, to: next },
        })
    }

    pub fn transition(&mut self, next: RefundStatus) -> Result<(), RefundError> {
        self.check_transition(next)?;
        self.status = next;
        Ok(())
    }

    /// PENDING -> IN_PROGRESS.
    pub fn begin_processing(&mut self) -> Result<(), RefundError> {
        self.transition(RefundStatus::InProgress)?;
        self.processing_attempts += 1;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), RefundError> {
        self.transition(RefundStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// IN_PROGRESS -> PROCESSED, after checking the evidence the refund kind needs.
    pub fn complete(&mut self, notes: Option<&str>, now: DateTime<Utc>) -> Result<(), RefundError> {
        match self.status {
            RefundStatus::InProgress => {}
            RefundStatus::Processed => return Err(RefundError::AlreadyProcessed),
            RefundStatus::Cancelled => return Err(RefundError::Cancelled),
            from => {
                return Err(RefundError::InvalidTransition {
                    from,
                    to: RefundStatus::Processed,
                })
            }
        }

        if self.is_automatic_refund {
            if self.gateway_refund_id.is_none() {
                return Err(RefundError::MissingGatewayRefund);
            }
        } else if !has_text(notes) && !has_text(self.processing_notes.as_deref()) {
            return Err(RefundError::MissingProcessingNotes);
        }

        self.transition(RefundStatus::Processed)?;
        if let Some(notes) = notes.filter(|n| !n.trim().is_empty()) {
            self.append_notes(notes);
        }
        self.processed_at = Some(now);
        Ok(())
    }

    /// FAILED -> PENDING, dropping everything the failed attempt left behind.
    pub fn reset_for_retry(&mut self) -> Result<(), RefundError> {
        if self.status != RefundStatus::Failed {
            return Err(RefundError::NotRetryable(self.status));
        }
        self.transition(RefundStatus::Pending)?;
        self.gateway_refund_id = None;
        self.gateway_refund_status = None;
        self.failure_reason = None;
        Ok(())
    }

    pub fn cancel(&mut self, reason: Option<&str>) -> Result<(), RefundError> {
        self.transition(RefundStatus::Cancelled)?;
        if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
            self.append_notes(&format!("Cancellation: {}", reason));
        }
        Ok(())
    }

    pub fn append_notes(&mut self, notes: &str) {
        self.processing_notes = Some(match self.processing_notes.take() {
            Some(existing) if !existing.is_empty() => format!("{}\n\n{}", existing, notes),
            _ => notes.to_string(),
        });
    }
}

fn has_text(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// `PRF-CAMP24-1A2B3C4D` style reference shown to participants and staff.
pub fn generate_reference(prefix: &str, event_code: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        prefix,
        event_code.to_ascii_uppercase(),
        id[..8].to_ascii_uppercase()
    )
}

/// Writes the ledger back if the stored status is still `expected`.
///
/// Returns false when another request changed the refund first. Never touches
/// `stock_restored`, which only order completion raises.
pub async fn save_ledger(
    kind: RefundKind,
    id: Uuid,
    expected: RefundStatus,
    ledger: &RefundLedger,
    conn: &mut PgConnection,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET
            status = $3, is_automatic_refund = $4, gateway_refund_id = $5,
            gateway_refund_status = $6, failure_reason = $7, processing_notes = $8,
            refund_method = $9, processed_at = $10, processing_attempts = $11,
            updated_at = NOW()
         WHERE id = $1 AND status = $2",
        kind.table()
    );
    let result = sqlx::query(&sql)
        .bind(id)
        .bind(expected.as_str())
        .bind(ledger.status.as_str())
        .bind(ledger.is_automatic_refund)
        .bind(&ledger.gateway_refund_id)
        .bind(&ledger.gateway_refund_status)
        .bind(&ledger.failure_reason)
        .bind(&ledger.processing_notes)
        .bind(&ledger.refund_method)
        .bind(ledger.processed_at)
        .bind(ledger.processing_attempts)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

const ACTIVE_STATUSES: &str = "('PENDING', 'IN_PROGRESS', 'FAILED')";
const PENDING_STATUSES: &str = "('PENDING', 'IN_PROGRESS')";

/// What the refund service needs from either refund kind.
pub trait RefundRecord {
    fn kind(&self) -> RefundKind;
    fn id(&self) -> Uuid;
    fn reference(&self) -> &str;
    fn ledger(&self) -> &RefundLedger;
    fn ledger_mut(&mut self) -> &mut RefundLedger;
    fn reason_code(&self) -> &'static str;
    fn gateway_reason(&self) -> GatewayRefundReason;
    fn gateway_metadata(&self) -> Vec<(&'static str, String)>;
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ParticipantRefund {
    pub id: Uuid,
    pub refund_reference: String,
    pub event_id: Uuid,
    pub participant_id: Uuid,
    pub event_payment_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub refund_reason: ParticipantRefundReason,
    pub reason_details: Option<String>,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub ledger: RefundLedger,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefundRecord for ParticipantRefund {
    fn kind(&self) -> RefundKind {
        RefundKind::Participant
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn reference(&self) -> &str {
        &self.refund_reference
    }

    fn ledger(&self) -> &RefundLedger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut RefundLedger {
        &mut self.ledger
    }

    fn reason_code(&self) -> &'static str {
        self.refund_reason.as_str()
    }

    fn gateway_reason(&self) -> GatewayRefundReason {
        self.refund_reason.gateway_reason()
    }

    fn gateway_metadata(&self) -> Vec<(&'static str, String)> {
        vec![
            ("refund_id", self.id.to_string()),
            ("refund_reference", self.refund_reference.clone()),
            ("participant_id", self.participant_id.to_string()),
            ("event_id", self.event_id.to_string()),
        ]
    }
}

impl ParticipantRefund {
    pub async fn insert(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO participant_refunds (
                id, refund_reference, event_id, participant_id, event_payment_id,
                refund_reason, reason_details, status, refund_amount, original_amount,
                currency, is_automatic_refund, gateway_payment_reference, created_at, updated_at
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(self.id)
        .bind(&self.refund_reference)
        .bind(self.event_id)
        .bind(self.participant_id)
        .bind(self.event_payment_id)
        .bind(self.refund_reason.as_str())
        .bind(&self.reason_details)
        .bind(self.ledger.status.as_str())
        .bind(self.ledger.refund_amount)
        .bind(self.ledger.original_amount)
        .bind(&self.ledger.currency)
        .bind(self.ledger.is_automatic_refund)
        .bind(&self.ledger.gateway_payment_reference)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM participant_refunds WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_gateway_refund_id(
        gateway_refund_id: &str,
        pool: &PgPool,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM participant_refunds WHERE gateway_refund_id = $1")
            .bind(gateway_refund_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_active_for_participant(
        participant_id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT * FROM participant_refunds
             WHERE participant_id = $1 AND status IN {}
             ORDER BY created_at DESC LIMIT 1",
            ACTIVE_STATUSES
        ))
        .bind(participant_id)
        .fetch_optional(pool)
        .await
    }

    /// Refunds still waiting on someone: PENDING or IN_PROGRESS.
    pub async fn list_pending(
        event_id: Option<Uuid>,
        pool: &PgPool,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT * FROM participant_refunds
             WHERE ($1::uuid IS NULL OR event_id = $1) AND status IN {}
             ORDER BY created_at",
            PENDING_STATUSES
        ))
        .bind(event_id)
        .fetch_all(pool)
        .await
    }

    pub async fn list(event_id: Option<Uuid>, pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM participant_refunds
             WHERE ($1::uuid IS NULL OR event_id = $1)
             ORDER BY created_at DESC",
        )
        .bind(event_id)
        .fetch_all(pool)
        .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRefund {
    pub id: Uuid,
    pub refund_reference: String,
    pub event_id: Uuid,
    pub cart_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub refund_reason: OrderRefundReason,
    pub reason_details: Option<String>,
    pub stock_restored: bool,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub ledger: RefundLedger,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefundRecord for OrderRefund {
    fn kind(&self) -> RefundKind {
        RefundKind::Order
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn reference(&self) -> &str {
        &self.refund_reference
    }

    fn ledger(&self) -> &RefundLedger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut RefundLedger {
        &mut self.ledger
    }

    fn reason_code(&self) -> &'static str {
        self.refund_reason.as_str()
    }

    fn gateway_reason(&self) -> GatewayRefundReason {
        self.refund_reason.gateway_reason()
    }

    fn gateway_metadata(&self) -> Vec<(&'static str, String)> {
        vec![
            ("refund_id", self.id.to_string()),
            ("refund_reference", self.refund_reference.clone()),
            ("cart_id", self.cart_id.to_string()),
            ("event_id", self.event_id.to_string()),
        ]
    }
}

impl OrderRefund {
    pub async fn insert(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO order_refunds (
                id, refund_reference, event_id, cart_id, payment_id, user_id,
                refund_reason, reason_details, stock_restored, status, refund_amount,
                original_amount, currency, is_automatic_refund, gateway_payment_reference,
                created_at, updated_at
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(self.id)
        .bind(&self.refund_reference)
        .bind(self.event_id)
        .bind(self.cart_id)
        .bind(self.payment_id)
        .bind(self.user_id)
        .bind(self.refund_reason.as_str())
        .bind(&self.reason_details)
        .bind(self.stock_restored)
        .bind(self.ledger.status.as_str())
        .bind(self.ledger.refund_amount)
        .bind(self.ledger.original_amount)
        .bind(&self.ledger.currency)
        .bind(self.ledger.is_automatic_refund)
        .bind(&self.ledger.gateway_payment_reference)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM order_refunds WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_gateway_refund_id(
        gateway_refund_id: &str,
        pool: &PgPool,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM order_refunds WHERE gateway_refund_id = $1")
            .bind(gateway_refund_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_active_for_cart(
        cart_id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT * FROM order_refunds
             WHERE cart_id = $1 AND status IN {}
             ORDER BY created_at DESC LIMIT 1",
            ACTIVE_STATUSES
        ))
        .bind(cart_id)
        .fetch_optional(pool)
        .await
    }

    /// Refunds still waiting on someone: PENDING or IN_PROGRESS.
    pub async fn list_pending(
        event_id: Option<Uuid>,
        pool: &PgPool,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT * FROM order_refunds
             WHERE ($1::uuid IS NULL OR event_id = $1) AND status IN {}
             ORDER BY created_at",
            PENDING_STATUSES
        ))
        .bind(event_id)
        .fetch_all(pool)
        .await
    }

    pub async fn list(event_id: Option<Uuid>, pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM order_refunds
             WHERE ($1::uuid IS NULL OR event_id = $1)
             ORDER BY created_at DESC",
        )
        .bind(event_id)
        .fetch_all(pool)
        .await
    }
}
