//! Refund processing: initiation, gateway calls, completion side effects,
//! retries and stock restoration.
//!
//! Every state change is written through a [`RefundStore`] with a
//! compare-and-set on the status the caller loaded. Processing claims the
//! refund (PENDING -> IN_PROGRESS) before the gateway is called, and
//! completion writes the refund row together with its payment, cart and
//! stock effects in one transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::gateway::{GatewayRefundRequest, GatewayRefundState, GatewayRefundUpdate, PaymentGateway};
use crate::models::participant::EventParticipant;
use crate::models::payment::{EventPayment, PaymentStatus, ProductPayment};
use crate::models::product::{CartStatus, EventCart, EventProductOrder, OrderStatus};
use crate::models::refund::{
    self as refund_rows, generate_reference, OrderRefund, OrderRefundReason, ParticipantRefund,
    ParticipantRefundReason, RefundError, RefundKind, RefundLedger, RefundRecord, RefundStatus,
};
use crate::services::discount::round_money;
use crate::services::stock;
use crate::utils::error::AppError;

const DEFAULT_MANUAL_METHOD: &str = "Bank Transfer";

/// Persistence for refund state and the effects of completing a refund.
#[async_trait]
pub trait RefundStore: Send + Sync {
    /// Writes the ledger if the stored status is still `expected`.
    async fn save_ledger(
        &self,
        kind: RefundKind,
        id: Uuid,
        expected: RefundStatus,
        ledger: &RefundLedger,
    ) -> Result<bool, AppError>;

    async fn event_payment_status(&self, payment_id: Uuid)
        -> Result<Option<PaymentStatus>, AppError>;

    /// Saves the completed ledger and marks the event payment REFUNDED, atomically.
    /// False when the stored status is no longer `expected`.
    async fn complete_participant_refund(
        &self,
        refund: &ParticipantRefund,
        expected: RefundStatus,
    ) -> Result<bool, AppError>;

    /// Saves the completed ledger, marks the cart, its lines and payments
    /// REFUNDED and returns the items to stock unless that already happened,
    /// atomically and with the refund row locked.
    ///
    /// `None` when the stored status is no longer `expected`, otherwise
    /// whether this call restored the stock.
    async fn complete_order_refund(
        &self,
        refund: &OrderRefund,
        expected: RefundStatus,
    ) -> Result<Option<bool>, AppError>;
}

pub struct PgRefundStore {
    pool: PgPool,
}

impl PgRefundStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefundStore for PgRefundStore {
    async fn save_ledger(
        &self,
        kind: RefundKind,
        id: Uuid,
        expected: RefundStatus,
        ledger: &RefundLedger,
    ) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        Ok(refund_rows::save_ledger(kind, id, expected, ledger, &mut conn).await?)
    }

    async fn event_payment_status(
        &self,
        payment_id: Uuid,
    ) -> Result<Option<PaymentStatus>, AppError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM event_payments WHERE id = $1")
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await?;

        status
            .map(|s| PaymentStatus::try_from(s).map_err(AppError::InternalServerError))
            .transpose()
    }

    async fn complete_participant_refund(
        &self,
        refund: &ParticipantRefund,
        expected: RefundStatus,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let saved = refund_rows::save_ledger(
            RefundKind::Participant,
            refund.id,
            expected,
            &refund.ledger,
            &mut tx,
        )
        .await?;
        if !saved {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(payment_id) = refund.event_payment_id {
            EventPayment::update_status(payment_id, PaymentStatus::Refunded, &mut tx).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn complete_order_refund(
        &self,
        refund: &OrderRefund,
        expected: RefundStatus,
    ) -> Result<Option<bool>, AppError> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<bool> = sqlx::query_scalar(
            "SELECT stock_restored FROM order_refunds WHERE id = $1 AND status = $2 FOR UPDATE",
        )
        .bind(refund.id)
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(already_restored) = locked else {
            tx.rollback().await?;
            return Ok(None);
        };

        refund_rows::save_ledger(RefundKind::Order, refund.id, expected, &refund.ledger, &mut tx)
            .await?;
        EventCart::set_status(refund.cart_id, CartStatus::Refunded, OrderStatus::Refunded, &mut tx)
            .await?;
        sqlx::query("UPDATE product_payments SET status = $2, updated_at = NOW() WHERE cart_id = $1")
            .bind(refund.cart_id)
            .bind(PaymentStatus::Refunded.as_str())
            .execute(&mut *tx)
            .await?;

        if !already_restored {
            sqlx::query("UPDATE order_refunds SET stock_restored = TRUE WHERE id = $1")
                .bind(refund.id)
                .execute(&mut *tx)
                .await?;

            let lines = EventProductOrder::find_for_cart(refund.cart_id, &mut tx).await?;
            for line in &lines {
                match line.size_id {
                    Some(size_id) => {
                        stock::increment_in(size_id, line.quantity, &mut tx).await?;
                    }
                    None => {
                        stock::increment_product_in(line.product_id, line.quantity, &mut tx)
                            .await?
                    }
                }
            }
            tracing::info!(cart = %refund.cart_id, lines = lines.len(), "Stock restored");
        }

        tx.commit().await?;
        Ok(Some(!already_restored))
    }
}

/// Result of a processing attempt. Gateway failures are an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    GatewayRefundCreated { gateway_refund_id: String },
    AwaitingManualTransfer,
    GatewayFailed { reason: String },
}

fn stale_refund(reference: &str) -> AppError {
    AppError::Conflict(format!(
        "Refund {} was changed by another request, reload and try again",
        reference
    ))
}

/// Refuses a new refund while an earlier one for the same payment is still open.
pub fn ensure_no_active_refund<R: RefundRecord>(existing: Option<&R>) -> Result<(), RefundError> {
    match existing {
        Some(refund) if refund.ledger().status.is_active() => Err(
            RefundError::ActiveRefundExists(refund.reference().to_string()),
        ),
        _ => Ok(()),
    }
}

pub fn build_order_refund(
    cart: &EventCart,
    payment: Option<&ProductPayment>,
    event_code: &str,
    reason: OrderRefundReason,
    reason_details: Option<String>,
) -> Result<OrderRefund, RefundError> {
    let payment = payment.ok_or(RefundError::MissingPayment)?;
    if !matches!(payment.status, PaymentStatus::Pending | PaymentStatus::Succeeded) {
        return Err(RefundError::PaymentNotRefundable(payment.status));
    }

    let gateway_reference = payment
        .gateway_payment_reference
        .clone()
        .filter(|r| !r.trim().is_empty());
    let is_automatic = payment.method.supports_automatic_refunds() && gateway_reference.is_some();
    let ledger = RefundLedger::new(
        round_money(cart.total),
        payment.amount,
        payment.currency.clone(),
        gateway_reference,
        is_automatic,
    )?;

    let now = Utc::now();
    Ok(OrderRefund {
        id: Uuid::new_v4(),
        refund_reference: generate_reference("ORF", event_code),
        event_id: cart.event_id,
        cart_id: cart.id,
        payment_id: Some(payment.id),
        user_id: cart.user_id,
        refund_reason: reason,
        reason_details,
        stock_restored: false,
        ledger,
        created_at: now,
        updated_at: now,
    })
}

/// Refund for a participant's registration fee. `amount` defaults to the whole payment.
///
/// A payment left in REFUND_PROCESSING by a cancelled refund can be refunded again.
pub fn build_participant_refund(
    participant: &EventParticipant,
    payment: Option<&EventPayment>,
    event_code: &str,
    reason: ParticipantRefundReason,
    reason_details: Option<String>,
    amount: Option<Decimal>,
) -> Result<ParticipantRefund, RefundError> {
    let payment = payment.ok_or(RefundError::MissingPayment)?;
    if !matches!(
        payment.status,
        PaymentStatus::Pending | PaymentStatus::Succeeded | PaymentStatus::RefundProcessing
    ) {
        return Err(RefundError::PaymentNotRefundable(payment.status));
    }

    let gateway_reference = payment
        .gateway_payment_reference
        .clone()
        .filter(|r| !r.trim().is_empty());
    let is_automatic = payment.method.supports_automatic_refunds() && gateway_reference.is_some();
    let ledger = RefundLedger::new(
        round_money(amount.unwrap_or(payment.amount)),
        payment.amount,
        payment.currency.clone(),
        gateway_reference,
        is_automatic,
    )?;

    let now = Utc::now();
    Ok(ParticipantRefund {
        id: Uuid::new_v4(),
        refund_reference: generate_reference("PRF", event_code),
        event_id: participant.event_id,
        participant_id: participant.id,
        event_payment_id: Some(payment.id),
        refund_reason: reason,
        reason_details,
        ledger,
        created_at: now,
        updated_at: now,
    })
}

/// Records a gateway status push on the refund. Returns true if the status changed.
pub fn apply_gateway_update<R: RefundRecord>(
    refund: &mut R,
    update: &GatewayRefundUpdate,
) -> Result<bool, RefundError> {
    let reference = refund.reference().to_string();
    let ledger = refund.ledger_mut();
    ledger.gateway_refund_status = Some(update.state.as_str().to_string());

    match update.state {
        GatewayRefundState::Failed | GatewayRefundState::Canceled
            if matches!(ledger.status, RefundStatus::Pending | RefundStatus::InProgress) =>
        {
            let reason = update
                .failure_reason
                .clone()
                .unwrap_or_else(|| "Refund failed at the gateway".to_string());
            ledger.mark_failed(reason)?;
            tracing::warn!(refund = %reference, "Gateway reported refund failure");
            Ok(true)
        }
        GatewayRefundState::Succeeded => {
            tracing::info!(refund = %reference, "Gateway confirmed refund, awaiting verification");
            Ok(false)
        }
        _ => Ok(false),
    }
}

pub struct RefundService {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn RefundStore>,
}

impl RefundService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, store: Arc<dyn RefundStore>) -> Self {
        Self { gateway, store }
    }

    async fn persist<R: RefundRecord + Sync>(
        &self,
        refund: &R,
        expected: RefundStatus,
    ) -> Result<(), AppError> {
        let saved = self
            .store
            .save_ledger(refund.kind(), refund.id(), expected, refund.ledger())
            .await?;
        if saved {
            Ok(())
        } else {
            tracing::warn!(refund = %refund.reference(), expected = %expected, "Refund changed concurrently");
            Err(stale_refund(refund.reference()))
        }
    }

    /// Claims the refund, then sends it to the gateway. On success the refund
    /// stays IN_PROGRESS until an admin confirms it.
    pub async fn process_automatic<R: RefundRecord + Send + Sync>(
        &self,
        refund: &mut R,
    ) -> Result<ProcessOutcome, AppError> {
        let ledger = refund.ledger();
        ledger.check_transition(RefundStatus::InProgress)?;
        if !ledger.is_automatic_refund {
            return Err(RefundError::NotAutomatic.into());
        }
        let payment_reference = ledger
            .gateway_payment_reference
            .clone()
            .filter(|r| !r.trim().is_empty())
            .ok_or(RefundError::MissingPaymentReference)?;
        let expected = ledger.status;

        refund.ledger_mut().begin_processing()?;
        self.persist(refund, expected).await?;

        let ledger = refund.ledger();
        let request = GatewayRefundRequest {
            payment_reference,
            amount: ledger.refund_amount,
            currency: ledger.currency.to_lowercase(),
            reason: refund.gateway_reason(),
            metadata: refund.gateway_metadata(),
            idempotency_key: format!("refund-{}-{}", refund.id(), ledger.processing_attempts),
        };
        let reference = refund.reference().to_string();
        tracing::info!(refund = %reference, amount = %request.amount, "Processing automatic refund");

        let outcome = match self.gateway.create_refund(&request).await {
            Ok(created) => {
                let ledger = refund.ledger_mut();
                ledger.gateway_refund_id = Some(created.refund_id.clone());
                ledger.gateway_refund_status = Some(created.status);
                ledger.refund_method = Some(self.gateway.name().to_string());
                tracing::info!(refund = %reference, gateway_refund = %created.refund_id, "Gateway refund created");
                ProcessOutcome::GatewayRefundCreated {
                    gateway_refund_id: created.refund_id,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                refund.ledger_mut().mark_failed(reason.clone())?;
                tracing::error!(refund = %reference, error = %reason, "Gateway refund failed");
                ProcessOutcome::GatewayFailed { reason }
            }
        };

        if let Err(e) = self.persist(refund, RefundStatus::InProgress).await {
            tracing::error!(refund = %reference, outcome = ?outcome, "Gateway outcome could not be recorded");
            return Err(e);
        }
        Ok(outcome)
    }

    /// Starts a manual refund. An automatic refund processed this way becomes manual.
    pub async fn process_manual<R: RefundRecord + Send + Sync>(
        &self,
        refund: &mut R,
        notes: Option<&str>,
        method: Option<&str>,
    ) -> Result<ProcessOutcome, AppError> {
        let reference = refund.reference().to_string();
        let expected = refund.ledger().status;
        let ledger = refund.ledger_mut();
        ledger.begin_processing()?;

        if ledger.is_automatic_refund {
            ledger.is_automatic_refund = false;
            tracing::info!(refund = %reference, "Falling back to manual refund");
        }
        if let Some(notes) = notes.filter(|n| !n.trim().is_empty()) {
            ledger.append_notes(notes);
        }
        ledger.refund_method = Some(
            method
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(DEFAULT_MANUAL_METHOD)
                .to_string(),
        );
        let amount = ledger.refund_amount;

        self.persist(refund, expected).await?;
        tracing::info!(refund = %reference, amount = %amount, "Manual refund in progress");
        Ok(ProcessOutcome::AwaitingManualTransfer)
    }

    /// Processes the refund the way its flag says.
    pub async fn process<R: RefundRecord + Send + Sync>(
        &self,
        refund: &mut R,
        notes: Option<&str>,
        method: Option<&str>,
    ) -> Result<ProcessOutcome, AppError> {
        if refund.ledger().is_automatic_refund {
            self.process_automatic(refund).await
        } else {
            self.process_manual(refund, notes, method).await
        }
    }

    /// Processes by hand when `manual` is set, otherwise as the refund's flag says.
    pub async fn process_as<R: RefundRecord + Send + Sync>(
        &self,
        refund: &mut R,
        notes: Option<&str>,
        method: Option<&str>,
        manual: bool,
    ) -> Result<ProcessOutcome, AppError> {
        if manual {
            self.process_manual(refund, notes, method).await
        } else {
            self.process(refund, notes, method).await
        }
    }

    /// FAILED -> PENDING, then processed again.
    pub async fn retry<R: RefundRecord + Send + Sync>(
        &self,
        refund: &mut R,
    ) -> Result<ProcessOutcome, AppError> {
        let expected = refund.ledger().status;
        refund.ledger_mut().reset_for_retry()?;
        self.persist(refund, expected).await?;

        tracing::info!(refund = %refund.reference(), "Retrying refund");
        self.process(refund, None, None).await
    }

    pub async fn cancel<R: RefundRecord + Send + Sync>(
        &self,
        refund: &mut R,
        reason: Option<&str>,
    ) -> Result<(), AppError> {
        let expected = refund.ledger().status;
        refund.ledger_mut().cancel(reason)?;
        self.persist(refund, expected).await?;

        tracing::info!(refund = %refund.reference(), "Refund cancelled");
        Ok(())
    }

    /// Registration refunds are only paid out while their payment is REFUND_PROCESSING.
    async fn ensure_payment_awaiting_refund(
        &self,
        refund: &ParticipantRefund,
    ) -> Result<(), AppError> {
        let payment_id = refund.event_payment_id.ok_or(RefundError::MissingPayment)?;
        match self.store.event_payment_status(payment_id).await? {
            Some(PaymentStatus::RefundProcessing) => Ok(()),
            Some(status) => Err(RefundError::PaymentNotRefundable(status).into()),
            None => Err(RefundError::MissingPayment.into()),
        }
    }

    pub async fn process_participant_refund(
        &self,
        refund: &mut ParticipantRefund,
        notes: Option<&str>,
        method: Option<&str>,
        manual: bool,
    ) -> Result<ProcessOutcome, AppError> {
        self.ensure_payment_awaiting_refund(refund).await?;
        self.process_as(refund, notes, method, manual).await
    }

    pub async fn retry_participant_refund(
        &self,
        refund: &mut ParticipantRefund,
    ) -> Result<ProcessOutcome, AppError> {
        self.ensure_payment_awaiting_refund(refund).await?;
        self.retry(refund).await
    }

    pub async fn complete_participant_refund(
        &self,
        refund: &mut ParticipantRefund,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let expected = refund.ledger.status;
        refund.ledger.complete(notes, now)?;
        if !self.store.complete_participant_refund(refund, expected).await? {
            return Err(stale_refund(&refund.refund_reference));
        }

        tracing::info!(
            refund = %refund.refund_reference,
            amount = %refund.ledger.refund_amount,
            "Participant refund completed"
        );
        Ok(())
    }

    /// Completes the refund and puts the order's items back in stock, at most once.
    pub async fn complete_order_refund(
        &self,
        refund: &mut OrderRefund,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let expected = refund.ledger.status;
        refund.ledger.complete(notes, now)?;
        let Some(restored) = self.store.complete_order_refund(refund, expected).await? else {
            return Err(stale_refund(&refund.refund_reference));
        };
        refund.stock_restored = true;

        tracing::info!(
            refund = %refund.refund_reference,
            amount = %refund.ledger.refund_amount,
            stock_restored = restored,
            "Order refund completed"
        );
        Ok(())
    }

    /// Applies a gateway status push and saves it. Returns true if the status changed.
    pub async fn reconcile<R: RefundRecord + Send + Sync>(
        &self,
        refund: &mut R,
        update: &GatewayRefundUpdate,
    ) -> Result<bool, AppError> {
        let expected = refund.ledger().status;
        let changed = apply_gateway_update(refund, update)?;
        self.persist(refund, expected).await?;
        Ok(changed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundStatistics {
    pub total_refunds: usize,
    pub total_amount: Decimal,
    pub average_amount: Decimal,
    pub status_breakdown: BTreeMap<&'static str, usize>,
    pub reason_breakdown: BTreeMap<&'static str, usize>,
    pub automatic_refunds: usize,
    pub manual_refunds: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_restored_count: Option<usize>,
}

impl RefundStatistics {
    /// Zero-amount refunds are left out.
    pub fn collect<R: RefundRecord>(refunds: &[R]) -> Self {
        let counted: Vec<&R> = refunds
            .iter()
            .filter(|r| r.ledger().refund_amount > Decimal::ZERO)
            .collect();

        let mut status_breakdown: BTreeMap<&'static str, usize> =
            RefundStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        let mut reason_breakdown: BTreeMap<&'static str, usize> = BTreeMap::new();
        for refund in &counted {
            *status_breakdown.entry(refund.ledger().status.as_str()).or_default() += 1;
            *reason_breakdown.entry(refund.reason_code()).or_default() += 1;
        }

        let total_amount: Decimal = counted.iter().map(|r| r.ledger().refund_amount).sum();
        let average_amount = if counted.is_empty() {
            Decimal::ZERO
        } else {
            round_money(total_amount / Decimal::from(counted.len()))
        };
        let automatic_refunds = counted
            .iter()
            .filter(|r| r.ledger().is_automatic_refund)
            .count();

        Self {
            total_refunds: counted.len(),
            total_amount,
            average_amount,
            status_breakdown,
            reason_breakdown,
            automatic_refunds,
            manual_refunds: counted.len() - automatic_refunds,
            stock_restored_count: None,
        }
    }

    pub fn for_orders(refunds: &[OrderRefund]) -> Self {
        let mut stats = Self::collect(refunds);
        stats.stock_restored_count = Some(
            refunds
                .iter()
                .filter(|r| r.ledger.refund_amount > Decimal::ZERO && r.stock_restored)
                .count(),
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayError, GatewayRefund};
    use crate::models::participant::ParticipantStatus;
    use crate::models::payment::PaymentMethod;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeGateway {
        result: Result<GatewayRefund, GatewayError>,
        requests: Mutex<Vec<GatewayRefundRequest>>,
    }

    impl FakeGateway {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                result: Ok(GatewayRefund {
                    refund_id: "re_123".to_string(),
                    status: "pending".to_string(),
                }),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                result: Err(GatewayError::Declined("card_declined".to_string())),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last_request(&self) -> GatewayRefundRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        fn name(&self) -> &'static str {
            "Stripe"
        }

        async fn create_refund(
            &self,
            request: &GatewayRefundRequest,
        ) -> Result<GatewayRefund, GatewayError> {
            self.requests.lock().unwrap().push(request.clone());
            self.result.clone()
        }
    }

    /// Refund rows by status, stock by size and the effects of completion.
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<HashMap<Uuid, RefundStatus>>,
        stock: Mutex<HashMap<Uuid, i32>>,
        lines: Mutex<HashMap<Uuid, Vec<(Uuid, i32)>>>,
        restored: Mutex<Vec<Uuid>>,
        payments: Mutex<HashMap<Uuid, PaymentStatus>>,
        refunded_carts: Mutex<Vec<Uuid>>,
    }

    impl MemoryStore {
        fn with_cart(cart_id: Uuid, size_id: Uuid, available: i32, quantity: i32) -> Arc<Self> {
            let store = Self::default();
            store.stock.lock().unwrap().insert(size_id, available);
            store
                .lines
                .lock()
                .unwrap()
                .insert(cart_id, vec![(size_id, quantity)]);
            Arc::new(store)
        }

        fn track<R: RefundRecord>(&self, refund: &R) {
            self.rows
                .lock()
                .unwrap()
                .insert(refund.id(), refund.ledger().status);
        }

        fn status_of(&self, id: Uuid) -> RefundStatus {
            self.rows.lock().unwrap()[&id]
        }

        fn stock_of(&self, size_id: Uuid) -> i32 {
            self.stock.lock().unwrap()[&size_id]
        }

        fn payment_status(&self, id: Uuid) -> Option<PaymentStatus> {
            self.payments.lock().unwrap().get(&id).copied()
        }

        fn compare_and_set(&self, id: Uuid, expected: RefundStatus, next: RefundStatus) -> bool {
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(&id) {
                Some(status) if *status == expected => {
                    *status = next;
                    true
                }
                _ => false,
            }
        }
    }

    #[async_trait]
    impl RefundStore for MemoryStore {
        async fn save_ledger(
            &self,
            _kind: RefundKind,
            id: Uuid,
            expected: RefundStatus,
            ledger: &RefundLedger,
        ) -> Result<bool, AppError> {
            Ok(self.compare_and_set(id, expected, ledger.status))
        }

        async fn event_payment_status(
            &self,
            payment_id: Uuid,
        ) -> Result<Option<PaymentStatus>, AppError> {
            Ok(self.payment_status(payment_id))
        }

        async fn complete_participant_refund(
            &self,
            refund: &ParticipantRefund,
            expected: RefundStatus,
        ) -> Result<bool, AppError> {
            if !self.compare_and_set(refund.id, expected, refund.ledger.status) {
                return Ok(false);
            }
            if let Some(payment_id) = refund.event_payment_id {
                self.payments
                    .lock()
                    .unwrap()
                    .insert(payment_id, PaymentStatus::Refunded);
            }
            Ok(true)
        }

        async fn complete_order_refund(
            &self,
            refund: &OrderRefund,
            expected: RefundStatus,
        ) -> Result<Option<bool>, AppError> {
            if !self.compare_and_set(refund.id, expected, refund.ledger.status) {
                return Ok(None);
            }
            self.refunded_carts.lock().unwrap().push(refund.cart_id);

            let mut restored = self.restored.lock().unwrap();
            if restored.contains(&refund.id) {
                return Ok(Some(false));
            }
            restored.push(refund.id);

            let lines = self.lines.lock().unwrap();
            let mut stock = self.stock.lock().unwrap();
            for (size_id, quantity) in lines.get(&refund.cart_id).into_iter().flatten() {
                *stock.entry(*size_id).or_default() += quantity;
            }
            Ok(Some(true))
        }
    }

    fn service(gateway: Arc<FakeGateway>, store: Arc<MemoryStore>) -> RefundService {
        RefundService::new(gateway, store)
    }

    fn cart(total: Decimal) -> EventCart {
        EventCart {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            order_reference: "ORD-1001".to_string(),
            total,
            shipping_cost: Decimal::ZERO,
            status: CartStatus::Approved,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn product_payment(cart: &EventCart, method: PaymentMethod, reference: Option<&str>) -> ProductPayment {
        ProductPayment {
            id: Uuid::new_v4(),
            cart_id: cart.id,
            user_id: cart.user_id,
            payment_reference: "PAY-1".to_string(),
            method,
            amount: cart.total,
            currency: "GBP".to_string(),
            status: PaymentStatus::Succeeded,
            gateway_payment_reference: reference.map(str::to_string),
            bank_reference: None,
            paid_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn order_refund(method: PaymentMethod, reference: Option<&str>) -> OrderRefund {
        let cart = cart(Decimal::from(30));
        let payment = product_payment(&cart, method, reference);
        build_order_refund(
            &cart,
            Some(&payment),
            "camp24",
            OrderRefundReason::CustomerRequested,
            None,
        )
        .unwrap()
    }

    /// An order refund already stored, as a handler would load it.
    fn stored_order_refund(
        store: &MemoryStore,
        method: PaymentMethod,
        reference: Option<&str>,
    ) -> OrderRefund {
        let refund = order_refund(method, reference);
        store.track(&refund);
        refund
    }

    fn participant() -> EventParticipant {
        EventParticipant {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: ParticipantStatus::Confirmed,
            total_paid: Decimal::from(120),
            total_outstanding: Decimal::ZERO,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn event_payment(participant: &EventParticipant, status: PaymentStatus) -> EventPayment {
        EventPayment {
            id: Uuid::new_v4(),
            participant_id: participant.id,
            event_id: participant.event_id,
            package_id: None,
            method: PaymentMethod::Stripe,
            amount: Decimal::from(120),
            currency: "GBP".to_string(),
            status,
            gateway_payment_reference: Some("pi_9".to_string()),
            bank_reference: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn participant_refund(payment: &EventPayment, amount: Option<Decimal>) -> ParticipantRefund {
        build_participant_refund(
            &participant(),
            Some(payment),
            "CAMP24",
            ParticipantRefundReason::UserRequested,
            None,
            amount,
        )
        .unwrap()
    }

    #[test]
    fn test_order_refund_initiation() {
        let refund = order_refund(PaymentMethod::Stripe, Some("pi_1"));
        assert!(refund.refund_reference.starts_with("ORF-CAMP24-"));
        assert!(refund.ledger.is_automatic_refund);
        assert_eq!(refund.ledger.status, RefundStatus::Pending);
        assert_eq!(refund.ledger.refund_amount, Decimal::from(30));

        let manual = order_refund(PaymentMethod::BankTransfer, Some("pi_1"));
        assert!(!manual.ledger.is_automatic_refund);
        let no_reference = order_refund(PaymentMethod::Stripe, None);
        assert!(!no_reference.ledger.is_automatic_refund);
    }

    #[test]
    fn test_initiation_requires_refundable_payment() {
        let cart = cart(Decimal::from(30));
        assert_eq!(
            build_order_refund(&cart, None, "CAMP24", OrderRefundReason::Other, None).unwrap_err(),
            RefundError::MissingPayment
        );

        let mut payment = product_payment(&cart, PaymentMethod::Stripe, Some("pi_1"));
        payment.status = PaymentStatus::Refunded;
        assert_eq!(
            build_order_refund(&cart, Some(&payment), "CAMP24", OrderRefundReason::Other, None)
                .unwrap_err(),
            RefundError::PaymentNotRefundable(PaymentStatus::Refunded)
        );
    }

    #[test]
    fn test_partial_participant_refund_bounded_by_payment() {
        let participant = participant();
        let payment = event_payment(&participant, PaymentStatus::Succeeded);

        let refund = participant_refund(&payment, Some(Decimal::from(60)));
        assert!(refund.refund_reference.starts_with("PRF-CAMP24-"));
        assert_eq!(refund.ledger.refund_amount, Decimal::from(60));
        assert_eq!(refund.ledger.original_amount, Decimal::from(120));

        let too_much = build_participant_refund(
            &participant,
            Some(&payment),
            "CAMP24",
            ParticipantRefundReason::UserRequested,
            None,
            Some(Decimal::from(121)),
        );
        assert!(matches!(too_much, Err(RefundError::AmountExceedsPayment { .. })));
    }

    #[test]
    fn test_partial_amount_rounded_to_pence() {
        let payment = event_payment(&participant(), PaymentStatus::Succeeded);
        let refund = participant_refund(&payment, Some(Decimal::new(9995, 3)));
        assert_eq!(refund.ledger.refund_amount, Decimal::new(1000, 2));
        assert_eq!(refund.ledger.refund_amount.scale(), 2);
    }

    #[tokio::test]
    async fn test_gateway_failure_marks_refund_failed_without_touching_stock() {
        let size_id = Uuid::new_v4();
        let refund = order_refund(PaymentMethod::Stripe, Some("pi_1"));
        let store = MemoryStore::with_cart(refund.cart_id, size_id, 4, 2);
        store.track(&refund);
        let mut refund = refund;
        let gateway = FakeGateway::failing();
        let service = service(gateway.clone(), store.clone());

        let outcome = service.process(&mut refund, None, None).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::GatewayFailed { .. }));
        assert_eq!(refund.ledger.status, RefundStatus::Failed);
        assert_eq!(store.status_of(refund.id), RefundStatus::Failed);
        assert_eq!(refund.ledger.refund_amount, Decimal::from(30));
        assert!(refund
            .ledger
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("card_declined")));
        assert!(!refund.stock_restored);
        assert_eq!(store.stock_of(size_id), 4);
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_processing_calls_gateway_once() {
        let store = Arc::new(MemoryStore::default());
        let gateway = FakeGateway::succeeding();
        let service = service(gateway.clone(), store.clone());
        let mut first = stored_order_refund(&store, PaymentMethod::Stripe, Some("pi_1"));
        let mut second = first.clone();

        service.process(&mut first, None, None).await.unwrap();
        let err = service.process(&mut second, None, None).await.unwrap_err();

        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(gateway.calls(), 1);
        assert_eq!(store.status_of(first.id), RefundStatus::InProgress);
    }

    #[tokio::test]
    async fn test_refund_claimed_before_gateway_call() {
        let store = Arc::new(MemoryStore::default());
        let gateway = FakeGateway::failing();
        let service = service(gateway.clone(), store.clone());
        let mut refund = stored_order_refund(&store, PaymentMethod::Stripe, Some("pi_1"));
        store.rows.lock().unwrap().insert(refund.id, RefundStatus::Cancelled);

        let err = service.process(&mut refund, None, None).await.unwrap_err();

        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(gateway.calls(), 0);
        assert_eq!(store.status_of(refund.id), RefundStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_idempotency_key_changes_per_attempt() {
        let store = Arc::new(MemoryStore::default());
        let gateway = FakeGateway::failing();
        let service = service(gateway.clone(), store.clone());
        let mut refund = stored_order_refund(&store, PaymentMethod::Stripe, Some("pi_1"));

        service.process(&mut refund, None, None).await.unwrap();
        assert_eq!(
            gateway.last_request().idempotency_key,
            format!("refund-{}-1", refund.id)
        );

        service.retry(&mut refund).await.unwrap();
        assert_eq!(
            gateway.last_request().idempotency_key,
            format!("refund-{}-2", refund.id)
        );
    }

    #[tokio::test]
    async fn test_automatic_refund_success_then_completion_restores_stock_once() {
        let size_id = Uuid::new_v4();
        let refund = order_refund(PaymentMethod::Stripe, Some("pi_1"));
        let store = MemoryStore::with_cart(refund.cart_id, size_id, 4, 2);
        store.track(&refund);
        let mut refund = refund;
        let gateway = FakeGateway::succeeding();
        let service = service(gateway.clone(), store.clone());

        let outcome = service.process(&mut refund, None, None).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::GatewayRefundCreated {
                gateway_refund_id: "re_123".to_string()
            }
        );
        assert_eq!(refund.ledger.status, RefundStatus::InProgress);
        assert_eq!(refund.ledger.refund_method.as_deref(), Some("Stripe"));

        let request = gateway.last_request();
        assert_eq!(request.payment_reference, "pi_1");
        assert_eq!(request.currency, "gbp");

        let mut duplicate = refund.clone();
        service
            .complete_order_refund(&mut refund, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(store.status_of(refund.id), RefundStatus::Processed);
        assert!(refund.stock_restored);
        assert_eq!(store.stock_of(size_id), 6);
        assert_eq!(store.refunded_carts.lock().unwrap().as_slice(), &[refund.cart_id]);

        let err = service
            .complete_order_refund(&mut duplicate, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(matches!(
            service.complete_order_refund(&mut refund, None, Utc::now()).await,
            Err(AppError::Conflict(_))
        ));
        assert_eq!(store.stock_of(size_id), 6);
        assert_eq!(store.refunded_carts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_after_concurrent_cancel_has_no_side_effects() {
        let size_id = Uuid::new_v4();
        let refund = order_refund(PaymentMethod::BankTransfer, None);
        let store = MemoryStore::with_cart(refund.cart_id, size_id, 4, 2);
        store.track(&refund);
        let mut refund = refund;
        let service = service(FakeGateway::succeeding(), store.clone());
        service
            .process(&mut refund, Some("Transfer queued"), None)
            .await
            .unwrap();

        let mut completing = refund.clone();
        service.cancel(&mut refund, Some("Customer kept the hoodie")).await.unwrap();
        let err = service
            .complete_order_refund(&mut completing, None, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(store.status_of(refund.id), RefundStatus::Cancelled);
        assert!(store.refunded_carts.lock().unwrap().is_empty());
        assert_eq!(store.stock_of(size_id), 4);
    }

    #[tokio::test]
    async fn test_processed_refund_cannot_be_processed_again() {
        let store = Arc::new(MemoryStore::default());
        let service = service(FakeGateway::succeeding(), store.clone());
        let mut refund = stored_order_refund(&store, PaymentMethod::Stripe, Some("pi_1"));
        service.process(&mut refund, None, None).await.unwrap();
        service
            .complete_order_refund(&mut refund, None, Utc::now())
            .await
            .unwrap();

        assert!(matches!(
            service.process(&mut refund, None, None).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            service.cancel(&mut refund, Some("late")).await,
            Err(AppError::Conflict(_))
        ));
        assert_eq!(store.status_of(refund.id), RefundStatus::Processed);
    }

    #[tokio::test]
    async fn test_retry_resets_and_reprocesses() {
        let store = Arc::new(MemoryStore::default());
        let mut refund = stored_order_refund(&store, PaymentMethod::Stripe, Some("pi_1"));
        let failing = service(FakeGateway::failing(), store.clone());
        failing.process(&mut refund, None, None).await.unwrap();
        assert_eq!(refund.ledger.status, RefundStatus::Failed);

        let gateway = FakeGateway::succeeding();
        let working = service(gateway.clone(), store.clone());
        let outcome = working.retry(&mut refund).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::GatewayRefundCreated { .. }));
        assert_eq!(refund.ledger.status, RefundStatus::InProgress);
        assert_eq!(store.status_of(refund.id), RefundStatus::InProgress);
        assert!(refund.ledger.failure_reason.is_none());
        assert_eq!(refund.ledger.gateway_refund_id.as_deref(), Some("re_123"));

        assert!(matches!(
            working.retry(&mut refund).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_refund_needs_notes_to_complete() {
        let store = Arc::new(MemoryStore::default());
        let gateway = FakeGateway::succeeding();
        let service = service(gateway.clone(), store.clone());
        let mut refund = stored_order_refund(&store, PaymentMethod::BankTransfer, None);

        let outcome = service.process(&mut refund, None, None).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::AwaitingManualTransfer);
        assert_eq!(refund.ledger.refund_method.as_deref(), Some("Bank Transfer"));
        assert_eq!(gateway.calls(), 0);

        let err = service
            .complete_order_refund(&mut refund, Some("  "), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        assert_eq!(refund.ledger.status, RefundStatus::InProgress);

        service
            .complete_order_refund(&mut refund, Some("Sent by BACS, ref 4471"), Utc::now())
            .await
            .unwrap();
        assert_eq!(refund.ledger.status, RefundStatus::Processed);
        assert!(refund.ledger.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_automatic_refund_can_fall_back_to_manual() {
        let store = Arc::new(MemoryStore::default());
        let gateway = FakeGateway::succeeding();
        let service = service(gateway.clone(), store.clone());
        let mut refund = stored_order_refund(&store, PaymentMethod::Stripe, Some("pi_1"));

        service
            .process_as(&mut refund, Some("Card expired, paying by transfer"), None, true)
            .await
            .unwrap();

        assert!(!refund.ledger.is_automatic_refund);
        assert_eq!(gateway.calls(), 0);
        service
            .complete_order_refund(&mut refund, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(refund.ledger.status, RefundStatus::Processed);
    }

    #[tokio::test]
    async fn test_manual_refund_rejected_by_automatic_path() {
        let store = Arc::new(MemoryStore::default());
        let service = service(FakeGateway::succeeding(), store.clone());
        let mut refund = stored_order_refund(&store, PaymentMethod::Cash, None);
        assert!(matches!(
            service.process_automatic(&mut refund).await,
            Err(AppError::ValidationError(_))
        ));
        assert_eq!(refund.ledger.status, RefundStatus::Pending);
        assert_eq!(store.status_of(refund.id), RefundStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_refund_allows_a_new_one() {
        let store = Arc::new(MemoryStore::default());
        let service = service(FakeGateway::failing(), store.clone());
        let mut refund = stored_order_refund(&store, PaymentMethod::Stripe, Some("pi_1"));

        assert_eq!(
            ensure_no_active_refund(Some(&refund)),
            Err(RefundError::ActiveRefundExists(refund.refund_reference.clone()))
        );

        service.process(&mut refund, None, None).await.unwrap();
        assert!(ensure_no_active_refund(Some(&refund)).is_err());
        service.cancel(&mut refund, Some("Abandoned")).await.unwrap();
        assert_eq!(ensure_no_active_refund(Some(&refund)), Ok(()));
        assert_eq!(ensure_no_active_refund::<OrderRefund>(None), Ok(()));

        let mut cart = cart(Decimal::from(30));
        cart.status = CartStatus::PendingRefund;
        let payment = product_payment(&cart, PaymentMethod::Stripe, Some("pi_1"));
        assert!(build_order_refund(&cart, Some(&payment), "CAMP24", OrderRefundReason::Other, None).is_ok());

        let participant = participant();
        let left_processing = event_payment(&participant, PaymentStatus::RefundProcessing);
        assert!(build_participant_refund(
            &participant,
            Some(&left_processing),
            "CAMP24",
            ParticipantRefundReason::UserRequested,
            None,
            None,
        )
        .is_ok());
    }

    #[tokio::test]
    async fn test_participant_processing_requires_refund_processing_payment() {
        let store = Arc::new(MemoryStore::default());
        let gateway = FakeGateway::succeeding();
        let service = service(gateway.clone(), store.clone());
        let payment = event_payment(&participant(), PaymentStatus::Succeeded);
        let mut refund = participant_refund(&payment, None);
        store.track(&refund);

        store.payments.lock().unwrap().insert(payment.id, PaymentStatus::Succeeded);
        assert!(matches!(
            service.process_participant_refund(&mut refund, None, None, false).await,
            Err(AppError::ValidationError(_))
        ));
        assert_eq!(gateway.calls(), 0);
        assert_eq!(store.status_of(refund.id), RefundStatus::Pending);

        store
            .payments
            .lock()
            .unwrap()
            .insert(payment.id, PaymentStatus::RefundProcessing);
        let outcome = service
            .process_participant_refund(&mut refund, None, None, false)
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::GatewayRefundCreated { .. }));
        assert_eq!(gateway.calls(), 1);
    }

    #[test]
    fn test_webhook_failure_moves_refund_to_failed() {
        let mut refund = order_refund(PaymentMethod::Stripe, Some("pi_1"));
        refund.ledger.begin_processing().unwrap();
        refund.ledger.gateway_refund_id = Some("re_1".to_string());

        let succeeded = GatewayRefundUpdate {
            refund_id: "re_1".to_string(),
            state: GatewayRefundState::Succeeded,
            failure_reason: None,
        };
        assert!(!apply_gateway_update(&mut refund, &succeeded).unwrap());
        assert_eq!(refund.ledger.status, RefundStatus::InProgress);
        assert_eq!(refund.ledger.gateway_refund_status.as_deref(), Some("succeeded"));

        let failed = GatewayRefundUpdate {
            refund_id: "re_1".to_string(),
            state: GatewayRefundState::Failed,
            failure_reason: Some("lost_or_stolen_card".to_string()),
        };
        assert!(apply_gateway_update(&mut refund, &failed).unwrap());
        assert_eq!(refund.ledger.status, RefundStatus::Failed);
        assert_eq!(refund.ledger.failure_reason.as_deref(), Some("lost_or_stolen_card"));
    }

    #[tokio::test]
    async fn test_participant_completion_marks_payment_refunded() {
        let store = Arc::new(MemoryStore::default());
        let service = service(FakeGateway::succeeding(), store.clone());
        let payment_id = Uuid::new_v4();
        let mut refund = ParticipantRefund {
            id: Uuid::new_v4(),
            refund_reference: "PRF-CAMP24-00000001".to_string(),
            event_id: Uuid::new_v4(),
            participant_id: Uuid::new_v4(),
            event_payment_id: Some(payment_id),
            refund_reason: ParticipantRefundReason::EventCancelled,
            reason_details: None,
            ledger: RefundLedger::new(
                Decimal::from(80),
                Decimal::from(80),
                "GBP",
                None,
                false,
            )
            .unwrap(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.track(&refund);
        store
            .payments
            .lock()
            .unwrap()
            .insert(payment_id, PaymentStatus::RefundProcessing);

        service
            .process_participant_refund(&mut refund, Some("Refunded at desk"), Some("Cash"), false)
            .await
            .unwrap();
        service
            .complete_participant_refund(&mut refund, None, Utc::now())
            .await
            .unwrap();

        assert_eq!(refund.ledger.status, RefundStatus::Processed);
        assert_eq!(refund.ledger.refund_method.as_deref(), Some("Cash"));
        assert_eq!(store.payment_status(payment_id), Some(PaymentStatus::Refunded));
    }

    #[test]
    fn test_statistics_skip_zero_amounts() {
        let mut processed = order_refund(PaymentMethod::Stripe, Some("pi_1"));
        processed.ledger.status = RefundStatus::Processed;
        processed.stock_restored = true;
        let mut pending = order_refund(PaymentMethod::BankTransfer, None);
        pending.refund_reason = OrderRefundReason::WrongSize;
        let mut zero = order_refund(PaymentMethod::BankTransfer, None);
        zero.ledger.refund_amount = Decimal::ZERO;

        let stats = RefundStatistics::for_orders(&[processed, pending, zero]);

        assert_eq!(stats.total_refunds, 2);
        assert_eq!(stats.total_amount, Decimal::from(60));
        assert_eq!(stats.average_amount, Decimal::from(30));
        assert_eq!(stats.automatic_refunds, 1);
        assert_eq!(stats.manual_refunds, 1);
        assert_eq!(stats.status_breakdown["PROCESSED"], 1);
        assert_eq!(stats.status_breakdown["PENDING"], 1);
        assert_eq!(stats.status_breakdown["FAILED"], 0);
        assert_eq!(stats.reason_breakdown["CUSTOMER_REQUESTED"], 1);
        assert_eq!(stats.reason_breakdown["WRONG_SIZE"], 1);
        assert_eq!(stats.reason_breakdown.len(), 2);
        assert_eq!(stats.stock_restored_count, Some(1));
    }
}
