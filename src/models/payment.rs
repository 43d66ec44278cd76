use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

text_enum! {
    pub enum PaymentStatus {
        Pending => "PENDING",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        RefundProcessing => "REFUND_PROCESSING",
        Refunded => "REFUNDED",
    }
}

text_enum! {
    pub enum PaymentMethod {
        Stripe => "STRIPE",
        BankTransfer => "BANK",
        Cash => "CASH",
        PayPal => "PAYPAL",
        Other => "OTHER",
    }
}

impl PaymentMethod {
    /// Only card payments taken through the gateway can be refunded by it.
    pub fn supports_automatic_refunds(&self) -> bool {
        matches!(self, PaymentMethod::Stripe)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PaymentMethod::Stripe => "Stripe",
            PaymentMethod::BankTransfer => "Bank Transfer",
            PaymentMethod::Cash => "Cash / In-Person",
            PaymentMethod::PayPal => "PayPal",
            PaymentMethod::Other => "Other",
        }
    }
}

/// Registration fee payment made by a participant.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventPayment {
    pub id: Uuid,
    pub participant_id: Uuid,
    pub event_id: Uuid,
    pub package_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub gateway_payment_reference: Option<String>,
    pub bank_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventPayment {
    /// Most recent payment for a participant.
    pub async fn find_latest_for_participant(
        participant_id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM event_payments WHERE participant_id = $1
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(participant_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn update_status(
        id: Uuid,
        status: PaymentStatus,
        conn: &mut PgConnection,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE event_payments SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(conn)
            .await?;
        Ok(())
    }
}

/// Payment for a merchandise cart.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductPayment {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub user_id: Uuid,
    pub payment_reference: String,
    #[sqlx(try_from = "String")]
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub gateway_payment_reference: Option<String>,
    pub bank_reference: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductPayment {
    pub async fn find_for_cart(cart_id: Uuid, pool: &PgPool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM product_payments WHERE cart_id = $1 ORDER BY created_at LIMIT 1",
        )
        .bind(cart_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn update_status(
        id: Uuid,
        status: PaymentStatus,
        conn: &mut PgConnection,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE product_payments SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(conn)
            .await?;
        Ok(())
    }
}
