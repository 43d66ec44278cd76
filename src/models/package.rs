use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::services::discount::{Discount, DiscountError};

/// A priced registration tier, e.g. "General Admission" or "Weekend + Merch".
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventPaymentPackage {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub discount_type: Option<String>,
    pub discount_value: Option<Decimal>,
    pub capacity: Option<i32>,
    pub available_from: Option<DateTime<Utc>>,
    pub available_until: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventPaymentPackage {
    pub async fn find_for_event(
        event_id: Uuid,
        id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM event_payment_packages WHERE id = $1 AND event_id = $2",
        )
        .bind(id)
        .bind(event_id)
        .fetch_optional(pool)
        .await
    }

    /// Number of non-failed payments taken against this package.
    pub async fn count_sold(id: Uuid, pool: &PgPool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM event_payments
             WHERE package_id = $1 AND status NOT IN ('FAILED', 'REFUNDED')",
        )
        .bind(id)
        .fetch_one(pool)
        .await
    }

    pub fn discount(&self) -> Result<Option<Discount>, DiscountError> {
        Discount::from_columns(self.discount_type.as_deref(), self.discount_value)
    }

    pub fn is_available_at(&self, now: DateTime<Utc>, sold: i64) -> bool {
        if !self.is_active {
            return false;
        }
        if self.available_from.is_some_and(|from| now < from) {
            return false;
        }
        if self.available_until.is_some_and(|until| now > until) {
            return false;
        }
        self.capacity.map_or(true, |cap| sold < i64::from(cap))
    }
}
