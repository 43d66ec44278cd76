use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::services::discount::{Discount, DiscountError};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub event_code: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub default_registration_discount_type: Option<String>,
    pub default_registration_discount_value: Option<Decimal>,
    pub default_product_discount_type: Option<String>,
    pub default_product_discount_value: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub fn registration_discount(&self) -> Result<Option<Discount>, DiscountError> {
        Discount::from_columns(
            self.default_registration_discount_type.as_deref(),
            self.default_registration_discount_value,
        )
    }

    pub fn product_discount(&self) -> Result<Option<Discount>, DiscountError> {
        Discount::from_columns(
            self.default_product_discount_type.as_deref(),
            self.default_product_discount_value,
        )
    }
}
