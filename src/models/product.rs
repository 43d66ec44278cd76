use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::services::discount::{Discount, DiscountError};

text_enum! {
    pub enum CartStatus {
        Open => "OPEN",
        Submitted => "SUBMITTED",
        Approved => "APPROVED",
        PendingRefund => "PENDING_REFUND",
        Refunded => "REFUNDED",
    }
}

text_enum! {
    pub enum OrderStatus {
        Pending => "PENDING",
        Purchased => "PURCHASED",
        Cancelled => "CANCELLED",
        PendingRefund => "PENDING_REFUND",
        Refunded => "REFUNDED",
    }
}

/// Merchandise sold at an event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventProduct {
    pub id: Uuid,
    pub event_id: Uuid,
    pub title: String,
    pub price: Decimal,
    /// Fixed amount off, in pounds.
    pub discount: Option<Decimal>,
    pub stock: i32,
    pub maximum_order_quantity: i32,
    pub created_at: DateTime<Utc>,
}

impl EventProduct {
    pub async fn find_for_event(
        event_id: Uuid,
        id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM event_products WHERE id = $1 AND event_id = $2")
            .bind(id)
            .bind(event_id)
            .fetch_optional(pool)
            .await
    }

    pub fn item_discount(&self) -> Result<Option<Discount>, DiscountError> {
        self.discount.map(Discount::fixed).transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductSize {
    pub id: Uuid,
    pub product_id: Uuid,
    pub size: String,
    pub price_modifier: Decimal,
    pub quantity: i32,
}

impl ProductSize {
    pub async fn find_for_product(
        product_id: Uuid,
        id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM product_sizes WHERE id = $1 AND product_id = $2")
            .bind(id)
            .bind(product_id)
            .fetch_optional(pool)
            .await
    }
}

/// A submitted merchandise order.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventCart {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub order_reference: String,
    pub total: Decimal,
    pub shipping_cost: Decimal,
    #[sqlx(try_from = "String")]
    pub status: CartStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventCart {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM event_carts WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Moves the cart and every line in it to the matching statuses.
    pub async fn set_status(
        id: Uuid,
        cart_status: CartStatus,
        order_status: OrderStatus,
        conn: &mut PgConnection,
    ) -> Result<u64, sqlx::Error> {
        sqlx::query("UPDATE event_carts SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(cart_status.as_str())
            .execute(&mut *conn)
            .await?;

        let lines = sqlx::query("UPDATE event_product_orders SET status = $2 WHERE cart_id = $1")
            .bind(id)
            .bind(order_status.as_str())
            .execute(&mut *conn)
            .await?;

        Ok(lines.rows_affected())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventProductOrder {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub product_id: Uuid,
    pub size_id: Option<Uuid>,
    pub quantity: i32,
    pub price_at_purchase: Decimal,
    pub discount_applied: Option<Decimal>,
    #[sqlx(try_from = "String")]
    pub status: OrderStatus,
    pub added_at: DateTime<Utc>,
}

impl EventProductOrder {
    pub async fn find_for_cart(
        cart_id: Uuid,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM event_product_orders WHERE cart_id = $1")
            .bind(cart_id)
            .fetch_all(conn)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_discount_is_fixed() {
        let product = EventProduct {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            title: "Camp Hoodie".to_string(),
            price: Decimal::new(2500, 2),
            discount: Some(Decimal::new(500, 2)),
            stock: 10,
            maximum_order_quantity: 5,
            created_at: Utc::now(),
        };

        let discount = product.item_discount().unwrap().unwrap();
        assert_eq!(discount.amount_off(product.price), Decimal::new(500, 2));
    }
}
