//! Row-locked stock counters for product sizes.
//!
//! Each mutation locks the `product_sizes` row with `FOR UPDATE`, checks the
//! quantity and writes the new value before the surrounding transaction
//! commits, so concurrent checkouts cannot oversell a size.

use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use uuid::Uuid;

use crate::utils::error::AppError;

#[derive(Debug, Error, PartialEq)]
pub enum StockError {
    #[error("Quantity must be positive (got {0})")]
    InvalidQuantity(i32),

    #[error("Insufficient stock: requested {requested}, only {available} left")]
    Insufficient { requested: i32, available: i32 },

    #[error("Stock counter would overflow")]
    Overflow,

    #[error("Product size {0} does not exist")]
    SizeNotFound(Uuid),
}

pub fn checked_decrement(available: i32, requested: i32) -> Result<i32, StockError> {
    if requested <= 0 {
        return Err(StockError::InvalidQuantity(requested));
    }
    if requested > available {
        return Err(StockError::Insufficient {
            requested,
            available,
        });
    }
    Ok(available - requested)
}

pub fn checked_increment(available: i32, returned: i32) -> Result<i32, StockError> {
    if returned <= 0 {
        return Err(StockError::InvalidQuantity(returned));
    }
    available.checked_add(returned).ok_or(StockError::Overflow)
}

async fn lock_size(size_id: Uuid, conn: &mut PgConnection) -> Result<i32, AppError> {
    let quantity: Option<i32> =
        sqlx::query_scalar("SELECT quantity FROM product_sizes WHERE id = $1 FOR UPDATE")
            .bind(size_id)
            .fetch_optional(&mut *conn)
            .await?;

    quantity.ok_or_else(|| StockError::SizeNotFound(size_id).into())
}

async fn write_size(size_id: Uuid, quantity: i32, conn: &mut PgConnection) -> Result<(), AppError> {
    sqlx::query("UPDATE product_sizes SET quantity = $2 WHERE id = $1")
        .bind(size_id)
        .bind(quantity)
        .execute(conn)
        .await?;
    Ok(())
}

/// Takes `quantity` units of a size inside the caller's transaction.
pub async fn decrement_in(
    size_id: Uuid,
    quantity: i32,
    conn: &mut PgConnection,
) -> Result<i32, AppError> {
    let available = lock_size(size_id, conn).await?;
    let remaining = checked_decrement(available, quantity)?;
    write_size(size_id, remaining, conn).await?;
    Ok(remaining)
}

/// Puts `quantity` units of a size back inside the caller's transaction.
pub async fn increment_in(
    size_id: Uuid,
    quantity: i32,
    conn: &mut PgConnection,
) -> Result<i32, AppError> {
    let available = lock_size(size_id, conn).await?;
    let updated = checked_increment(available, quantity)?;
    write_size(size_id, updated, conn).await?;
    Ok(updated)
}

/// Product-level counter for order lines bought without a size.
pub async fn increment_product_in(
    product_id: Uuid,
    quantity: i32,
    conn: &mut PgConnection,
) -> Result<(), AppError> {
    if quantity <= 0 {
        return Err(StockError::InvalidQuantity(quantity).into());
    }
    sqlx::query("UPDATE event_products SET stock = stock + $2 WHERE id = $1")
        .bind(product_id)
        .bind(quantity)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn reserve(size_id: Uuid, quantity: i32, pool: &PgPool) -> Result<i32, AppError> {
    let mut tx = pool.begin().await?;
    let remaining = decrement_in(size_id, quantity, &mut tx).await?;
    tx.commit().await?;

    tracing::info!(size = %size_id, quantity, remaining, "Stock reserved");
    Ok(remaining)
}

pub async fn release(size_id: Uuid, quantity: i32, pool: &PgPool) -> Result<i32, AppError> {
    let mut tx = pool.begin().await?;
    let updated = increment_in(size_id, quantity, &mut tx).await?;
    tx.commit().await?;

    tracing::info!(size = %size_id, quantity, available = updated, "Stock released");
    Ok(updated)
}
