use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routes::AppState;
use crate::services::stock;
use crate::utils::error::AppError;
use crate::utils::response::success;

#[derive(Debug, Deserialize)]
pub struct StockChangeRequest {
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
struct StockLevel {
    size_id: Uuid,
    quantity: i32,
}

pub async fn reserve(
    State(state): State<AppState>,
    Path(size_id): Path<Uuid>,
    Json(body): Json<StockChangeRequest>,
) -> Result<Response, AppError> {
    let quantity = stock::reserve(size_id, body.quantity, &state.pool).await?;
    Ok(success(StockLevel { size_id, quantity }, "Stock reserved"))
}

pub async fn release(
    State(state): State<AppState>,
    Path(size_id): Path<Uuid>,
    Json(body): Json<StockChangeRequest>,
) -> Result<Response, AppError> {
    let quantity = stock::release(size_id, body.quantity, &state.pool).await?;
    Ok(success(StockLevel { size_id, quantity }, "Stock released"))
}
