use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use uuid::Uuid;

use crate::routes::AppState;
use crate::services::pricing;
use crate::utils::error::AppError;
use crate::utils::response::success;

#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    pub user_id: Option<Uuid>,
    pub size_id: Option<Uuid>,
}

pub async fn quote_package(
    State(state): State<AppState>,
    Path((event_id, package_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<QuoteQuery>,
) -> Result<Response, AppError> {
    let quote = pricing::quote_package(event_id, package_id, query.user_id, &state.pool).await?;
    Ok(success(quote, "Package price calculated"))
}

pub async fn quote_product(
    State(state): State<AppState>,
    Path((event_id, product_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<QuoteQuery>,
) -> Result<Response, AppError> {
    let quote = pricing::quote_product(
        event_id,
        product_id,
        query.user_id,
        query.size_id,
        &state.pool,
    )
    .await?;
    Ok(success(quote, "Product price calculated"))
}
