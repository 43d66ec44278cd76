use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::{apply_security_headers, create_cors_layer, Config};
use crate::handlers::{
    health_check, order_refunds, participant_refunds, quotes, stock, webhooks,
};
use crate::services::refund::RefundService;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub refunds: Arc<RefundService>,
    pub webhook_secret: Option<Arc<str>>,
}

fn order_refund_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(order_refunds::list))
        .route("/initiate", post(order_refunds::initiate))
        .route("/pending", get(order_refunds::pending))
        .route("/statistics", get(order_refunds::statistics))
        .route("/:id", get(order_refunds::get))
        .route("/:id/process", post(order_refunds::process))
        .route("/:id/complete", post(order_refunds::complete))
        .route("/:id/cancel", post(order_refunds::cancel))
        .route("/:id/retry", post(order_refunds::retry))
}

fn participant_refund_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(participant_refunds::list))
        .route("/initiate", post(participant_refunds::initiate))
        .route("/pending", get(participant_refunds::pending))
        .route("/statistics", get(participant_refunds::statistics))
        .route("/:id", get(participant_refunds::get))
        .route("/:id/process", post(participant_refunds::process))
        .route("/:id/complete", post(participant_refunds::complete))
        .route("/:id/cancel", post(participant_refunds::cancel))
        .route("/:id/retry", post(participant_refunds::retry))
}

pub fn create_routes(state: AppState, config: &Config) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route(
            "/events/:event_id/packages/:package_id/quote",
            get(quotes::quote_package),
        )
        .route(
            "/events/:event_id/products/:product_id/quote",
            get(quotes::quote_product),
        )
        .route("/product-sizes/:size_id/reserve", post(stock::reserve))
        .route("/product-sizes/:size_id/release", post(stock::release))
        .nest("/order-refunds", order_refund_routes())
        .nest("/participant-refunds", participant_refund_routes())
        .route("/webhooks/gateway", post(webhooks::gateway_webhook))
        .with_state(state);

    apply_security_headers(router, config.is_production).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(create_cors_layer(&config.cors_allowed_origins)),
    )
}
