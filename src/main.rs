use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gathering_server::config::Config;
use gathering_server::gateway::{DisabledGateway, PaymentGateway, StripeGateway, StripeOptions};
use gathering_server::routes::{create_routes, AppState};
use gathering_server::services::refund::{PgRefundStore, RefundService};

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gathering_server=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Successfully connected to database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    tracing::info!("Migrations run successfully");

    let gateway: Arc<dyn PaymentGateway> = match &config.stripe_secret_key {
        Some(secret_key) => Arc::new(StripeGateway::new(StripeOptions {
            secret_key: secret_key.clone(),
            api_base: config.stripe_api_base.clone(),
        })),
        None => {
            tracing::warn!("STRIPE_SECRET_KEY not set, automatic refunds will fail");
            Arc::new(DisabledGateway)
        }
    };

    if config.stripe_webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set, gateway webhooks will be rejected");
    }

    let refunds = RefundService::new(gateway, Arc::new(PgRefundStore::new(pool.clone())));
    let state = AppState {
        pool,
        refunds: Arc::new(refunds),
        webhook_secret: config.stripe_webhook_secret.as_deref().map(Arc::from),
    };

    let app: Router = create_routes(state, &config);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server running at http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server failed");
}
