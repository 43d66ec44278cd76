use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use super::DEFAULT_ALLOWED_ORIGINS;

const PREFLIGHT_MAX_AGE_SECS: u64 = 86400;

pub fn create_cors_layer(origins: &[String]) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(allowed_origins(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
            HeaderName::from_static("x-requested-with"),
            HeaderName::from_static("stripe-signature"),
        ])
        .expose_headers([header::CONTENT_LENGTH, header::CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(PREFLIGHT_MAX_AGE_SECS))
}

fn parse_origins<'a>(origins: impl Iterator<Item = &'a str>) -> Vec<HeaderValue> {
    origins
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => {
                tracing::debug!(origin, "CORS: allowing origin");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(origin, error = %e, "CORS: invalid origin");
                None
            }
        })
        .collect()
}

/// Credentialed CORS cannot use a wildcard, so an unusable list falls back
/// to the local development origins.
fn allowed_origins(configured: &[String]) -> AllowOrigin {
    let mut origins = parse_origins(configured.iter().map(String::as_str));

    if origins.is_empty() {
        tracing::warn!("CORS: no valid origins configured, using development defaults");
        origins = parse_origins(DEFAULT_ALLOWED_ORIGINS.split(','));
    } else {
        tracing::info!(count = origins.len(), "CORS: configured allowed origins");
    }
    AllowOrigin::list(origins)
}
