use axum::http::{header, HeaderName, Method};
use tower_http::cors::{Any, CorsLayer};

/// Internal callers only issue plain GET/POST with JSON bodies
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
        ])
        .allow_origin(Any)
}
