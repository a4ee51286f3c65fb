// CORS layer for the approval API and the collaboration endpoint.
//
// Origins come from `ServerConfig::cors_origins` (comma-separated, or `*`).
// Unset means the local web client origins.

use std::time::Duration;

use axum::http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(3600);

pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .allow_credentials(true)
        .max_age(PREFLIGHT_MAX_AGE);

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()).allow_credentials(false),
        Some(origins) => base.allow_origin(parse_origins(origins)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    fn test_app(origins: Option<&str>) -> Router {
        Router::new().route("/test", get(|| async { "ok" })).layer(cors_layer(origins))
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/test")
            .header("origin", origin)
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .expect("preflight request should build")
    }

    #[tokio::test]
    async fn default_origins_allow_local_web_client() {
        let response = test_app(None)
            .oneshot(preflight("http://localhost:3000"))
            .await
            .expect("preflight should respond");

        assert_eq!(
            response.headers().get("access-control-allow-origin").expect("allow-origin header"),
            "http://localhost:3000"
        );
    }

    #[tokio::test]
    async fn unknown_origin_gets_no_allow_header() {
        let response = test_app(None)
            .oneshot(preflight("https://evil.example.com"))
            .await
            .expect("preflight should respond");

        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn configured_origins_replace_defaults() {
        let app = test_app(Some("https://cdm.example.com, https://staging.cdm.example.com"));
        let response =
            app.oneshot(preflight("https://staging.cdm.example.com")).await.expect("respond");

        assert_eq!(
            response.headers().get("access-control-allow-origin").expect("allow-origin header"),
            "https://staging.cdm.example.com"
        );
    }

    #[tokio::test]
    async fn wildcard_origin_disables_credentials() {
        let response = test_app(Some("*"))
            .oneshot(preflight("https://anything.example.com"))
            .await
            .expect("preflight should respond");

        assert_eq!(
            response.headers().get("access-control-allow-origin").expect("allow-origin header"),
            "*"
        );
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }
}
