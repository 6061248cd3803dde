//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod audit;
mod filter;
mod lineage;
mod policy;

use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Reporting window; defaults to the last 24 hours
#[derive(Debug, Default, Deserialize)]
pub(crate) struct WindowQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl WindowQuery {
    fn resolve(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let until = self.until.unwrap_or_else(Utc::now);
        let since = self.since.unwrap_or(until - ChronoDuration::hours(24));
        (since, until)
    }
}

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    let cors = build_cors_layer(settings);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        .route("/health", get(health_check))
        // Policies
        .route("/api/policies", post(policy::create_policy).get(policy::list_policies))
        .route("/api/policies/evaluate", post(policy::evaluate))
        .route(
            "/api/policies/{id}",
            get(policy::get_policy)
                .put(policy::update_policy)
                .delete(policy::delete_policy),
        )
        .route("/api/policies/{id}/activate", post(policy::activate_policy))
        .route("/api/policies/{id}/deprecate", post(policy::deprecate_policy))
        .route("/api/policies/{id}/exceptions", post(policy::add_exception))
        .route(
            "/api/policies/{id}/exceptions/{exception_id}",
            axum::routing::delete(policy::remove_exception),
        )
        .route("/api/violations", get(policy::list_violations))
        // Content filter
        .route("/api/filter/rules", post(filter::create_rule).get(filter::list_rules))
        .route(
            "/api/filter/rules/{id}",
            get(filter::get_rule)
                .put(filter::update_rule)
                .delete(filter::delete_rule),
        )
        .route("/api/filter/rules/{id}/enable", post(filter::enable_rule))
        .route("/api/filter/rules/{id}/disable", post(filter::disable_rule))
        .route("/api/filter/check", post(filter::check_content))
        .route("/api/filter/statistics", get(filter::get_statistics))
        // Audit trail
        .route("/api/audit/events", post(audit::record_event))
        .route("/api/audit/events/batch", post(audit::record_events))
        .route("/api/audit/events/{id}", get(audit::get_event))
        .route("/api/audit/search", post(audit::search_events))
        .route("/api/audit/statistics", get(audit::get_statistics))
        .route("/api/audit/anomalies", get(audit::detect_anomalies))
        .route("/api/audit/archive", post(audit::archive_events))
        .route("/api/audit/flush", post(audit::flush))
        // Lineage
        .route("/api/lineage/nodes", post(lineage::create_node).get(lineage::list_nodes))
        .route("/api/lineage/nodes/search", get(lineage::search_nodes))
        .route(
            "/api/lineage/nodes/{id}",
            get(lineage::get_node)
                .put(lineage::update_node)
                .delete(lineage::delete_node),
        )
        .route("/api/lineage/nodes/{id}/graph", get(lineage::get_graph))
        .route("/api/lineage/nodes/{id}/impact", get(lineage::analyze_impact))
        .route("/api/lineage/edges", post(lineage::create_edge))
        .route(
            "/api/lineage/edges/{id}",
            get(lineage::get_edge).delete(lineage::delete_edge),
        )
        .route("/api/lineage/path", get(lineage::find_path))
        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::state::AppState;
    use crate::storage::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let settings = Settings::default();
        let state = AppState::new(
            settings.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::new()),
        )
        .unwrap();
        create_router(Arc::new(state), &settings)
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_unknown_policy_is_404() {
        let uri = format!("/api/policies/{}", uuid::Uuid::new_v4());
        let response = app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_oversized_limit_is_400() {
        let app = app();
        for uri in [
            "/api/lineage/nodes?limit=18446744073709551615",
            "/api/violations?limit=18446744073709551615",
            "/api/lineage/nodes?offset=18446744073709551615",
        ] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/lineage/nodes?limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_edge_cycle_is_409() {
        let app = app();
        let mut ids = Vec::new();
        for name in ["orders", "orders_clean"] {
            let response = app
                .clone()
                .oneshot(json_request(
                    Method::POST,
                    "/api/lineage/nodes",
                    serde_json::json!({
                        "type": "table",
                        "name": name,
                        "source": { "system": "warehouse" }
                    }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            ids.push(body_json(response).await["data"]["id"].as_str().unwrap().to_string());
        }

        let edge = |from: &str, to: &str| {
            json_request(
                Method::POST,
                "/api/lineage/edges",
                serde_json::json!({
                    "type": "derived_from",
                    "sourceNodeId": from,
                    "targetNodeId": to
                }),
            )
        };
        let response = app.clone().oneshot(edge(&ids[0], &ids[1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(edge(&ids[1], &ids[0])).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "CYCLE_DETECTED");
    }

    #[tokio::test]
    async fn test_filter_check_redacts_email() {
        let app = app();
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/filter/rules",
                serde_json::json!({
                    "name": "pii-redact",
                    "category": "pii",
                    "direction": "both",
                    "action": "redact",
                    "priority": 10
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/filter/check",
                serde_json::json!({ "text": "mail a@b.com", "direction": "input" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["action"], "redact");
        assert_eq!(body["data"]["redactedContent"], "mail [REDACTED]");
    }
}
