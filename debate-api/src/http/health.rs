//! Health check endpoint
//!
//! Reports liveness together with the registry counters.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use debate_sfu::RegistryStats;

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub stats: RegistryStats,
}

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        stats: state.registry.stats(),
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use debate_sfu::test_helpers::test_registry;
    use debate_sfu::{RoomId, SfuConfig};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::http::create_router;

    #[tokio::test]
    async fn test_health_reports_room_count() {
        let (registry, _engine, _reports) = test_registry(SfuConfig::default());
        registry.create_room(RoomId::from("r"), "host", None).await.unwrap();
        let app = create_router(registry, 64 * 1024);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["rooms"], 1);
        assert_eq!(value["peers"], 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (registry, _engine, _reports) = test_registry(SfuConfig::default());
        let app = create_router(registry, 1024);
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
