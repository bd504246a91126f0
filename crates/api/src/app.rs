//! Axum router: named operations plus health.
//!
//! `POST /ops/{name}` runs any registered operation with a JSON params body
//! and returns `{"ids": .., "data": ..}`, or `{"error": .., "details": ..}`
//! with an appropriate status on failure.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value as JsonValue};

use coterie_app::Substrate;
use coterie_protocol::ops::OpError;

pub fn build_router(substrate: Arc<Substrate>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ops/:name", post(run_operation))
        .with_state(substrate)
}

async fn health() -> Json<JsonValue> {
    Json(json!({"status": "ok"}))
}

async fn run_operation(
    State(substrate): State<Arc<Substrate>>,
    Path(name): Path<String>,
    payload: Option<Json<JsonValue>>,
) -> Response {
    let params = payload.map(|Json(v)| v).unwrap_or(JsonValue::Null);

    match substrate.execute(&name, params).await {
        Ok(response) => (StatusCode::OK, Json(json!(response))).into_response(),
        Err(error) => error_response(error),
    }
}

fn error_response(error: OpError) -> Response {
    let (status, kind) = match &error {
        OpError::Unknown(_) => (StatusCode::NOT_FOUND, "unknown_operation"),
        OpError::InvalidParams(_) => (StatusCode::BAD_REQUEST, "invalid_params"),
        OpError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        OpError::Pipeline(_) => (StatusCode::UNPROCESSABLE_ENTITY, "pipeline"),
        OpError::Failed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "failed"),
    };

    (
        status,
        Json(json!({"error": kind, "details": error.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use coterie_app::Config;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn router() -> Router {
        let substrate = Substrate::build(&Config::for_testing()).await.unwrap();
        build_router(Arc::new(substrate))
    }

    async fn body_json(response: Response) -> JsonValue {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: JsonValue) -> axum::http::Request<axum::body::Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_responds() {
        let app = router().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn identity_create_returns_ids() {
        let app = router().await;
        let response = app
            .oneshot(post_json("/ops/identity.create", json!({"name": "alice"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert!(body["ids"]["identity"].is_string());
    }

    #[tokio::test]
    async fn unknown_operations_are_404() {
        let app = router().await;
        let response = app
            .oneshot(post_json("/ops/nope.create", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["error"], "unknown_operation");
    }

    #[tokio::test]
    async fn invalid_params_are_400() {
        let app = router().await;
        let response = app
            .oneshot(post_json("/ops/identity.create", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
