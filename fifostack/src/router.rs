//! HTTP router for fifostack

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use fifostack_sqs::{SqsState, SqsStorage};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the main application router
pub fn create_router(storage: Arc<SqsStorage>) -> Router {
    let sqs = Arc::new(SqsState::new(storage));

    Router::new()
        .route("/health", get(health_check))
        .route("/_localstack/health", get(health_check))
        .merge(fifostack_sqs::router(sqs))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status": "running", "services": ["sqs"]}"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(Arc::new(SqsStorage::new()));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "running");
    }

    #[tokio::test]
    async fn test_sqs_requests_are_routed() {
        let app = create_router(Arc::new(SqsStorage::new()));
        let response = app
            .oneshot(
                Request::post("/")
                    .header("x-amz-target", "AmazonSQS.ListQueues")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
