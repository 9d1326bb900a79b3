//! HTTP router for QueueStack

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use queuestack_sqs::{handle_request, SqsService};

/// Create the main application router.
///
/// SQS requests are accepted on `/` and on queue URL paths, since SDKs post
/// to either depending on version.
pub fn create_router(sqs: Arc<SqsService>) -> Router {
    Router::new()
        // Health check endpoint
        .route("/health", get(health_check))
        .route("/_localstack/health", get(health_check)) // LocalStack compatibility
        .route("/_queuestack/reset", post(reset))
        // SQS JSON protocol
        .route("/", post(handle_request))
        .route("/:account/:queue", post(handle_request))
        .layer(TraceLayer::new_for_http())
        .with_state(sqs)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "running", "services": { "sqs": "running" } })),
    )
}

/// Drop every queue and move task
async fn reset(State(sqs): State<Arc<SqsService>>) -> impl IntoResponse {
    info!("Reset requested");
    sqs.reset();
    (StatusCode::OK, Json(json!({ "status": "reset" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use queuestack_sqs::SqsConfig;
    use tower::ServiceExt;

    fn sqs_request(uri: &str, target: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-amz-target", target)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let router = create_router(Arc::new(SqsService::new(SqsConfig::default())));
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "running");
    }

    #[tokio::test]
    async fn test_queue_path_and_reset() {
        let sqs = Arc::new(SqsService::new(SqsConfig::default()));
        let router = create_router(sqs.clone());

        let response = router
            .clone()
            .oneshot(sqs_request(
                "/",
                "AmazonSQS.CreateQueue",
                r#"{"QueueName":"q"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(sqs_request(
                "/000000000000/q",
                "AmazonSQS.SendMessage",
                r#"{"QueueUrl":"http://localhost:4566/000000000000/q","MessageBody":"m"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::post("/_queuestack/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(sqs.list_queues(None, None).unwrap().is_empty());
    }
}
