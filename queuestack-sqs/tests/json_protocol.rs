//! SQS JSON protocol tests
//!
//! Requests go through the same axum route the server mounts, so these cover
//! request parsing, response shaping and error rendering end to end.

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use queuestack_sqs::{handle_request, SqsConfig, SqsService};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

/// Create a test SQS router
fn create_test_router() -> Router {
    let service = Arc::new(SqsService::new(SqsConfig::default()));

    Router::new()
        .route("/", axum::routing::post(handle_request))
        .with_state(service)
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

async fn call(router: &Router, action: &str, body: Value) -> Reply {
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("x-amz-target", format!("AmazonSQS.{}", action))
        .header("content-type", "application/x-amz-json-1.0")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    Reply {
        status,
        headers,
        body,
    }
}

async fn create_queue(router: &Router, name: &str, attributes: Value) -> String {
    let reply = call(
        router,
        "CreateQueue",
        json!({ "QueueName": name, "Attributes": attributes }),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    reply.body["QueueUrl"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_send_receive_delete() {
    let router = create_test_router();
    let url = create_queue(&router, "orders", json!({})).await;
    assert_eq!(url, "http://localhost:4566/000000000000/orders");

    let sent = call(
        &router,
        "SendMessage",
        json!({
            "QueueUrl": url,
            "MessageBody": "hello",
            "MessageAttributes": {
                "color": { "DataType": "String", "StringValue": "red" },
                "blob": { "DataType": "Binary", "BinaryValue": "AQID" }
            }
        }),
    )
    .await;
    assert_eq!(sent.status, StatusCode::OK);
    assert_eq!(sent.body["MD5OfMessageBody"], "5d41402abc4b2a76b9719d911017c592");
    assert!(sent.body["MD5OfMessageAttributes"].is_string());
    assert!(sent.body.get("SequenceNumber").is_none());

    let received = call(
        &router,
        "ReceiveMessage",
        json!({
            "QueueUrl": url,
            "AttributeNames": ["All"],
            "MessageAttributeNames": ["All"]
        }),
    )
    .await;
    let message = &received.body["Messages"][0];
    assert_eq!(message["MessageId"], sent.body["MessageId"]);
    assert_eq!(message["Body"], "hello");
    assert_eq!(message["MD5OfMessageAttributes"], sent.body["MD5OfMessageAttributes"]);
    assert_eq!(message["MessageAttributes"]["color"]["StringValue"], "red");
    assert_eq!(message["MessageAttributes"]["blob"]["BinaryValue"], "AQID");
    assert_eq!(message["Attributes"]["ApproximateReceiveCount"], "1");
    assert_eq!(message["Attributes"]["SenderId"], "000000000000");

    let deleted = call(
        &router,
        "DeleteMessage",
        json!({ "QueueUrl": url, "ReceiptHandle": message["ReceiptHandle"] }),
    )
    .await;
    assert_eq!(deleted.status, StatusCode::OK);

    let attributes = call(
        &router,
        "GetQueueAttributes",
        json!({ "QueueUrl": url, "AttributeNames": ["All"] }),
    )
    .await;
    assert_eq!(attributes.body["Attributes"]["ApproximateNumberOfMessages"], "0");
    assert_eq!(
        attributes.body["Attributes"]["QueueArn"],
        "arn:aws:sqs:us-east-1:000000000000:orders"
    );
}

#[tokio::test]
async fn test_receive_on_empty_queue_omits_messages() {
    let router = create_test_router();
    let url = create_queue(&router, "empty", json!({})).await;

    let reply = call(&router, "ReceiveMessage", json!({ "QueueUrl": url })).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!({}));
}

#[tokio::test]
async fn test_error_rendering() {
    let router = create_test_router();

    let reply = call(&router, "GetQueueUrl", json!({ "QueueName": "missing" })).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["__type"], "com.amazonaws.sqs#QueueDoesNotExist");
    assert_eq!(reply.body["message"], "The specified queue does not exist.");
    assert_eq!(
        reply.headers["x-amzn-query-error"],
        "AWS.SimpleQueueService.NonExistentQueue;Sender"
    );
    assert!(reply.headers.contains_key("x-amzn-requestid"));

    let reply = call(&router, "SendMessage", json!({ "MessageBody": "x" })).await;
    assert_eq!(reply.body["__type"], "com.amazonaws.sqs#MissingParameter");

    let reply = call(&router, "Frobnicate", json!({})).await;
    assert_eq!(reply.body["__type"], "com.amazonaws.sqs#InvalidAction");
}

#[tokio::test]
async fn test_invalid_json_body() {
    let router = create_test_router();
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("x-amz-target", "AmazonSQS.ListQueues")
        .body(Body::from("{not json"))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_send_message_batch_partial_failure() {
    let router = create_test_router();
    let url = create_queue(&router, "batch", json!({})).await;

    let reply = call(
        &router,
        "SendMessageBatch",
        json!({
            "QueueUrl": url,
            "Entries": [
                { "Id": "ok", "MessageBody": "fine" },
                { "Id": "late", "MessageBody": "too late", "DelaySeconds": 901 },
                { "Id": "empty" }
            ]
        }),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let successful = reply.body["Successful"].as_array().unwrap();
    assert_eq!(successful.len(), 1);
    assert_eq!(successful[0]["Id"], "ok");
    assert!(successful[0]["MessageId"].is_string());

    let failed = reply.body["Failed"].as_array().unwrap();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|entry| entry["SenderFault"] == true));
    let late = failed.iter().find(|entry| entry["Id"] == "late").unwrap();
    assert_eq!(late["Code"], "InvalidParameterValue");
    let empty = failed.iter().find(|entry| entry["Id"] == "empty").unwrap();
    assert_eq!(empty["Code"], "MissingParameter");
}

#[tokio::test]
async fn test_batch_request_level_errors() {
    let router = create_test_router();
    let url = create_queue(&router, "batch", json!({})).await;

    let reply = call(
        &router,
        "DeleteMessageBatch",
        json!({ "QueueUrl": url, "Entries": [] }),
    )
    .await;
    assert_eq!(
        reply.body["__type"],
        "com.amazonaws.sqs#EmptyBatchRequest"
    );

    let reply = call(
        &router,
        "SendMessageBatch",
        json!({
            "QueueUrl": url,
            "Entries": [
                { "Id": "a", "MessageBody": "1" },
                { "Id": "a", "MessageBody": "2" }
            ]
        }),
    )
    .await;
    assert_eq!(
        reply.body["__type"],
        "com.amazonaws.sqs#BatchEntryIdsNotDistinct"
    );

    let entries: Vec<Value> = (0..11)
        .map(|i| json!({ "Id": i.to_string(), "MessageBody": "m" }))
        .collect();
    let reply = call(
        &router,
        "SendMessageBatch",
        json!({ "QueueUrl": url, "Entries": entries }),
    )
    .await;
    assert_eq!(
        reply.body["__type"],
        "com.amazonaws.sqs#TooManyEntriesInBatchRequest"
    );
}

#[tokio::test]
async fn test_fifo_over_the_wire() {
    let router = create_test_router();
    let url = create_queue(
        &router,
        "jobs.fifo",
        json!({ "FifoQueue": "true", "ContentBasedDeduplication": "true" }),
    )
    .await;

    let first = call(
        &router,
        "SendMessage",
        json!({ "QueueUrl": url, "MessageBody": "job", "MessageGroupId": "g" }),
    )
    .await;
    let again = call(
        &router,
        "SendMessage",
        json!({ "QueueUrl": url, "MessageBody": "job", "MessageGroupId": "g" }),
    )
    .await;
    assert_eq!(first.body["MessageId"], again.body["MessageId"]);
    assert_eq!(first.body["SequenceNumber"], again.body["SequenceNumber"]);

    let received = call(
        &router,
        "ReceiveMessage",
        json!({
            "QueueUrl": url,
            "MaxNumberOfMessages": 10,
            "MessageSystemAttributeNames": ["MessageGroupId", "SequenceNumber"]
        }),
    )
    .await;
    let messages = received.body["Messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["Attributes"]["MessageGroupId"], "g");
    assert_eq!(messages[0]["Attributes"]["SequenceNumber"], first.body["SequenceNumber"]);
    assert!(messages[0]["Attributes"].get("SenderId").is_none());
}

#[tokio::test]
async fn test_change_visibility_batch() {
    let router = create_test_router();
    let url = create_queue(&router, "vis", json!({})).await;
    call(&router, "SendMessage", json!({ "QueueUrl": url, "MessageBody": "m" })).await;

    let received = call(&router, "ReceiveMessage", json!({ "QueueUrl": url })).await;
    let handle = received.body["Messages"][0]["ReceiptHandle"].clone();

    let reply = call(
        &router,
        "ChangeMessageVisibilityBatch",
        json!({
            "QueueUrl": url,
            "Entries": [
                { "Id": "good", "ReceiptHandle": handle, "VisibilityTimeout": 0 },
                { "Id": "bad", "ReceiptHandle": "bogus", "VisibilityTimeout": 10 }
            ]
        }),
    )
    .await;
    assert_eq!(reply.body["Successful"], json!([{ "Id": "good" }]));
    assert_eq!(reply.body["Failed"][0]["Id"], "bad");
    assert_eq!(reply.body["Failed"][0]["Code"], "ReceiptHandleIsInvalid");

    // Released immediately by the zero timeout
    let again = call(&router, "ReceiveMessage", json!({ "QueueUrl": url })).await;
    assert_eq!(again.body["Messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_purge_twice_is_rejected() {
    let router = create_test_router();
    let url = create_queue(&router, "purge", json!({})).await;

    let first = call(&router, "PurgeQueue", json!({ "QueueUrl": url })).await;
    assert_eq!(first.status, StatusCode::OK);

    let second = call(&router, "PurgeQueue", json!({ "QueueUrl": url })).await;
    assert_eq!(second.status, StatusCode::FORBIDDEN);
    assert_eq!(second.body["__type"], "com.amazonaws.sqs#PurgeQueueInProgress");
}

#[tokio::test]
async fn test_dead_letter_sources_and_move_tasks() {
    let router = create_test_router();
    let dlq_url = create_queue(&router, "dlq", json!({})).await;
    let dlq_arn = "arn:aws:sqs:us-east-1:000000000000:dlq";
    let main_url = create_queue(
        &router,
        "main",
        json!({
            "RedrivePolicy": format!(
                r#"{{"deadLetterTargetArn":"{}","maxReceiveCount":"3"}}"#,
                dlq_arn
            )
        }),
    )
    .await;

    let sources = call(
        &router,
        "ListDeadLetterSourceQueues",
        json!({ "QueueUrl": dlq_url }),
    )
    .await;
    assert_eq!(sources.body["queueUrls"], json!([main_url]));

    // Only a dead-letter queue can be a move source
    let rejected = call(
        &router,
        "StartMessageMoveTask",
        json!({ "SourceArn": "arn:aws:sqs:us-east-1:000000000000:main" }),
    )
    .await;
    assert_eq!(rejected.body["__type"], "com.amazonaws.sqs#InvalidParameterValue");

    let started = call(
        &router,
        "StartMessageMoveTask",
        json!({ "SourceArn": dlq_arn, "MaxNumberOfMessagesPerSecond": 5 }),
    )
    .await;
    assert_eq!(started.status, StatusCode::OK);
    let handle = started.body["TaskHandle"].as_str().unwrap().to_string();

    let listed = call(
        &router,
        "ListMessageMoveTasks",
        json!({ "SourceArn": dlq_arn, "MaxResults": 10 }),
    )
    .await;
    let results = listed.body["Results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["SourceArn"], dlq_arn);
    assert_eq!(results[0]["MaxNumberOfMessagesPerSecond"], 5);

    let missing = call(
        &router,
        "CancelMessageMoveTask",
        json!({ "TaskHandle": "not-a-handle" }),
    )
    .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.body["__type"], "com.amazonaws.sqs#ResourceNotFoundException");

    // The task may already have completed on an empty queue
    let cancelled = call(
        &router,
        "CancelMessageMoveTask",
        json!({ "TaskHandle": handle }),
    )
    .await;
    assert!(
        cancelled.status == StatusCode::OK || cancelled.status == StatusCode::NOT_FOUND,
        "{}",
        cancelled.body
    );
}

#[tokio::test]
async fn test_queue_lifecycle() {
    let router = create_test_router();
    let url = create_queue(&router, "life", json!({ "VisibilityTimeout": "45" })).await;

    let same = create_queue(&router, "life", json!({ "VisibilityTimeout": "45" })).await;
    assert_eq!(url, same);

    let conflict = call(
        &router,
        "CreateQueue",
        json!({ "QueueName": "life", "Attributes": { "VisibilityTimeout": "10" } }),
    )
    .await;
    assert_eq!(conflict.body["__type"], "com.amazonaws.sqs#QueueNameExists");

    let set = call(
        &router,
        "SetQueueAttributes",
        json!({ "QueueUrl": url, "Attributes": { "DelaySeconds": "5" } }),
    )
    .await;
    assert_eq!(set.status, StatusCode::OK);

    let listed = call(&router, "ListQueues", json!({ "QueueNamePrefix": "li" })).await;
    assert_eq!(listed.body["QueueUrls"], json!([url]));

    let deleted = call(&router, "DeleteQueue", json!({ "QueueUrl": url })).await;
    assert_eq!(deleted.status, StatusCode::OK);

    let recreate = call(&router, "CreateQueue", json!({ "QueueName": "life" })).await;
    assert_eq!(recreate.body["__type"], "com.amazonaws.sqs#QueueDeletedRecently");

    let listed = call(&router, "ListQueues", json!({})).await;
    assert_eq!(listed.body, json!({}));
}
