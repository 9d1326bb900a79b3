//! HTTP handlers for the SQS JSON protocol
//!
//! Requests arrive as `POST /` with `X-Amz-Target: AmazonSQS.<Operation>` and
//! an `application/x-amz-json-1.0` body.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use queuestack_core::AwsError;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::batch::{
    BatchOutcome, ChangeVisibilityBatchEntry, DeleteMessageBatchEntry, SendMessageBatchEntry,
};
use crate::error::SqsError;
use crate::message::{
    AttributeData, MessageAttributeValue, ReceivedMessage, SendMessageInput, SendMessageOutput,
    TRACE_HEADER,
};
use crate::move_task::MoveTaskSummary;
use crate::service::{ReceiveMessageRequest, SqsService};

const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const TARGET_PREFIX: &str = "AmazonSQS.";

/// Handle SQS requests based on the X-Amz-Target header
pub async fn handle_request(
    State(service): State<Arc<SqsService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let action = target.strip_prefix(TARGET_PREFIX).unwrap_or(target);

    debug!(action = %action, "SQS request");

    let request: Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                return error_response(SqsError::InvalidParameterValue(format!(
                    "Invalid JSON: {}",
                    e
                )))
            }
        }
    };

    let service = service.as_ref();
    let result = match action {
        "CreateQueue" => handle_create_queue(service, &request),
        "DeleteQueue" => handle_delete_queue(service, &request),
        "GetQueueUrl" => handle_get_queue_url(service, &request),
        "ListQueues" => handle_list_queues(service, &request),
        "GetQueueAttributes" => handle_get_queue_attributes(service, &request),
        "SetQueueAttributes" => handle_set_queue_attributes(service, &request),
        "PurgeQueue" => handle_purge_queue(service, &request),
        "ListDeadLetterSourceQueues" => handle_list_dead_letter_source_queues(service, &request),
        "SendMessage" => handle_send_message(service, &request),
        "SendMessageBatch" => handle_send_message_batch(service, &request),
        "ReceiveMessage" => handle_receive_message(service, &request).await,
        "DeleteMessage" => handle_delete_message(service, &request),
        "DeleteMessageBatch" => handle_delete_message_batch(service, &request),
        "ChangeMessageVisibility" => handle_change_message_visibility(service, &request),
        "ChangeMessageVisibilityBatch" => {
            handle_change_message_visibility_batch(service, &request)
        }
        "StartMessageMoveTask" => handle_start_message_move_task(service, &request),
        "CancelMessageMoveTask" => handle_cancel_message_move_task(service, &request),
        "ListMessageMoveTasks" => handle_list_message_move_tasks(service, &request),
        _ => {
            warn!(target = %target, "Unknown SQS operation");
            Err(SqsError::InvalidAction(target.to_string()))
        }
    };

    match result {
        Ok(response) => json_response(response),
        Err(err) => {
            debug!(action = %action, error = %err, "SQS request failed");
            error_response(err)
        }
    }
}

// === Queue management ===

fn handle_create_queue(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let name = required_str(body, "QueueName")?;
    let attributes = string_map(body, "Attributes")?;
    let url = service.create_queue(name, &attributes)?;
    Ok(json!({ "QueueUrl": url }))
}

fn handle_delete_queue(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    service.delete_queue(required_str(body, "QueueUrl")?)?;
    Ok(json!({}))
}

fn handle_get_queue_url(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let name = required_str(body, "QueueName")?;
    let owner = optional_str(body, "QueueOwnerAWSAccountId");
    let url = service.get_queue_url(name, owner)?;
    Ok(json!({ "QueueUrl": url }))
}

fn handle_list_queues(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let prefix = optional_str(body, "QueueNamePrefix");
    let max_results = optional_u32(body, "MaxResults")?;
    let urls = service.list_queues(prefix, max_results)?;
    if urls.is_empty() {
        return Ok(json!({}));
    }
    Ok(json!({ "QueueUrls": urls }))
}

fn handle_get_queue_attributes(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let url = required_str(body, "QueueUrl")?;
    let names = string_list(body, "AttributeNames");
    let attributes = service.get_queue_attributes(url, &names)?;
    if attributes.is_empty() {
        return Ok(json!({}));
    }
    Ok(json!({ "Attributes": attributes }))
}

fn handle_set_queue_attributes(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let url = required_str(body, "QueueUrl")?;
    let attributes = string_map(body, "Attributes")?;
    service.set_queue_attributes(url, &attributes)?;
    Ok(json!({}))
}

fn handle_purge_queue(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    service.purge_queue(required_str(body, "QueueUrl")?)?;
    Ok(json!({}))
}

fn handle_list_dead_letter_source_queues(
    service: &SqsService,
    body: &Value,
) -> Result<Value, SqsError> {
    let urls = service.list_dead_letter_source_queues(required_str(body, "QueueUrl")?)?;
    Ok(json!({ "queueUrls": urls }))
}

// === Messages ===

fn handle_send_message(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let url = required_str(body, "QueueUrl")?;
    let input = parse_send_input(body)?;
    let output = service.send_message(url, input)?;
    Ok(send_output_json(&output, None))
}

fn handle_send_message_batch(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let url = required_str(body, "QueueUrl")?;

    let mut entries = Vec::new();
    let mut invalid = BatchOutcome::<()>::default();
    for entry in array(body, "Entries") {
        let id = required_str(entry, "Id")?.to_string();
        match parse_send_input(entry) {
            Ok(input) => entries.push(SendMessageBatchEntry { id, input }),
            // Malformed entries fail on their own without touching the queue
            Err(err) => invalid.record(&id, Err(err)),
        }
    }

    let mut outcome = if entries.is_empty() && !invalid.failed.is_empty() {
        BatchOutcome::default()
    } else {
        service.send_message_batch(url, entries)?
    };
    outcome.failed.extend(invalid.failed);

    let successful: Vec<Value> = outcome
        .successful
        .iter()
        .map(|(id, output)| send_output_json(output, Some(id)))
        .collect();
    Ok(json!({ "Successful": successful, "Failed": failed_json(&outcome) }))
}

async fn handle_receive_message(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let url = required_str(body, "QueueUrl")?;

    let mut attribute_names = string_list(body, "AttributeNames");
    attribute_names.extend(string_list(body, "MessageSystemAttributeNames"));

    let request = ReceiveMessageRequest {
        max_number_of_messages: optional_u32(body, "MaxNumberOfMessages")?,
        wait_time_seconds: optional_u32(body, "WaitTimeSeconds")?,
        visibility_timeout: optional_u32(body, "VisibilityTimeout")?,
        attribute_names,
        message_attribute_names: string_list(body, "MessageAttributeNames"),
    };

    let messages = service.receive_message(url, request).await?;
    if messages.is_empty() {
        return Ok(json!({}));
    }
    let messages: Vec<Value> = messages.iter().map(received_message_json).collect();
    Ok(json!({ "Messages": messages }))
}

fn handle_delete_message(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let url = required_str(body, "QueueUrl")?;
    service.delete_message(url, required_str(body, "ReceiptHandle")?)?;
    Ok(json!({}))
}

fn handle_delete_message_batch(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let url = required_str(body, "QueueUrl")?;
    let entries = array(body, "Entries")
        .iter()
        .map(|entry| {
            Ok(DeleteMessageBatchEntry {
                id: required_str(entry, "Id")?.to_string(),
                receipt_handle: required_str(entry, "ReceiptHandle")?.to_string(),
            })
        })
        .collect::<Result<Vec<_>, SqsError>>()?;

    let outcome = service.delete_message_batch(url, entries)?;
    Ok(json!({ "Successful": successful_ids_json(&outcome), "Failed": failed_json(&outcome) }))
}

fn handle_change_message_visibility(
    service: &SqsService,
    body: &Value,
) -> Result<Value, SqsError> {
    let url = required_str(body, "QueueUrl")?;
    let handle = required_str(body, "ReceiptHandle")?;
    let timeout = required_u32(body, "VisibilityTimeout")?;
    service.change_message_visibility(url, handle, timeout)?;
    Ok(json!({}))
}

fn handle_change_message_visibility_batch(
    service: &SqsService,
    body: &Value,
) -> Result<Value, SqsError> {
    let url = required_str(body, "QueueUrl")?;
    let entries = array(body, "Entries")
        .iter()
        .map(|entry| {
            Ok(ChangeVisibilityBatchEntry {
                id: required_str(entry, "Id")?.to_string(),
                receipt_handle: required_str(entry, "ReceiptHandle")?.to_string(),
                visibility_timeout: required_u32(entry, "VisibilityTimeout")?,
            })
        })
        .collect::<Result<Vec<_>, SqsError>>()?;

    let outcome = service.change_message_visibility_batch(url, entries)?;
    Ok(json!({ "Successful": successful_ids_json(&outcome), "Failed": failed_json(&outcome) }))
}

// === Move tasks ===

fn handle_start_message_move_task(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let source_arn = required_str(body, "SourceArn")?;
    let destination_arn = optional_str(body, "DestinationArn");
    let rate = optional_u32(body, "MaxNumberOfMessagesPerSecond")?;
    let handle = service.start_message_move_task(source_arn, destination_arn, rate)?;
    Ok(json!({ "TaskHandle": handle }))
}

fn handle_cancel_message_move_task(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let moved = service.cancel_message_move_task(required_str(body, "TaskHandle")?)?;
    Ok(json!({ "ApproximateNumberOfMessagesMoved": moved }))
}

fn handle_list_message_move_tasks(service: &SqsService, body: &Value) -> Result<Value, SqsError> {
    let source_arn = required_str(body, "SourceArn")?;
    let max_results = optional_u32(body, "MaxResults")?;
    let tasks = service.list_message_move_tasks(source_arn, max_results)?;
    let results: Vec<Value> = tasks.iter().map(move_task_json).collect();
    Ok(json!({ "Results": results }))
}

// === Request parsing ===

fn required_str<'a>(body: &'a Value, field: &str) -> Result<&'a str, SqsError> {
    optional_str(body, field).ok_or_else(|| {
        SqsError::MissingParameter(format!("The request must contain the parameter {}.", field))
    })
}

fn optional_str<'a>(body: &'a Value, field: &str) -> Option<&'a str> {
    body.get(field).and_then(Value::as_str)
}

/// Numbers may arrive as JSON numbers or numeric strings
fn optional_u32(body: &Value, field: &str) -> Result<Option<u32>, SqsError> {
    let Some(value) = body.get(field).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .and_then(|n| u32::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| SqsError::invalid_value(field, value, "Must be a non-negative integer."))
}

fn required_u32(body: &Value, field: &str) -> Result<u32, SqsError> {
    optional_u32(body, field)?.ok_or_else(|| {
        SqsError::MissingParameter(format!("The request must contain the parameter {}.", field))
    })
}

fn array<'a>(body: &'a Value, field: &str) -> &'a [Value] {
    body.get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn string_list(body: &Value, field: &str) -> Vec<String> {
    array(body, field)
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn string_map(body: &Value, field: &str) -> Result<HashMap<String, String>, SqsError> {
    let Some(map) = body.get(field).and_then(Value::as_object) else {
        return Ok(HashMap::new());
    };
    map.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(SqsError::InvalidAttributeValue(format!(
                        "Invalid value for the parameter {}: {}",
                        key, other
                    )))
                }
            };
            Ok((key.clone(), value))
        })
        .collect()
}

fn parse_send_input(body: &Value) -> Result<SendMessageInput, SqsError> {
    let message_body = required_str(body, "MessageBody")?;

    Ok(SendMessageInput {
        body: message_body.to_string(),
        delay_seconds: optional_u32(body, "DelaySeconds")?,
        message_attributes: parse_message_attributes(body.get("MessageAttributes"))?,
        trace_header: parse_system_attributes(body.get("MessageSystemAttributes"))?,
        message_group_id: optional_str(body, "MessageGroupId").map(str::to_string),
        message_deduplication_id: optional_str(body, "MessageDeduplicationId").map(str::to_string),
    })
}

fn parse_message_attributes(
    value: Option<&Value>,
) -> Result<HashMap<String, MessageAttributeValue>, SqsError> {
    let Some(map) = value.and_then(Value::as_object) else {
        return Ok(HashMap::new());
    };

    map.iter()
        .map(|(name, attr)| Ok((name.clone(), parse_attribute_value(name, attr)?)))
        .collect()
}

fn parse_attribute_value(name: &str, attr: &Value) -> Result<MessageAttributeValue, SqsError> {
    let data_type = optional_str(attr, "DataType")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            SqsError::InvalidParameterValue(format!(
                "The message attribute '{}' must contain non-empty message attribute type.",
                name
            ))
        })?;

    let binary = match optional_str(attr, "BinaryValue") {
        Some(encoded) => Some(STANDARD.decode(encoded).map_err(|_| {
            SqsError::InvalidParameterValue(format!(
                "The message attribute '{}' has an invalid binary value.",
                name
            ))
        })?),
        None => None,
    };
    let has_list_values = ["StringListValues", "BinaryListValues"]
        .iter()
        .any(|field| !array(attr, field).is_empty());

    MessageAttributeValue::from_parts(
        name,
        data_type,
        optional_str(attr, "StringValue").map(str::to_string),
        binary,
        has_list_values,
    )
}

/// Only the trace header is accepted as a system attribute
fn parse_system_attributes(value: Option<&Value>) -> Result<Option<String>, SqsError> {
    let Some(map) = value.and_then(Value::as_object) else {
        return Ok(None);
    };

    let mut trace_header = None;
    for (name, attr) in map {
        if name != TRACE_HEADER {
            return Err(SqsError::InvalidParameterValue(format!(
                "Message system attribute name '{}' is invalid.",
                name
            )));
        }
        let value = parse_attribute_value(name, attr)?;
        if let AttributeData::String(header) = value.data {
            trace_header = Some(header);
        }
    }
    Ok(trace_header)
}

// === Response shaping ===

fn send_output_json(output: &SendMessageOutput, id: Option<&str>) -> Value {
    let mut map = Map::new();
    if let Some(id) = id {
        map.insert("Id".into(), json!(id));
    }
    map.insert("MessageId".into(), json!(output.message_id));
    map.insert("MD5OfMessageBody".into(), json!(output.md5_of_message_body));
    if let Some(ref md5) = output.md5_of_message_attributes {
        map.insert("MD5OfMessageAttributes".into(), json!(md5));
    }
    if let Some(ref md5) = output.md5_of_message_system_attributes {
        map.insert("MD5OfMessageSystemAttributes".into(), json!(md5));
    }
    if let Some(ref seq) = output.sequence_number {
        map.insert("SequenceNumber".into(), json!(seq));
    }
    Value::Object(map)
}

fn received_message_json(message: &ReceivedMessage) -> Value {
    let mut map = Map::new();
    map.insert("MessageId".into(), json!(message.message_id));
    map.insert("ReceiptHandle".into(), json!(message.receipt_handle));
    map.insert("MD5OfBody".into(), json!(message.md5_of_body));
    map.insert("Body".into(), json!(message.body));
    if !message.attributes.is_empty() {
        map.insert("Attributes".into(), json!(message.attributes));
    }
    if !message.message_attributes.is_empty() {
        let attrs: Map<String, Value> = message
            .message_attributes
            .iter()
            .map(|(name, value)| (name.clone(), attribute_value_json(value)))
            .collect();
        map.insert("MessageAttributes".into(), Value::Object(attrs));
    }
    if let Some(ref md5) = message.md5_of_message_attributes {
        map.insert("MD5OfMessageAttributes".into(), json!(md5));
    }
    Value::Object(map)
}

fn attribute_value_json(value: &MessageAttributeValue) -> Value {
    match &value.data {
        AttributeData::String(s) => json!({ "DataType": value.data_type, "StringValue": s }),
        AttributeData::Binary(b) => {
            json!({ "DataType": value.data_type, "BinaryValue": STANDARD.encode(b) })
        }
    }
}

fn successful_ids_json(outcome: &BatchOutcome<()>) -> Vec<Value> {
    outcome
        .successful
        .iter()
        .map(|(id, _)| json!({ "Id": id }))
        .collect()
}

fn failed_json<T>(outcome: &BatchOutcome<T>) -> Vec<Value> {
    outcome
        .failed
        .iter()
        .map(|entry| {
            json!({
                "Id": entry.id,
                "Code": entry.code,
                "Message": entry.message,
                "SenderFault": entry.sender_fault,
            })
        })
        .collect()
}

fn move_task_json(task: &MoveTaskSummary) -> Value {
    let mut map = Map::new();
    if let Some(ref handle) = task.task_handle {
        map.insert("TaskHandle".into(), json!(handle));
    }
    map.insert("Status".into(), json!(task.status.as_str()));
    map.insert("SourceArn".into(), json!(task.source_arn));
    if let Some(ref arn) = task.destination_arn {
        map.insert("DestinationArn".into(), json!(arn));
    }
    if let Some(rate) = task.max_number_of_messages_per_second {
        map.insert("MaxNumberOfMessagesPerSecond".into(), json!(rate));
    }
    map.insert(
        "ApproximateNumberOfMessagesMoved".into(),
        json!(task.approximate_number_of_messages_moved),
    );
    map.insert(
        "ApproximateNumberOfMessagesToMove".into(),
        json!(task.approximate_number_of_messages_to_move),
    );
    if let Some(ref reason) = task.failure_reason {
        map.insert("FailureReason".into(), json!(reason));
    }
    map.insert("StartedTimestamp".into(), json!(task.started_timestamp));
    Value::Object(map)
}

fn json_response(body: Value) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, CONTENT_TYPE)],
        body.to_string(),
    )
        .into_response()
}

/// Render a failure as a JSON error; the legacy query code goes in
/// `x-amzn-query-error` for SDKs that still expect it
fn error_response(err: SqsError) -> Response {
    let err = AwsError::from(err);
    let status =
        StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
    let fault = if err.code.is_sender_fault() {
        "Sender"
    } else {
        "Receiver"
    };

    let mut response = (
        status,
        [(header::CONTENT_TYPE, CONTENT_TYPE)],
        err.to_json(),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("{};{}", err.code.query_code(), fault)) {
        response.headers_mut().insert("x-amzn-query-error", value);
    }
    if let Ok(value) = HeaderValue::from_str(&err.request_id) {
        response.headers_mut().insert("x-amzn-requestid", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_u32_accepts_strings() {
        let body = json!({ "A": 5, "B": "7", "C": "x", "D": -1 });
        assert_eq!(optional_u32(&body, "A").unwrap(), Some(5));
        assert_eq!(optional_u32(&body, "B").unwrap(), Some(7));
        assert!(optional_u32(&body, "C").is_err());
        assert!(optional_u32(&body, "D").is_err());
        assert_eq!(optional_u32(&body, "Missing").unwrap(), None);
    }

    #[test]
    fn test_parse_send_input() {
        let body = json!({
            "MessageBody": "hello",
            "MessageAttributes": {
                "kind": { "DataType": "String", "StringValue": "greeting" },
                "blob": { "DataType": "Binary", "BinaryValue": STANDARD.encode(b"\x01\x02") }
            },
            "MessageSystemAttributes": {
                "AWSTraceHeader": { "DataType": "String", "StringValue": "Root=1-abc" }
            }
        });
        let input = parse_send_input(&body).unwrap();
        assert_eq!(input.body, "hello");
        assert_eq!(input.message_attributes.len(), 2);
        assert_eq!(
            input.message_attributes["blob"].data,
            AttributeData::Binary(vec![1, 2])
        );
        assert_eq!(input.trace_header.as_deref(), Some("Root=1-abc"));
    }

    #[test]
    fn test_unknown_system_attribute_rejected() {
        let body = json!({
            "MessageBody": "hello",
            "MessageSystemAttributes": {
                "Other": { "DataType": "String", "StringValue": "x" }
            }
        });
        assert!(matches!(
            parse_send_input(&body),
            Err(SqsError::InvalidParameterValue(_))
        ));
    }

    #[test]
    fn test_list_values_unsupported() {
        let body = json!({
            "MessageBody": "hello",
            "MessageAttributes": {
                "tags": { "DataType": "String", "StringListValues": ["a"] }
            }
        });
        assert!(matches!(
            parse_send_input(&body),
            Err(SqsError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_error_response_headers() {
        let response = error_response(SqsError::QueueDoesNotExist);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()["x-amzn-query-error"],
            "AWS.SimpleQueueService.NonExistentQueue;Sender"
        );
    }
}
