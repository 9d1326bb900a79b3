//! AWS error types and formatting

use serde::Serialize;
use thiserror::Error;

/// SQS error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Request shape
    MissingParameter,
    InvalidParameterValue,
    InvalidAttributeName,
    InvalidAttributeValue,
    UnsupportedOperation,
    InvalidAction,

    // Capacity
    OverLimit,

    // Resources
    ResourceNotFound,
    QueueDoesNotExist,
    QueueAlreadyExists,
    QueueDeletedRecently,
    PurgeQueueInProgress,

    // Receipt handles
    ReceiptHandleIsInvalid,

    // Batches
    EmptyBatchRequest,
    TooManyEntriesInBatchRequest,
    BatchEntryIdsNotDistinct,

    InternalError,
}

impl ErrorCode {
    /// Short error name used in the JSON protocol `__type`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingParameter => "MissingParameter",
            Self::InvalidParameterValue => "InvalidParameterValue",
            Self::InvalidAttributeName => "InvalidAttributeName",
            Self::InvalidAttributeValue => "InvalidAttributeValue",
            Self::UnsupportedOperation => "UnsupportedOperation",
            Self::InvalidAction => "InvalidAction",
            Self::OverLimit => "OverLimit",
            Self::ResourceNotFound => "ResourceNotFoundException",
            Self::QueueDoesNotExist => "QueueDoesNotExist",
            Self::QueueAlreadyExists => "QueueNameExists",
            Self::QueueDeletedRecently => "QueueDeletedRecently",
            Self::PurgeQueueInProgress => "PurgeQueueInProgress",
            Self::ReceiptHandleIsInvalid => "ReceiptHandleIsInvalid",
            Self::EmptyBatchRequest => "EmptyBatchRequest",
            Self::TooManyEntriesInBatchRequest => "TooManyEntriesInBatchRequest",
            Self::BatchEntryIdsNotDistinct => "BatchEntryIdsNotDistinct",
            Self::InternalError => "InternalError",
        }
    }

    /// Legacy query-protocol code, sent in `x-amzn-query-error`
    pub fn query_code(&self) -> &'static str {
        match self {
            Self::QueueDoesNotExist => "AWS.SimpleQueueService.NonExistentQueue",
            Self::QueueAlreadyExists => "QueueAlreadyExists",
            Self::QueueDeletedRecently => "AWS.SimpleQueueService.QueueDeletedRecently",
            Self::PurgeQueueInProgress => "AWS.SimpleQueueService.PurgeQueueInProgress",
            Self::EmptyBatchRequest => "AWS.SimpleQueueService.EmptyBatchRequest",
            Self::TooManyEntriesInBatchRequest => {
                "AWS.SimpleQueueService.TooManyEntriesInBatchRequest"
            }
            Self::BatchEntryIdsNotDistinct => "AWS.SimpleQueueService.BatchEntryIdsNotDistinct",
            Self::UnsupportedOperation => "AWS.SimpleQueueService.UnsupportedOperation",
            other => other.as_str(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::OverLimit | Self::PurgeQueueInProgress => 403,
            Self::ResourceNotFound | Self::ReceiptHandleIsInvalid => 404,
            Self::InternalError => 500,
            _ => 400,
        }
    }

    /// Whether the caller is at fault
    pub fn is_sender_fault(&self) -> bool {
        !matches!(self, Self::InternalError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AWS-style error
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct AwsError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: String,
}

impl AwsError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Format as JSON-protocol error
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        struct JsonError<'a> {
            #[serde(rename = "__type")]
            error_type: String,
            message: &'a str,
        }

        let error = JsonError {
            error_type: format!("com.amazonaws.sqs#{}", self.code.as_str()),
            message: &self.message,
        };

        serde_json::to_string(&error).unwrap_or_else(|_| {
            format!(
                r#"{{"__type":"com.amazonaws.sqs#{}","message":"{}"}}"#,
                self.code.as_str(),
                self.message
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_json_format() {
        let error = AwsError::new(ErrorCode::ReceiptHandleIsInvalid, "bad handle");

        let json = error.to_json();
        assert!(json.contains("com.amazonaws.sqs#ReceiptHandleIsInvalid"));
        assert!(json.contains("bad handle"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ErrorCode::OverLimit.http_status(), 403);
        assert_eq!(ErrorCode::ResourceNotFound.http_status(), 404);
        assert_eq!(ErrorCode::InvalidParameterValue.http_status(), 400);
        assert!(!ErrorCode::InternalError.is_sender_fault());
    }
}
