//! SQS error taxonomy

use queuestack_core::{AwsError, ErrorCode};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqsError {
    #[error("{0}")]
    MissingParameter(String),

    #[error("{0}")]
    InvalidParameterValue(String),

    #[error("{0}")]
    InvalidAttributeName(String),

    #[error("{0}")]
    InvalidAttributeValue(String),

    #[error("{0}")]
    UnsupportedOperation(String),

    #[error("{0}")]
    OverLimit(String),

    #[error("{0}")]
    ResourceNotFound(String),

    #[error("{0}")]
    ReceiptHandleIsInvalid(String),

    #[error("The specified queue does not exist.")]
    QueueDoesNotExist,

    #[error("A queue already exists with the same name and a different value for attribute {0}")]
    QueueAlreadyExists(String),

    #[error("You must wait 60 seconds after deleting a queue before you can create another with the same name.")]
    QueueDeletedRecently,

    #[error("Only one PurgeQueue operation on {0} is allowed every 60 seconds.")]
    PurgeQueueInProgress(String),

    #[error("There should be at least one {0} in the request.")]
    EmptyBatchRequest(String),

    #[error("Maximum number of entries per request are 10. You have sent {0}.")]
    TooManyEntriesInBatchRequest(usize),

    #[error("Id {0} repeated.")]
    BatchEntryIdsNotDistinct(String),

    #[error("Unknown operation: {0}")]
    InvalidAction(String),
}

impl SqsError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingParameter(_) => ErrorCode::MissingParameter,
            Self::InvalidParameterValue(_) => ErrorCode::InvalidParameterValue,
            Self::InvalidAttributeName(_) => ErrorCode::InvalidAttributeName,
            Self::InvalidAttributeValue(_) => ErrorCode::InvalidAttributeValue,
            Self::UnsupportedOperation(_) => ErrorCode::UnsupportedOperation,
            Self::OverLimit(_) => ErrorCode::OverLimit,
            Self::ResourceNotFound(_) => ErrorCode::ResourceNotFound,
            Self::ReceiptHandleIsInvalid(_) => ErrorCode::ReceiptHandleIsInvalid,
            Self::QueueDoesNotExist => ErrorCode::QueueDoesNotExist,
            Self::QueueAlreadyExists(_) => ErrorCode::QueueAlreadyExists,
            Self::QueueDeletedRecently => ErrorCode::QueueDeletedRecently,
            Self::PurgeQueueInProgress(_) => ErrorCode::PurgeQueueInProgress,
            Self::EmptyBatchRequest(_) => ErrorCode::EmptyBatchRequest,
            Self::TooManyEntriesInBatchRequest(_) => ErrorCode::TooManyEntriesInBatchRequest,
            Self::BatchEntryIdsNotDistinct(_) => ErrorCode::BatchEntryIdsNotDistinct,
            Self::InvalidAction(_) => ErrorCode::InvalidAction,
        }
    }

    /// Shorthand for the common "Value X for parameter Y is invalid" failure
    pub(crate) fn invalid_value(parameter: &str, value: impl std::fmt::Display, reason: &str) -> Self {
        Self::InvalidParameterValue(format!(
            "Value {} for parameter {} is invalid. Reason: {}",
            value, parameter, reason
        ))
    }
}

impl From<SqsError> for AwsError {
    fn from(err: SqsError) -> Self {
        AwsError::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SqsError::QueueDoesNotExist.code().query_code(),
            "AWS.SimpleQueueService.NonExistentQueue"
        );
        assert_eq!(
            SqsError::OverLimit("x".into()).code(),
            ErrorCode::OverLimit
        );
    }

    #[test]
    fn test_invalid_value_message() {
        let err = SqsError::invalid_value("DelaySeconds", 901, "out of range");
        assert_eq!(
            err.to_string(),
            "Value 901 for parameter DelaySeconds is invalid. Reason: out of range"
        );
    }

    #[test]
    fn test_into_aws_error() {
        let aws: AwsError = SqsError::ReceiptHandleIsInvalid("nope".into()).into();
        assert_eq!(aws.code, ErrorCode::ReceiptHandleIsInvalid);
        assert_eq!(aws.message, "nope");
    }
}
