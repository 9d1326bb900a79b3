//! Typed queue configuration
//!
//! Attribute maps arrive as loosely typed `name -> string` pairs. They are
//! validated once here into [`QueueAttributes`]; the rest of the engine only
//! ever sees the typed form.

use std::collections::HashMap;

use crate::error::SqsError;

pub const FIFO_IN_FLIGHT_LIMIT: usize = 20_000;
pub const STANDARD_IN_FLIGHT_LIMIT: usize = 120_000;

pub const MAX_VISIBILITY_TIMEOUT: u32 = 43_200;
pub const MAX_DELAY_SECONDS: u32 = 900;
pub const MAX_WAIT_TIME_SECONDS: u32 = 20;

/// Every attribute name the service recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueAttributeName {
    All,
    VisibilityTimeout,
    MessageRetentionPeriod,
    DelaySeconds,
    MaximumMessageSize,
    ReceiveMessageWaitTimeSeconds,
    RedrivePolicy,
    FifoQueue,
    ContentBasedDeduplication,
    DeduplicationScope,
    QueueArn,
    CreatedTimestamp,
    LastModifiedTimestamp,
    ApproximateNumberOfMessages,
    ApproximateNumberOfMessagesNotVisible,
    ApproximateNumberOfMessagesDelayed,
}

impl QueueAttributeName {
    pub const READABLE: [QueueAttributeName; 15] = [
        Self::VisibilityTimeout,
        Self::MessageRetentionPeriod,
        Self::DelaySeconds,
        Self::MaximumMessageSize,
        Self::ReceiveMessageWaitTimeSeconds,
        Self::RedrivePolicy,
        Self::FifoQueue,
        Self::ContentBasedDeduplication,
        Self::DeduplicationScope,
        Self::QueueArn,
        Self::CreatedTimestamp,
        Self::LastModifiedTimestamp,
        Self::ApproximateNumberOfMessages,
        Self::ApproximateNumberOfMessagesNotVisible,
        Self::ApproximateNumberOfMessagesDelayed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "All",
            Self::VisibilityTimeout => "VisibilityTimeout",
            Self::MessageRetentionPeriod => "MessageRetentionPeriod",
            Self::DelaySeconds => "DelaySeconds",
            Self::MaximumMessageSize => "MaximumMessageSize",
            Self::ReceiveMessageWaitTimeSeconds => "ReceiveMessageWaitTimeSeconds",
            Self::RedrivePolicy => "RedrivePolicy",
            Self::FifoQueue => "FifoQueue",
            Self::ContentBasedDeduplication => "ContentBasedDeduplication",
            Self::DeduplicationScope => "DeduplicationScope",
            Self::QueueArn => "QueueArn",
            Self::CreatedTimestamp => "CreatedTimestamp",
            Self::LastModifiedTimestamp => "LastModifiedTimestamp",
            Self::ApproximateNumberOfMessages => "ApproximateNumberOfMessages",
            Self::ApproximateNumberOfMessagesNotVisible => "ApproximateNumberOfMessagesNotVisible",
            Self::ApproximateNumberOfMessagesDelayed => "ApproximateNumberOfMessagesDelayed",
        }
    }

    pub fn parse(name: &str) -> Result<Self, SqsError> {
        if name == "All" {
            return Ok(Self::All);
        }
        Self::READABLE
            .into_iter()
            .find(|attr| attr.as_str() == name)
            .ok_or_else(|| SqsError::InvalidAttributeName(format!("Unknown Attribute {}.", name)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeduplicationScope {
    #[default]
    Queue,
    MessageGroup,
}

impl DeduplicationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::MessageGroup => "messageGroup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn from_json(s: &str) -> Result<Self, SqsError> {
        let invalid = |reason: &str| {
            SqsError::InvalidAttributeValue(format!(
                "Value {} for parameter RedrivePolicy is invalid. Reason: {}",
                s, reason
            ))
        };

        let v: serde_json::Value =
            serde_json::from_str(s).map_err(|_| invalid("Redrive policy is not a valid JSON map."))?;
        let arn = v
            .get("deadLetterTargetArn")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("Redrive policy does not contain mandatory attribute: deadLetterTargetArn."))?
            .to_string();
        let max_count = v
            .get("maxReceiveCount")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| invalid("Redrive policy does not contain mandatory attribute: maxReceiveCount."))?;

        if !(1..=1000).contains(&max_count) {
            return Err(invalid("Invalid value for maxReceiveCount: must be between 1 and 1000."));
        }

        Ok(Self {
            dead_letter_target_arn: arn,
            max_receive_count: max_count as u32,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "deadLetterTargetArn": self.dead_letter_target_arn,
            "maxReceiveCount": self.max_receive_count,
        })
        .to_string()
    }
}

/// Validated queue configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAttributes {
    pub visibility_timeout: u32,
    pub message_retention_period: u32,
    pub delay_seconds: u32,
    pub maximum_message_size: u32,
    pub receive_message_wait_time_seconds: u32,
    pub redrive_policy: Option<RedrivePolicy>,
    pub fifo_queue: bool,
    pub content_based_deduplication: bool,
    pub deduplication_scope: DeduplicationScope,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        Self {
            visibility_timeout: 30,
            message_retention_period: 345_600, // 4 days
            delay_seconds: 0,
            maximum_message_size: 262_144, // 256KB
            receive_message_wait_time_seconds: 0,
            redrive_policy: None,
            fifo_queue: false,
            content_based_deduplication: false,
            deduplication_scope: DeduplicationScope::Queue,
        }
    }
}

impl QueueAttributes {
    /// Build the configuration for a new queue
    pub fn for_new_queue(name: &str, attrs: &HashMap<String, String>) -> Result<Self, SqsError> {
        let wants_fifo = attrs.get("FifoQueue").map(|v| v == "true").unwrap_or(false);
        let fifo_name = name.ends_with(".fifo");

        if wants_fifo != fifo_name {
            return Err(SqsError::InvalidParameterValue(
                "The name of a FIFO queue can only include alphanumeric characters, hyphens, or underscores, must end with .fifo suffix and be 1 to 80 in length".to_string(),
            ));
        }

        let mut attributes = Self {
            fifo_queue: fifo_name,
            ..Self::default()
        };
        attributes.apply(attrs, true)?;
        Ok(attributes)
    }

    pub fn in_flight_limit(&self) -> usize {
        if self.fifo_queue {
            FIFO_IN_FLIGHT_LIMIT
        } else {
            STANDARD_IN_FLIGHT_LIMIT
        }
    }

    /// Validate every entry, then apply them all at once
    pub fn apply(&mut self, attrs: &HashMap<String, String>, creating: bool) -> Result<(), SqsError> {
        let mut next = self.clone();

        for (key, value) in attrs {
            match QueueAttributeName::parse(key)? {
                QueueAttributeName::VisibilityTimeout => {
                    next.visibility_timeout = parse_ranged(key, value, 0, MAX_VISIBILITY_TIMEOUT)?;
                }
                QueueAttributeName::MessageRetentionPeriod => {
                    next.message_retention_period = parse_ranged(key, value, 60, 1_209_600)?;
                }
                QueueAttributeName::DelaySeconds => {
                    next.delay_seconds = parse_ranged(key, value, 0, MAX_DELAY_SECONDS)?;
                }
                QueueAttributeName::MaximumMessageSize => {
                    next.maximum_message_size = parse_ranged(key, value, 1024, 262_144)?;
                }
                QueueAttributeName::ReceiveMessageWaitTimeSeconds => {
                    next.receive_message_wait_time_seconds =
                        parse_ranged(key, value, 0, MAX_WAIT_TIME_SECONDS)?;
                }
                QueueAttributeName::RedrivePolicy => {
                    next.redrive_policy = if value.is_empty() {
                        None
                    } else {
                        Some(RedrivePolicy::from_json(value)?)
                    };
                }
                QueueAttributeName::FifoQueue => {
                    // Fixed at creation
                    if !creating {
                        return Err(SqsError::InvalidAttributeName(format!(
                            "Unknown Attribute {}.",
                            key
                        )));
                    }
                }
                QueueAttributeName::ContentBasedDeduplication => {
                    if !next.fifo_queue {
                        return Err(SqsError::InvalidAttributeName(format!(
                            "Unknown Attribute {}.",
                            key
                        )));
                    }
                    next.content_based_deduplication = parse_bool(key, value)?;
                }
                QueueAttributeName::DeduplicationScope => {
                    if !next.fifo_queue {
                        return Err(SqsError::InvalidAttributeName(format!(
                            "Unknown Attribute {}.",
                            key
                        )));
                    }
                    next.deduplication_scope = match value.as_str() {
                        "queue" => DeduplicationScope::Queue,
                        "messageGroup" => DeduplicationScope::MessageGroup,
                        _ => {
                            return Err(SqsError::InvalidAttributeValue(format!(
                                "Invalid value for the parameter {}.",
                                key
                            )))
                        }
                    };
                }
                _ => {
                    return Err(SqsError::InvalidAttributeName(format!(
                        "Unknown Attribute {}.",
                        key
                    )))
                }
            }
        }

        *self = next;
        Ok(())
    }

    /// Stored (non-computed) attributes keyed by name
    pub fn stored_value(&self, name: QueueAttributeName) -> Option<String> {
        let value = match name {
            QueueAttributeName::VisibilityTimeout => self.visibility_timeout.to_string(),
            QueueAttributeName::MessageRetentionPeriod => self.message_retention_period.to_string(),
            QueueAttributeName::DelaySeconds => self.delay_seconds.to_string(),
            QueueAttributeName::MaximumMessageSize => self.maximum_message_size.to_string(),
            QueueAttributeName::ReceiveMessageWaitTimeSeconds => {
                self.receive_message_wait_time_seconds.to_string()
            }
            QueueAttributeName::RedrivePolicy => self.redrive_policy.as_ref()?.to_json(),
            QueueAttributeName::FifoQueue if self.fifo_queue => "true".to_string(),
            QueueAttributeName::ContentBasedDeduplication if self.fifo_queue => {
                self.content_based_deduplication.to_string()
            }
            QueueAttributeName::DeduplicationScope if self.fifo_queue => {
                self.deduplication_scope.as_str().to_string()
            }
            _ => return None,
        };
        Some(value)
    }
}

fn parse_ranged(key: &str, value: &str, min: u32, max: u32) -> Result<u32, SqsError> {
    value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|v| (min..=max).contains(v))
        .ok_or_else(|| {
            SqsError::InvalidAttributeValue(format!("Invalid value for the parameter {}.", key))
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SqsError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(SqsError::InvalidAttributeValue(format!(
            "Invalid value for the parameter {}.",
            key
        ))),
    }
}

/// Queue names: 1-80 chars of alphanumerics, hyphens and underscores,
/// optionally followed by `.fifo`.
pub fn validate_queue_name(name: &str) -> Result<(), SqsError> {
    let base = name.strip_suffix(".fifo").unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= 80
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(SqsError::InvalidParameterValue(
            "Can only include alphanumeric characters, hyphens, or underscores. 1 to 80 in length"
                .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let a = QueueAttributes::for_new_queue("orders", &HashMap::new()).unwrap();
        assert_eq!(a.visibility_timeout, 30);
        assert!(!a.fifo_queue);
        assert_eq!(a.in_flight_limit(), STANDARD_IN_FLIGHT_LIMIT);
    }

    #[test]
    fn test_fifo_requires_suffix() {
        let err = QueueAttributes::for_new_queue("orders", &attrs(&[("FifoQueue", "true")]));
        assert!(matches!(err, Err(SqsError::InvalidParameterValue(_))));

        let a = QueueAttributes::for_new_queue("orders.fifo", &attrs(&[("FifoQueue", "true")]))
            .unwrap();
        assert!(a.fifo_queue);
        assert_eq!(a.in_flight_limit(), FIFO_IN_FLIGHT_LIMIT);
    }

    #[test]
    fn test_apply_is_atomic() {
        let mut a = QueueAttributes::default();
        let result = a.apply(
            &attrs(&[("VisibilityTimeout", "10"), ("DelaySeconds", "901")]),
            false,
        );
        assert!(matches!(result, Err(SqsError::InvalidAttributeValue(_))));
        assert_eq!(a.visibility_timeout, 30);
    }

    #[test]
    fn test_unknown_attribute() {
        let mut a = QueueAttributes::default();
        let result = a.apply(&attrs(&[("Bogus", "1")]), false);
        assert!(matches!(result, Err(SqsError::InvalidAttributeName(_))));
    }

    #[test]
    fn test_fifo_attribute_immutable() {
        let mut a = QueueAttributes::default();
        let result = a.apply(&attrs(&[("FifoQueue", "true")]), false);
        assert!(matches!(result, Err(SqsError::InvalidAttributeName(_))));
    }

    #[test]
    fn test_redrive_policy_parsing() {
        let policy = RedrivePolicy::from_json(
            r#"{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:000000000000:dlq","maxReceiveCount":"3"}"#,
        )
        .unwrap();
        assert_eq!(policy.max_receive_count, 3);
        assert_eq!(
            policy.dead_letter_target_arn,
            "arn:aws:sqs:us-east-1:000000000000:dlq"
        );

        assert!(RedrivePolicy::from_json(r#"{"maxReceiveCount":3}"#).is_err());
        assert!(RedrivePolicy::from_json("not json").is_err());
        assert!(RedrivePolicy::from_json(
            r#"{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:000000000000:dlq","maxReceiveCount":0}"#
        )
        .is_err());
    }

    #[test]
    fn test_deduplication_scope() {
        let a = QueueAttributes::for_new_queue(
            "jobs.fifo",
            &attrs(&[("FifoQueue", "true"), ("DeduplicationScope", "messageGroup")]),
        )
        .unwrap();
        assert_eq!(a.deduplication_scope, DeduplicationScope::MessageGroup);

        let err = QueueAttributes::for_new_queue("jobs", &attrs(&[("DeduplicationScope", "queue")]));
        assert!(matches!(err, Err(SqsError::InvalidAttributeName(_))));
    }

    #[test]
    fn test_queue_name_validation() {
        assert!(validate_queue_name("orders-1_a").is_ok());
        assert!(validate_queue_name("orders.fifo").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name(".fifo").is_err());
        assert!(validate_queue_name("bad name").is_err());
        assert!(validate_queue_name(&"a".repeat(81)).is_err());
    }
}
