//! Message records, attributes and checksums

use md5::{Digest, Md5};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};

use crate::error::SqsError;

pub const TRACE_HEADER: &str = "AWSTraceHeader";

/// Payload of a message attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeData {
    String(String),
    Binary(Vec<u8>),
}

/// A validated message attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAttributeValue {
    pub data_type: String,
    pub data: AttributeData,
}

impl MessageAttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: "String".to_string(),
            data: AttributeData::String(value.into()),
        }
    }

    pub fn number(value: impl Into<String>) -> Self {
        Self {
            data_type: "Number".to_string(),
            data: AttributeData::String(value.into()),
        }
    }

    pub fn binary(value: impl Into<Vec<u8>>) -> Self {
        Self {
            data_type: "Binary".to_string(),
            data: AttributeData::Binary(value.into()),
        }
    }

    /// Build from wire parts, rejecting list values and mismatched payloads
    pub fn from_parts(
        name: &str,
        data_type: &str,
        string_value: Option<String>,
        binary_value: Option<Vec<u8>>,
        has_list_values: bool,
    ) -> Result<Self, SqsError> {
        if has_list_values {
            return Err(SqsError::UnsupportedOperation(
                "Message attribute list values in SendMessage operation are not supported."
                    .to_string(),
            ));
        }

        let base_type = data_type.split('.').next().unwrap_or_default();
        let data = match (base_type, string_value, binary_value) {
            ("String" | "Number", Some(s), _) => AttributeData::String(s),
            ("Binary", _, Some(b)) => AttributeData::Binary(b),
            ("String" | "Number" | "Binary", _, _) => {
                return Err(SqsError::InvalidParameterValue(format!(
                    "Message ({}) must contain a non-empty message attribute value for message attribute type {}.",
                    name, base_type
                )))
            }
            _ => {
                return Err(SqsError::InvalidParameterValue(format!(
                    "The type of message ({}) attribute '{}' is invalid. You must use only the following supported type prefixes: Binary, Number, String.",
                    name, data_type
                )))
            }
        };

        Ok(Self {
            data_type: data_type.to_string(),
            data,
        })
    }

    fn payload(&self) -> &[u8] {
        match &self.data {
            AttributeData::String(s) => s.as_bytes(),
            AttributeData::Binary(b) => b,
        }
    }

    fn transport_type(&self) -> u8 {
        match self.data {
            AttributeData::String(_) => 1,
            AttributeData::Binary(_) => 2,
        }
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// MD5 over attributes using the SQS encoding: names sorted, each field
/// length-prefixed (big-endian u32), transport byte 1 for strings, 2 for binary.
pub fn md5_of_attributes(attrs: &HashMap<String, MessageAttributeValue>) -> Option<String> {
    if attrs.is_empty() {
        return None;
    }

    let mut names: Vec<&String> = attrs.keys().collect();
    names.sort();

    let mut buf: Vec<u8> = Vec::new();
    for name in names {
        let attr = &attrs[name];
        push_length_prefixed(&mut buf, name.as_bytes());
        push_length_prefixed(&mut buf, attr.data_type.as_bytes());
        buf.push(attr.transport_type());
        push_length_prefixed(&mut buf, attr.payload());
    }

    Some(md5_hex(&buf))
}

fn push_length_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn system_attributes(trace_header: Option<&str>) -> HashMap<String, MessageAttributeValue> {
    trace_header
        .map(|t| HashMap::from([(TRACE_HEADER.to_string(), MessageAttributeValue::string(t))]))
        .unwrap_or_default()
}

/// Body plus every attribute name, type and value
pub fn message_size(body: &str, attrs: &HashMap<String, MessageAttributeValue>) -> usize {
    body.len()
        + attrs
            .iter()
            .map(|(name, v)| name.len() + v.data_type.len() + v.payload().len())
            .sum::<usize>()
}

/// Group and deduplication ids: 1-128 alphanumeric or punctuation characters
pub fn validate_fifo_id(parameter: &str, value: &str) -> Result<(), SqsError> {
    let valid = !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c.is_ascii_punctuation());

    if valid {
        Ok(())
    } else {
        Err(SqsError::invalid_value(
            parameter,
            value,
            &format!(
                "{} can only include alphanumeric and punctuation characters. 1 to 128 in length.",
                parameter
            ),
        ))
    }
}

/// Input to a single send
#[derive(Debug, Clone, Default)]
pub struct SendMessageInput {
    pub body: String,
    pub delay_seconds: Option<u32>,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    pub trace_header: Option<String>,
    pub message_group_id: Option<String>,
    pub message_deduplication_id: Option<String>,
}

impl SendMessageInput {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageOutput {
    pub message_id: String,
    pub md5_of_message_body: String,
    pub md5_of_message_attributes: Option<String>,
    pub md5_of_message_system_attributes: Option<String>,
    pub sequence_number: Option<String>,
}

/// One message held by a queue
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: String,
    pub body: String,
    pub md5_of_body: String,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    pub md5_of_message_attributes: Option<String>,
    pub trace_header: Option<String>,
    pub md5_of_system_attributes: Option<String>,
    pub sender_id: String,
    pub sent_timestamp: i64,
    pub receive_count: u32,
    pub first_receive_timestamp: Option<i64>,
    pub message_group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub sequence_number: Option<String>,
    pub dead_letter_source_arn: Option<String>,
    /// Present only while leased
    pub receipt_handle: Option<String>,
    pub delayed: bool,
    pub visible: bool,
}

impl MessageRecord {
    pub fn new(message_id: String, input: SendMessageInput, sender_id: &str) -> Self {
        let md5_of_body = md5_hex(input.body.as_bytes());
        let md5_of_message_attributes = md5_of_attributes(&input.message_attributes);
        let md5_of_system_attributes =
            md5_of_attributes(&system_attributes(input.trace_header.as_deref()));

        Self {
            message_id,
            md5_of_body,
            body: input.body,
            message_attributes: input.message_attributes,
            md5_of_message_attributes,
            trace_header: input.trace_header,
            md5_of_system_attributes,
            sender_id: sender_id.to_string(),
            sent_timestamp: chrono::Utc::now().timestamp_millis(),
            receive_count: 0,
            first_receive_timestamp: None,
            message_group_id: input.message_group_id,
            deduplication_id: input.message_deduplication_id,
            sequence_number: None,
            dead_letter_source_arn: None,
            receipt_handle: None,
            delayed: false,
            visible: true,
        }
    }

    /// Offerable to `receive`
    pub fn is_offerable(&self) -> bool {
        !self.delayed && self.visible
    }

    /// Copy handed out by `receive`; later mutations of the live record do
    /// not show through.
    pub fn snapshot(&self) -> ReceivedMessage {
        let mut attributes = BTreeMap::new();
        attributes.insert("SenderId", self.sender_id.clone());
        attributes.insert("SentTimestamp", self.sent_timestamp.to_string());
        attributes.insert("ApproximateReceiveCount", self.receive_count.to_string());
        if let Some(ts) = self.first_receive_timestamp {
            attributes.insert("ApproximateFirstReceiveTimestamp", ts.to_string());
        }
        if let Some(ref gid) = self.message_group_id {
            attributes.insert("MessageGroupId", gid.clone());
        }
        if let Some(ref did) = self.deduplication_id {
            attributes.insert("MessageDeduplicationId", did.clone());
        }
        if let Some(ref seq) = self.sequence_number {
            attributes.insert("SequenceNumber", seq.clone());
        }
        if let Some(ref trace) = self.trace_header {
            attributes.insert(TRACE_HEADER, trace.clone());
        }
        if let Some(ref arn) = self.dead_letter_source_arn {
            attributes.insert("DeadLetterQueueSourceArn", arn.clone());
        }

        ReceivedMessage {
            message_id: self.message_id.clone(),
            receipt_handle: self.receipt_handle.clone().unwrap_or_default(),
            body: self.body.clone(),
            md5_of_body: self.md5_of_body.clone(),
            md5_of_message_attributes: self.md5_of_message_attributes.clone(),
            message_attributes: self.message_attributes.clone(),
            attributes,
        }
    }
}

/// Point-in-time copy of a leased record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub md5_of_body: String,
    pub md5_of_message_attributes: Option<String>,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    /// System attributes keyed by their SQS name
    pub attributes: BTreeMap<&'static str, String>,
}

impl ReceivedMessage {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn receive_count(&self) -> u32 {
        self.attribute("ApproximateReceiveCount")
            .and_then(|c| c.parse().ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_of_body() {
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_md5_of_attributes_empty() {
        assert!(md5_of_attributes(&HashMap::new()).is_none());
    }

    #[test]
    fn test_md5_of_attributes_order_independent() {
        let a: HashMap<_, _> = [
            ("b".to_string(), MessageAttributeValue::number("1")),
            ("a".to_string(), MessageAttributeValue::string("x")),
        ]
        .into();
        let b: HashMap<_, _> = [
            ("a".to_string(), MessageAttributeValue::string("x")),
            ("b".to_string(), MessageAttributeValue::number("1")),
        ]
        .into();
        assert_eq!(md5_of_attributes(&a), md5_of_attributes(&b));

        let c: HashMap<_, _> = [("a".to_string(), MessageAttributeValue::binary(b"x".to_vec()))].into();
        let d: HashMap<_, _> = [("a".to_string(), MessageAttributeValue::string("x"))].into();
        assert_ne!(md5_of_attributes(&c), md5_of_attributes(&d));
    }

    #[test]
    fn test_message_size_counts_attributes() {
        let attrs: HashMap<_, _> = [("key".to_string(), MessageAttributeValue::string("value"))].into();
        assert_eq!(message_size("body", &attrs), 4 + 3 + 6 + 5);
    }

    #[test]
    fn test_attribute_from_parts() {
        let ok = MessageAttributeValue::from_parts("n", "Number.int", Some("4".into()), None, false);
        assert!(ok.is_ok());

        let list = MessageAttributeValue::from_parts("n", "String", None, None, true);
        assert!(matches!(list, Err(SqsError::UnsupportedOperation(_))));

        let missing = MessageAttributeValue::from_parts("n", "Binary", Some("x".into()), None, false);
        assert!(matches!(missing, Err(SqsError::InvalidParameterValue(_))));

        let bad_type = MessageAttributeValue::from_parts("n", "Blob", Some("x".into()), None, false);
        assert!(matches!(bad_type, Err(SqsError::InvalidParameterValue(_))));
    }

    #[test]
    fn test_validate_fifo_id() {
        assert!(validate_fifo_id("MessageGroupId", "group-1!").is_ok());
        assert!(validate_fifo_id("MessageGroupId", "").is_err());
        assert!(validate_fifo_id("MessageGroupId", "has space").is_err());
        assert!(validate_fifo_id("MessageGroupId", &"g".repeat(129)).is_err());
    }

    #[test]
    fn test_snapshot_detached_from_record() {
        let mut record = MessageRecord::new("m-1".into(), SendMessageInput::new("hi"), "sender");
        record.receive_count = 1;
        let snap = record.snapshot();
        record.receive_count = 2;
        assert_eq!(snap.receive_count(), 1);
        assert_eq!(snap.attribute("SenderId"), Some("sender"));
    }
}
