//! Receipt handle codec
//!
//! A receipt handle is an opaque base64 token binding a lease to the queue and
//! message it was issued for: `"<nonce> <queue-name> <message-id> <issued-ms>"`.

use base64::{engine::general_purpose::STANDARD, Engine};
use uuid::Uuid;

use crate::error::SqsError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptHandle {
    pub queue_name: String,
    pub message_id: String,
    pub issued_at: i64,
}

/// Issue a fresh handle; two leases of the same message never share a handle.
pub fn encode(queue_name: &str, message_id: &str, issued_at: i64) -> String {
    let raw = format!(
        "{} {} {} {}",
        Uuid::new_v4().simple(),
        queue_name,
        message_id,
        issued_at
    );
    STANDARD.encode(raw)
}

/// Decode a handle presented for `queue_name`
pub fn decode(handle: &str, queue_name: &str) -> Result<ReceiptHandle, SqsError> {
    let invalid = || {
        SqsError::ReceiptHandleIsInvalid(format!(
            "The input receipt handle \"{}\" is not a valid receipt handle.",
            handle
        ))
    };

    let bytes = STANDARD.decode(handle.trim()).map_err(|_| invalid())?;
    let raw = String::from_utf8(bytes).map_err(|_| invalid())?;

    let parts: Vec<&str> = raw.split(' ').collect();
    let [_nonce, name, message_id, issued_at] = parts.as_slice() else {
        return Err(invalid());
    };
    let issued_at = issued_at.parse::<i64>().map_err(|_| invalid())?;

    if *name != queue_name || message_id.is_empty() {
        return Err(invalid());
    }

    Ok(ReceiptHandle {
        queue_name: name.to_string(),
        message_id: message_id.to_string(),
        issued_at,
    })
}
