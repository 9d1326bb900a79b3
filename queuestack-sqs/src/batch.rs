//! Batch request plumbing shared by the three batch operations

use std::collections::HashSet;

use crate::error::SqsError;
use crate::message::SendMessageInput;

pub const MAX_BATCH_ENTRIES: usize = 10;

#[derive(Debug, Clone)]
pub struct SendMessageBatchEntry {
    pub id: String,
    pub input: SendMessageInput,
}

#[derive(Debug, Clone)]
pub struct DeleteMessageBatchEntry {
    pub id: String,
    pub receipt_handle: String,
}

#[derive(Debug, Clone)]
pub struct ChangeVisibilityBatchEntry {
    pub id: String,
    pub receipt_handle: String,
    pub visibility_timeout: u32,
}

/// A failed entry; siblings are unaffected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResultErrorEntry {
    pub id: String,
    pub code: String,
    pub message: String,
    pub sender_fault: bool,
}

impl BatchResultErrorEntry {
    pub fn new(id: &str, err: &SqsError) -> Self {
        let code = err.code();
        Self {
            id: id.to_string(),
            code: code.as_str().to_string(),
            message: err.to_string(),
            sender_fault: code.is_sender_fault(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome<T> {
    /// `(entry id, result)` in request order
    pub successful: Vec<(String, T)>,
    pub failed: Vec<BatchResultErrorEntry>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            successful: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    pub fn record(&mut self, id: &str, result: Result<T, SqsError>) {
        match result {
            Ok(value) => self.successful.push((id.to_string(), value)),
            Err(err) => self.failed.push(BatchResultErrorEntry::new(id, &err)),
        }
    }
}

/// Request-level checks: at least one entry, at most ten, ids distinct
pub fn validate_entry_ids<'a>(
    ids: impl ExactSizeIterator<Item = &'a str>,
    entry_name: &str,
) -> Result<(), SqsError> {
    match ids.len() {
        0 => return Err(SqsError::EmptyBatchRequest(entry_name.to_string())),
        n if n > MAX_BATCH_ENTRIES => return Err(SqsError::TooManyEntriesInBatchRequest(n)),
        _ => {}
    }

    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(SqsError::BatchEntryIdsNotDistinct(id.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_rules() {
        let ids = ["a", "b"];
        assert!(validate_entry_ids(ids.iter().copied(), "Entry").is_ok());

        let empty: [&str; 0] = [];
        assert!(matches!(
            validate_entry_ids(empty.iter().copied(), "SendMessageBatchRequestEntry"),
            Err(SqsError::EmptyBatchRequest(_))
        ));

        let many: Vec<String> = (0..11).map(|i| i.to_string()).collect();
        assert!(matches!(
            validate_entry_ids(many.iter().map(String::as_str), "Entry"),
            Err(SqsError::TooManyEntriesInBatchRequest(11))
        ));

        let dup = ["a", "a"];
        assert!(matches!(
            validate_entry_ids(dup.iter().copied(), "Entry"),
            Err(SqsError::BatchEntryIdsNotDistinct(id)) if id == "a"
        ));
    }

    #[test]
    fn test_outcome_splits_results() {
        let mut outcome = BatchOutcome::default();
        outcome.record("ok", Ok(()));
        outcome.record("bad", Err(SqsError::InvalidParameterValue("nope".into())));

        assert_eq!(outcome.successful.len(), 1);
        assert_eq!(outcome.failed[0].id, "bad");
        assert_eq!(outcome.failed[0].code, "InvalidParameterValue");
        assert!(outcome.failed[0].sender_fault);
    }
}
