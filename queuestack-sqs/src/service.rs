//! SQS service facade
//!
//! Resolves queue URLs and ARNs through the registry, applies the request
//! level limits (batch sizes, receive bounds, move-task rates) and delegates
//! to the per-queue engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use queuestack_core::AccountRegionKey;
use tracing::info;

use crate::attributes::{
    QueueAttributeName, RedrivePolicy, MAX_VISIBILITY_TIMEOUT, MAX_WAIT_TIME_SECONDS,
};
use crate::batch::{
    validate_entry_ids, BatchOutcome, ChangeVisibilityBatchEntry, DeleteMessageBatchEntry,
    SendMessageBatchEntry,
};
use crate::config::SqsConfig;
use crate::error::SqsError;
use crate::message::{md5_of_attributes, ReceivedMessage, SendMessageInput, SendMessageOutput};
use crate::move_task::{
    decode_task_handle, MessageMoveTask, MoveTaskSummary, MAX_MESSAGES_PER_SECOND, MAX_TASK_HISTORY,
};
use crate::queue::{PurgeOutcome, ReceiveOptions, SqsQueue};
use crate::registry::QueueRegistry;

pub const MAX_RECEIVE_MESSAGES: u32 = 10;

/// Parameters of ReceiveMessage as seen by the service
#[derive(Debug, Clone, Default)]
pub struct ReceiveMessageRequest {
    pub max_number_of_messages: Option<u32>,
    pub wait_time_seconds: Option<u32>,
    pub visibility_timeout: Option<u32>,
    /// System attributes to return (`All` or exact names)
    pub attribute_names: Vec<String>,
    /// Message attributes to return (`All`, `.*`, exact names or `prefix.*`)
    pub message_attribute_names: Vec<String>,
}

#[derive(Debug)]
pub struct SqsService {
    registry: Arc<QueueRegistry>,
    scope: AccountRegionKey,
}

impl SqsService {
    pub fn new(config: SqsConfig) -> Self {
        let scope = AccountRegionKey::new(&config.account_id, &config.region);
        Self {
            registry: QueueRegistry::new(config),
            scope,
        }
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SqsConfig {
        self.registry.config()
    }

    /// Accepts a full queue URL or a bare queue name
    fn resolve(&self, queue_url: &str) -> Result<Arc<SqsQueue>, SqsError> {
        let trimmed = queue_url.trim().trim_end_matches('/');
        let path = trimmed
            .split_once("://")
            .map_or(trimmed, |(_, rest)| rest);
        let segments: Vec<&str> = path.split('/').collect();

        let (scope, name) = match segments.as_slice() {
            [name] => (self.scope.clone(), *name),
            [.., account, name] if account.chars().all(|c| c.is_ascii_digit()) => {
                (AccountRegionKey::new(*account, &self.scope.region), *name)
            }
            [.., name] => (self.scope.clone(), *name),
            [] => return Err(SqsError::QueueDoesNotExist),
        };

        self.registry
            .get(&scope, name)
            .ok_or(SqsError::QueueDoesNotExist)
    }

    fn resolve_arn(&self, arn: &str, parameter: &str) -> Result<Arc<SqsQueue>, SqsError> {
        self.registry.get_by_arn(arn).ok_or_else(|| {
            SqsError::ResourceNotFound(format!(
                "The resource that you specified for the {} parameter doesn't exist.",
                parameter
            ))
        })
    }

    /// A redrive policy must point at an existing queue of the same type
    fn validate_redrive_target(
        &self,
        attrs: &HashMap<String, String>,
        fifo: bool,
    ) -> Result<(), SqsError> {
        let Some(raw) = attrs
            .get(QueueAttributeName::RedrivePolicy.as_str())
            .filter(|raw| !raw.is_empty())
        else {
            return Ok(());
        };

        let policy = RedrivePolicy::from_json(raw)?;
        let target = self.registry.get_by_arn(&policy.dead_letter_target_arn).ok_or_else(|| {
            SqsError::invalid_value("RedrivePolicy", raw, "Dead letter target does not exist.")
        })?;
        if target.is_fifo() != fifo {
            return Err(SqsError::invalid_value(
                "RedrivePolicy",
                raw,
                "Dead-letter queue must be same type of queue as the source.",
            ));
        }
        Ok(())
    }

    pub fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, SqsError> {
        self.validate_redrive_target(attributes, name.ends_with(".fifo"))?;
        let queue = self.registry.create_queue(&self.scope, name, attributes)?;
        Ok(queue.url().to_string())
    }

    pub fn delete_queue(&self, queue_url: &str) -> Result<(), SqsError> {
        let queue = self.resolve(queue_url)?;
        self.registry.delete(queue.scope(), queue.name())
    }

    pub fn get_queue_url(&self, name: &str, owner_account: Option<&str>) -> Result<String, SqsError> {
        let scope = match owner_account {
            Some(account) => AccountRegionKey::new(account, &self.scope.region),
            None => self.scope.clone(),
        };
        self.registry
            .get(&scope, name)
            .map(|queue| queue.url().to_string())
            .ok_or(SqsError::QueueDoesNotExist)
    }

    pub fn list_queues(
        &self,
        prefix: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<Vec<String>, SqsError> {
        if let Some(max) = max_results {
            if !(1..=1000).contains(&max) {
                return Err(SqsError::invalid_value(
                    "MaxResults",
                    max,
                    "MaxResults must be an integer between 1 and 1000.",
                ));
            }
        }

        let limit = max_results.map_or(1000, |max| max as usize);
        Ok(self
            .registry
            .list(&self.scope, prefix)
            .iter()
            .take(limit)
            .map(|queue| queue.url().to_string())
            .collect())
    }

    pub fn get_queue_attributes(
        &self,
        queue_url: &str,
        names: &[String],
    ) -> Result<HashMap<String, String>, SqsError> {
        let queue = self.resolve(queue_url)?;
        let names = names
            .iter()
            .map(|name| QueueAttributeName::parse(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(queue.get_attributes(&names))
    }

    pub fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), SqsError> {
        let queue = self.resolve(queue_url)?;
        self.validate_redrive_target(attributes, queue.is_fifo())?;
        queue.set_attributes(attributes)
    }

    pub fn purge_queue(&self, queue_url: &str) -> Result<(), SqsError> {
        let queue = self.resolve(queue_url)?;
        match queue.purge()? {
            PurgeOutcome::Started => Ok(()),
            PurgeOutcome::AlreadyInProgress => {
                Err(SqsError::PurgeQueueInProgress(queue.arn().to_string()))
            }
        }
    }

    pub fn send_message(
        &self,
        queue_url: &str,
        input: SendMessageInput,
    ) -> Result<SendMessageOutput, SqsError> {
        self.resolve(queue_url)?.send(input)
    }

    pub fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendMessageBatchEntry>,
    ) -> Result<BatchOutcome<SendMessageOutput>, SqsError> {
        let queue = self.resolve(queue_url)?;
        validate_entry_ids(
            entries.iter().map(|e| e.id.as_str()),
            "SendMessageBatchRequestEntry",
        )?;

        let mut outcome = BatchOutcome::default();
        for entry in entries {
            outcome.record(&entry.id, queue.send(entry.input));
        }
        Ok(outcome)
    }

    pub async fn receive_message(
        &self,
        queue_url: &str,
        request: ReceiveMessageRequest,
    ) -> Result<Vec<ReceivedMessage>, SqsError> {
        let queue = self.resolve(queue_url)?;

        let max = request.max_number_of_messages.unwrap_or(1);
        if !(1..=MAX_RECEIVE_MESSAGES).contains(&max) {
            return Err(SqsError::invalid_value(
                "MaxNumberOfMessages",
                max,
                "Must be between 1 and 10, if provided.",
            ));
        }
        if let Some(wait) = request.wait_time_seconds {
            if wait > MAX_WAIT_TIME_SECONDS {
                return Err(SqsError::invalid_value(
                    "WaitTimeSeconds",
                    wait,
                    "Must be >= 0 and <= 20, if provided.",
                ));
            }
        }
        if let Some(timeout) = request.visibility_timeout {
            if timeout > MAX_VISIBILITY_TIMEOUT {
                return Err(SqsError::invalid_value(
                    "VisibilityTimeout",
                    timeout,
                    "Must be >= 0 and <= 43200, if provided.",
                ));
            }
        }

        let messages = queue
            .receive(ReceiveOptions {
                max_number_of_messages: max as usize,
                wait_time: request
                    .wait_time_seconds
                    .map(|secs| Duration::from_secs(u64::from(secs))),
                visibility_timeout: request.visibility_timeout,
            })
            .await?;

        Ok(messages
            .into_iter()
            .map(|message| {
                filter_message(
                    message,
                    &request.attribute_names,
                    &request.message_attribute_names,
                )
            })
            .collect())
    }

    pub fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), SqsError> {
        self.resolve(queue_url)?.delete(receipt_handle)
    }

    pub fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteMessageBatchEntry>,
    ) -> Result<BatchOutcome<()>, SqsError> {
        let queue = self.resolve(queue_url)?;
        validate_entry_ids(
            entries.iter().map(|e| e.id.as_str()),
            "DeleteMessageBatchRequestEntry",
        )?;

        let mut outcome = BatchOutcome::default();
        for entry in entries {
            outcome.record(&entry.id, queue.delete(&entry.receipt_handle));
        }
        Ok(outcome)
    }

    pub fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> Result<(), SqsError> {
        self.resolve(queue_url)?
            .change_visibility(receipt_handle, visibility_timeout)
    }

    pub fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: Vec<ChangeVisibilityBatchEntry>,
    ) -> Result<BatchOutcome<()>, SqsError> {
        let queue = self.resolve(queue_url)?;
        validate_entry_ids(
            entries.iter().map(|e| e.id.as_str()),
            "ChangeMessageVisibilityBatchRequestEntry",
        )?;

        let mut outcome = BatchOutcome::default();
        for entry in entries {
            outcome.record(
                &entry.id,
                queue.change_visibility(&entry.receipt_handle, entry.visibility_timeout),
            );
        }
        Ok(outcome)
    }

    /// URLs of queues using this queue as their dead-letter queue
    pub fn list_dead_letter_source_queues(&self, queue_url: &str) -> Result<Vec<String>, SqsError> {
        let queue = self.resolve(queue_url)?;
        Ok(self
            .registry
            .dead_letter_sources(queue.arn())
            .iter()
            .map(|source| source.url().to_string())
            .collect())
    }

    /// Start moving messages out of a dead-letter queue. Returns the task handle.
    pub fn start_message_move_task(
        &self,
        source_arn: &str,
        destination_arn: Option<&str>,
        max_number_of_messages_per_second: Option<u32>,
    ) -> Result<String, SqsError> {
        if let Some(rate) = max_number_of_messages_per_second {
            if !(1..=MAX_MESSAGES_PER_SECOND).contains(&rate) {
                return Err(SqsError::invalid_value(
                    "MaxNumberOfMessagesPerSecond",
                    rate,
                    "Must be between 1 and 500, if provided.",
                ));
            }
        }

        let source = self.resolve_arn(source_arn, "SourceArn")?;
        if self.registry.dead_letter_sources(source.arn()).is_empty() {
            return Err(SqsError::InvalidParameterValue(
                "Source queue must be configured as a Dead Letter Queue.".to_string(),
            ));
        }
        if let Some(arn) = destination_arn {
            self.resolve_arn(arn, "DestinationArn")?;
        }

        let task = MessageMoveTask::new(
            &source,
            destination_arn.map(str::to_string),
            max_number_of_messages_per_second,
        );
        self.registry.register_move_task(task.clone())?;

        let config = self.registry.config();
        task.start(
            Arc::downgrade(&source),
            Arc::downgrade(&self.registry),
            config.move_task_tick(),
            config.move_task_default_rate,
        );
        Ok(task.task_handle.clone())
    }

    /// Returns the number of messages moved before cancellation
    pub fn cancel_message_move_task(&self, task_handle: &str) -> Result<u64, SqsError> {
        let (task_id, source_arn) = decode_task_handle(task_handle)?;
        let task = self
            .registry
            .find_move_task(&source_arn, &task_id)
            .ok_or_else(|| SqsError::ResourceNotFound("Task does not exist.".to_string()))?;
        task.cancel()
    }

    /// Newest first
    pub fn list_message_move_tasks(
        &self,
        source_arn: &str,
        max_results: Option<u32>,
    ) -> Result<Vec<MoveTaskSummary>, SqsError> {
        let max = max_results.unwrap_or(1);
        if !(1..=MAX_TASK_HISTORY as u32).contains(&max) {
            return Err(SqsError::invalid_value(
                "MaxResults",
                max,
                "You must enter a number that's between 1 and 10.",
            ));
        }

        let source = self.resolve_arn(source_arn, "SourceArn")?;
        Ok(self
            .registry
            .move_tasks(source.arn())
            .iter()
            .take(max as usize)
            .map(|task| task.summary())
            .collect())
    }

    /// Drop all queues and tasks
    pub fn reset(&self) {
        info!("Resetting SQS state");
        self.registry.reset();
    }
}

/// Keep only the requested system and message attributes
fn filter_message(
    mut message: ReceivedMessage,
    attribute_names: &[String],
    message_attribute_names: &[String],
) -> ReceivedMessage {
    let all_system = attribute_names.iter().any(|n| n == "All");
    message.attributes = std::mem::take(&mut message.attributes)
        .into_iter()
        .filter(|(name, _)| all_system || attribute_names.iter().any(|n| n == name))
        .collect::<BTreeMap<_, _>>();

    let wanted = |name: &str| {
        message_attribute_names.iter().any(|pattern| {
            pattern == "All"
                || pattern == ".*"
                || pattern == name
                || pattern
                    .strip_suffix(".*")
                    .is_some_and(|prefix| name.starts_with(prefix))
        })
    };
    message.message_attributes.retain(|name, _| wanted(name.as_str()));
    message.md5_of_message_attributes = md5_of_attributes(&message.message_attributes);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageAttributeValue;

    fn message() -> ReceivedMessage {
        ReceivedMessage {
            message_id: "m".into(),
            receipt_handle: "r".into(),
            body: "b".into(),
            md5_of_body: String::new(),
            md5_of_message_attributes: None,
            message_attributes: [
                ("trace.id".to_string(), MessageAttributeValue::string("1")),
                ("trace.span".to_string(), MessageAttributeValue::string("2")),
                ("owner".to_string(), MessageAttributeValue::string("me")),
            ]
            .into(),
            attributes: [
                ("SenderId", "000000000000".to_string()),
                ("ApproximateReceiveCount", "1".to_string()),
            ]
            .into(),
        }
    }

    #[test]
    fn test_filter_nothing_requested() {
        let filtered = filter_message(message(), &[], &[]);
        assert!(filtered.attributes.is_empty());
        assert!(filtered.message_attributes.is_empty());
        assert!(filtered.md5_of_message_attributes.is_none());
    }

    #[test]
    fn test_filter_by_prefix_and_name() {
        let filtered = filter_message(
            message(),
            &["ApproximateReceiveCount".to_string()],
            &["trace.*".to_string()],
        );
        assert_eq!(filtered.attributes.len(), 1);
        assert_eq!(filtered.message_attributes.len(), 2);
        assert!(!filtered.message_attributes.contains_key("owner"));
        assert!(filtered.md5_of_message_attributes.is_some());
    }

    #[test]
    fn test_filter_all() {
        let filtered = filter_message(message(), &["All".to_string()], &["All".to_string()]);
        assert_eq!(filtered.attributes.len(), 2);
        assert_eq!(filtered.message_attributes.len(), 3);
    }
}
