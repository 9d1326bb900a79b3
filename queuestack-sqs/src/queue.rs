//! Queue engine
//!
//! One [`SqsQueue`] owns the records of a single queue. All state sits behind
//! one `parking_lot` mutex that is only ever held for a single synchronous
//! step; long-polling waits on a [`Notify`] outside the lock. Timer tasks hold
//! a weak reference back to the queue so a deleted queue is never kept alive by
//! its own timers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use queuestack_core::AccountRegionKey;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::attributes::{
    QueueAttributeName, QueueAttributes, RedrivePolicy, MAX_DELAY_SECONDS, MAX_VISIBILITY_TIMEOUT,
};
use crate::error::SqsError;
use crate::message::{
    message_size, sha256_hex, validate_fifo_id, MessageRecord, ReceivedMessage, SendMessageInput,
    SendMessageOutput,
};
use crate::receipt;
use crate::registry::QueueRegistry;
use crate::sequence::{Deduplicated, SequenceTracker};
use crate::store::{MessageStore, Scheduler, StoreCounts, TimerEvent};

/// Parameters of a single receive call
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub max_number_of_messages: usize,
    /// Falls back to the queue's `ReceiveMessageWaitTimeSeconds`
    pub wait_time: Option<Duration>,
    /// Overrides the queue's visibility timeout for this batch only
    pub visibility_timeout: Option<u32>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_number_of_messages: 1,
            wait_time: None,
            visibility_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Started,
    AlreadyInProgress,
}

struct QueueInner {
    attributes: QueueAttributes,
    last_modified: i64,
    store: MessageStore,
    sequences: SequenceTracker,
    purge_timer: Option<AbortHandle>,
    deleted: bool,
}

impl QueueInner {
    fn ensure_live(&self) -> Result<(), SqsError> {
        if self.deleted {
            Err(SqsError::QueueDoesNotExist)
        } else {
            Ok(())
        }
    }
}

pub struct SqsQueue {
    name: String,
    url: String,
    arn: String,
    scope: AccountRegionKey,
    created_timestamp: i64,
    purge_cooldown: Duration,
    inner: Mutex<QueueInner>,
    notify: Notify,
    registry: Weak<QueueRegistry>,
    me: Weak<SqsQueue>,
}

/// Spawns one sleeping task per timer
struct TimerScheduler<'a> {
    queue: &'a Weak<SqsQueue>,
}

impl Scheduler for TimerScheduler<'_> {
    fn schedule(&self, after: Duration, position: u64, event: TimerEvent) -> AbortHandle {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(queue) = queue.upgrade() {
                queue.on_timer(position, event);
            }
        })
        .abort_handle()
    }
}

impl SqsQueue {
    pub(crate) fn new(
        name: String,
        url: String,
        scope: AccountRegionKey,
        attributes: QueueAttributes,
        purge_cooldown: Duration,
        registry: Weak<QueueRegistry>,
    ) -> Arc<Self> {
        let now = chrono::Utc::now().timestamp();
        Arc::new_cyclic(|me| Self {
            arn: scope.arn("sqs", &name),
            name,
            url,
            scope,
            created_timestamp: now,
            purge_cooldown,
            inner: Mutex::new(QueueInner {
                attributes,
                last_modified: now,
                store: MessageStore::new(),
                sequences: SequenceTracker::new(),
                purge_timer: None,
                deleted: false,
            }),
            notify: Notify::new(),
            registry,
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn scope(&self) -> &AccountRegionKey {
        &self.scope
    }

    pub fn is_fifo(&self) -> bool {
        self.inner.lock().attributes.fifo_queue
    }

    pub fn attributes(&self) -> QueueAttributes {
        self.inner.lock().attributes.clone()
    }

    pub fn redrive_policy(&self) -> Option<RedrivePolicy> {
        self.inner.lock().attributes.redrive_policy.clone()
    }

    pub fn counts(&self) -> StoreCounts {
        self.inner.lock().store.counts()
    }

    fn scheduler(&self) -> TimerScheduler<'_> {
        TimerScheduler { queue: &self.me }
    }

    /// Validate and append one message
    pub fn send(&self, input: SendMessageInput) -> Result<SendMessageOutput, SqsError> {
        self.publish(input, Deduplication::Enforce)
    }

    /// Append a copy of a message taken from another queue. FIFO queues still
    /// assign a sequence number, but a deduplication id seen within the window
    /// does not suppress the copy.
    pub(crate) fn republish(&self, input: SendMessageInput) -> Result<SendMessageOutput, SqsError> {
        self.publish(input, Deduplication::Bypass)
    }

    fn publish(
        &self,
        mut input: SendMessageInput,
        deduplication: Deduplication,
    ) -> Result<SendMessageOutput, SqsError> {
        if input.body.is_empty() {
            return Err(SqsError::MissingParameter(
                "The request must contain the parameter MessageBody.".to_string(),
            ));
        }

        let mut guard = self.inner.lock();
        guard.ensure_live()?;
        let inner = &mut *guard;
        let attributes = &inner.attributes;

        if let Some(delay) = input.delay_seconds {
            if attributes.fifo_queue {
                return Err(SqsError::invalid_value(
                    "DelaySeconds",
                    delay,
                    "The request include parameter that is not valid for this queue type.",
                ));
            }
            if delay > MAX_DELAY_SECONDS {
                return Err(SqsError::invalid_value(
                    "DelaySeconds",
                    delay,
                    "DelaySeconds must be >= 0 and <= 900.",
                ));
            }
        }

        let size = message_size(&input.body, &input.message_attributes);
        if size > attributes.maximum_message_size as usize {
            return Err(SqsError::InvalidParameterValue(format!(
                "One or more parameters are invalid. Reason: Message must be shorter than {} bytes.",
                attributes.maximum_message_size
            )));
        }

        let delay = Duration::from_secs(u64::from(
            input.delay_seconds.unwrap_or(attributes.delay_seconds),
        ));
        let retention = Duration::from_secs(u64::from(attributes.message_retention_period));

        if !attributes.fifo_queue {
            if let Some(ref dedup_id) = input.message_deduplication_id {
                return Err(SqsError::invalid_value(
                    "MessageDeduplicationId",
                    dedup_id,
                    "The request include parameter that is not valid for this queue type.",
                ));
            }

            let record = MessageRecord::new(
                uuid::Uuid::new_v4().to_string(),
                input,
                &self.scope.account_id,
            );
            let output = send_output(&record);
            inner.store.append(record, delay, retention, &self.scheduler());
            drop(guard);

            debug!(queue = %self.name, message_id = %output.message_id, "Sent message");
            if delay.is_zero() {
                self.notify.notify_waiters();
            }
            return Ok(output);
        }

        let group = input.message_group_id.clone().ok_or_else(|| {
            SqsError::MissingParameter("The request must contain the parameter MessageGroupId.".to_string())
        })?;
        validate_fifo_id("MessageGroupId", &group)?;

        let dedup_id = match input.message_deduplication_id.take() {
            Some(id) => {
                validate_fifo_id("MessageDeduplicationId", &id)?;
                id
            }
            None if attributes.content_based_deduplication => sha256_hex(input.body.as_bytes()),
            None => {
                return Err(SqsError::InvalidParameterValue(
                    "The queue should either have ContentBasedDeduplication enabled or MessageDeduplicationId provided explicitly"
                        .to_string(),
                ))
            }
        };
        input.message_deduplication_id = Some(dedup_id.clone());

        let scope = attributes.deduplication_scope;
        let mut record = MessageRecord::new(
            uuid::Uuid::new_v4().to_string(),
            input,
            &self.scope.account_id,
        );

        let duplicate = match deduplication {
            Deduplication::Enforce => inner.sequences.find_duplicate(scope, &group, &dedup_id),
            Deduplication::Bypass => None,
        };
        if let Some(original) = duplicate {
            debug!(
                queue = %self.name,
                message_id = %original.message_id,
                dedup_id = %dedup_id,
                "Duplicate send within deduplication window"
            );
            let mut output = send_output(&record);
            output.message_id = original.message_id;
            output.sequence_number = original.sequence_number;
            return Ok(output);
        }

        let sequence_number = inner.sequences.next_sequence_number(&group);
        record.sequence_number = Some(sequence_number.clone());
        inner.sequences.remember(
            scope,
            &group,
            &dedup_id,
            Deduplicated {
                message_id: record.message_id.clone(),
                sequence_number: Some(sequence_number),
            },
        );

        let output = send_output(&record);
        inner.store.append(record, delay, retention, &self.scheduler());
        drop(guard);

        debug!(
            queue = %self.name,
            message_id = %output.message_id,
            group = %group,
            "Sent message"
        );
        if delay.is_zero() {
            self.notify.notify_waiters();
        }
        Ok(output)
    }

    /// Lease offerable records, waiting up to the wait time for one to appear
    pub async fn receive(&self, options: ReceiveOptions) -> Result<Vec<ReceivedMessage>, SqsError> {
        let max = options.max_number_of_messages.max(1);
        let wait = {
            let inner = self.inner.lock();
            inner.ensure_live()?;

            let limit = inner.attributes.in_flight_limit();
            let in_flight = inner.store.in_flight();
            if max + in_flight > limit {
                return Err(SqsError::OverLimit(format!(
                    "Too many messages in flight: {} of {} allowed.",
                    in_flight, limit
                )));
            }

            options.wait_time.unwrap_or_else(|| {
                Duration::from_secs(u64::from(inner.attributes.receive_message_wait_time_seconds))
            })
        };

        let deadline = Instant::now() + wait;
        loop {
            // Register before scanning so an append between the scan and the
            // wait still wakes us
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.lease_batch(max, options.visibility_timeout)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lease_batch(max, options.visibility_timeout);
            }
        }
    }

    fn lease_batch(
        &self,
        max: usize,
        visibility_timeout: Option<u32>,
    ) -> Result<Vec<ReceivedMessage>, SqsError> {
        let mut inner = self.inner.lock();
        inner.ensure_live()?;

        let timeout = visibility_timeout.unwrap_or(inner.attributes.visibility_timeout);
        let leased = inner.store.lease_offerable(
            max,
            Duration::from_secs(u64::from(timeout)),
            &self.name,
            &self.scheduler(),
        );
        if !leased.is_empty() {
            debug!(queue = %self.name, count = leased.len(), "Leased messages");
        }
        Ok(leased)
    }

    /// Acknowledge a leased message
    pub fn delete(&self, receipt_handle: &str) -> Result<(), SqsError> {
        let handle = receipt::decode(receipt_handle, &self.name)?;

        let mut inner = self.inner.lock();
        inner.ensure_live()?;

        if inner.attributes.fifo_queue {
            let current = inner.store.get(&handle.message_id).filter(|record| {
                !record.visible && record.receipt_handle.as_deref() == Some(receipt_handle)
            });
            if current.is_none() {
                return Err(SqsError::invalid_value(
                    "ReceiptHandle",
                    receipt_handle,
                    "The receipt handle has expired.",
                ));
            }
        }

        if inner.store.remove(&handle.message_id).is_some() {
            debug!(queue = %self.name, message_id = %handle.message_id, "Deleted message");
        }
        Ok(())
    }

    /// Re-arm the visibility timer of a message
    pub fn change_visibility(&self, receipt_handle: &str, timeout: u32) -> Result<(), SqsError> {
        if timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(SqsError::invalid_value(
                "VisibilityTimeout",
                timeout,
                "VisibilityTimeout must be an integer between 0 and 43200",
            ));
        }
        let handle = receipt::decode(receipt_handle, &self.name)?;

        let expire_now = {
            let mut inner = self.inner.lock();
            inner.ensure_live()?;

            let fifo = inner.attributes.fifo_queue;
            let available = inner.store.get(&handle.message_id).is_some_and(|record| {
                !fifo
                    || (!record.visible
                        && record.receipt_handle.as_deref() == Some(receipt_handle))
            });
            let position = inner
                .store
                .position_of(&handle.message_id)
                .filter(|_| available)
                .ok_or_else(|| {
                    SqsError::invalid_value(
                        "ReceiptHandle",
                        receipt_handle,
                        "Message does not exist or is not available for visibility timeout change.",
                    )
                })?;

            let epoch = inner.store.set_visibility_timeout(
                position,
                Duration::from_secs(u64::from(timeout)),
                &self.scheduler(),
            );
            debug!(
                queue = %self.name,
                message_id = %handle.message_id,
                timeout,
                "Changed message visibility"
            );
            epoch.filter(|_| timeout == 0).map(|epoch| (position, epoch))
        };

        if let Some((position, epoch)) = expire_now {
            self.on_visibility_expired(position, epoch);
        }
        Ok(())
    }

    /// Accept a purge; records are cleared once the cool-down elapses
    pub fn purge(&self) -> Result<PurgeOutcome, SqsError> {
        let mut inner = self.inner.lock();
        inner.ensure_live()?;

        if inner.purge_timer.is_some() {
            return Ok(PurgeOutcome::AlreadyInProgress);
        }

        let queue = self.me.clone();
        let cooldown = self.purge_cooldown;
        inner.purge_timer = Some(
            tokio::spawn(async move {
                tokio::time::sleep(cooldown).await;
                if let Some(queue) = queue.upgrade() {
                    queue.finish_purge();
                }
            })
            .abort_handle(),
        );

        info!(queue = %self.name, "Purge started");
        Ok(PurgeOutcome::Started)
    }

    fn finish_purge(&self) {
        let mut inner = self.inner.lock();
        let purged = inner.store.clear();
        inner.purge_timer = None;
        info!(queue = %self.name, purged, "Purge completed");
    }

    pub fn purge_in_progress(&self) -> bool {
        self.inner.lock().purge_timer.is_some()
    }

    /// Requested attributes, expanding `All`
    pub fn get_attributes(&self, names: &[QueueAttributeName]) -> HashMap<String, String> {
        let wanted: Vec<QueueAttributeName> = if names.contains(&QueueAttributeName::All) {
            QueueAttributeName::READABLE.to_vec()
        } else {
            names.to_vec()
        };

        let inner = self.inner.lock();
        let counts = inner.store.counts();

        wanted
            .into_iter()
            .filter_map(|name| {
                let value = match name {
                    QueueAttributeName::QueueArn => self.arn.clone(),
                    QueueAttributeName::CreatedTimestamp => self.created_timestamp.to_string(),
                    QueueAttributeName::LastModifiedTimestamp => inner.last_modified.to_string(),
                    QueueAttributeName::ApproximateNumberOfMessages => counts.visible.to_string(),
                    QueueAttributeName::ApproximateNumberOfMessagesNotVisible => {
                        counts.not_visible.to_string()
                    }
                    QueueAttributeName::ApproximateNumberOfMessagesDelayed => {
                        counts.delayed.to_string()
                    }
                    other => inner.attributes.stored_value(other)?,
                };
                Some((name.as_str().to_string(), value))
            })
            .collect()
    }

    pub fn set_attributes(&self, attrs: &HashMap<String, String>) -> Result<(), SqsError> {
        let mut inner = self.inner.lock();
        inner.ensure_live()?;
        inner.attributes.apply(attrs, false)?;
        inner.last_modified = chrono::Utc::now().timestamp();
        info!(queue = %self.name, "Updated queue attributes");
        Ok(())
    }

    fn on_timer(&self, position: u64, event: TimerEvent) {
        match event {
            TimerEvent::DelayExpired => {
                if self.inner.lock().store.expire_delay(position) {
                    self.notify.notify_waiters();
                }
            }
            TimerEvent::VisibilityExpired(epoch) => self.on_visibility_expired(position, epoch),
            TimerEvent::RetentionExpired => {
                if let Some(record) = self.inner.lock().store.remove_at(position) {
                    debug!(queue = %self.name, message_id = %record.message_id, "Message retention expired");
                }
            }
        }
    }

    /// Return an expired lease to the queue, or hand the record to the
    /// dead-letter queue once it has been received too often
    fn on_visibility_expired(&self, position: u64, epoch: u64) {
        let redrive = {
            let mut inner = self.inner.lock();
            let Some(receive_count) = inner.store.visibility_expired(position, epoch) else {
                return;
            };

            match inner.attributes.redrive_policy.clone() {
                Some(policy) if receive_count >= policy.max_receive_count => {
                    inner.store.remove_at(position).map(|record| (record, policy))
                }
                _ => {
                    inner.store.release(position);
                    None
                }
            }
        };

        match redrive {
            Some((record, policy)) => self.redrive(record, &policy),
            None => self.notify.notify_waiters(),
        }
    }

    /// Runs with no queue lock held; the dead-letter queue takes its own
    fn redrive(&self, record: MessageRecord, policy: &RedrivePolicy) {
        let target = self
            .registry
            .upgrade()
            .and_then(|registry| registry.get_by_arn(&policy.dead_letter_target_arn));

        match target {
            Some(dlq) => {
                info!(
                    queue = %self.name,
                    dlq = %dlq.name(),
                    message_id = %record.message_id,
                    receive_count = record.receive_count,
                    "Moving message to dead-letter queue"
                );
                dlq.accept_redriven(record, &self.arn);
            }
            None => warn!(
                queue = %self.name,
                dlq = %policy.dead_letter_target_arn,
                message_id = %record.message_id,
                "Dead-letter queue does not exist, dropping message"
            ),
        }
    }

    /// Append a record redriven from `source_arn`, keeping its identity
    pub(crate) fn accept_redriven(&self, mut record: MessageRecord, source_arn: &str) {
        let mut guard = self.inner.lock();
        if guard.deleted {
            warn!(queue = %self.name, message_id = %record.message_id, "Dead-letter queue was deleted, dropping message");
            return;
        }
        let inner = &mut *guard;

        record.receive_count = 0;
        record.first_receive_timestamp = None;
        record.receipt_handle = None;
        record.visible = true;
        record.dead_letter_source_arn = Some(source_arn.to_string());
        record.sequence_number = match (&record.message_group_id, inner.attributes.fifo_queue) {
            (Some(group), true) => Some(inner.sequences.next_sequence_number(group)),
            _ => None,
        };

        let retention = Duration::from_secs(u64::from(inner.attributes.message_retention_period));
        inner.store.append(record, Duration::ZERO, retention, &self.scheduler());
        drop(guard);

        self.notify.notify_waiters();
    }

    /// Cancel every timer and fail pending long-polls
    pub(crate) fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            inner.deleted = true;
            inner.store.clear();
            inner.sequences.clear_deduplication();
            if let Some(timer) = inner.purge_timer.take() {
                timer.abort();
            }
        }
        self.notify.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deduplication {
    Enforce,
    Bypass,
}

fn send_output(record: &MessageRecord) -> SendMessageOutput {
    SendMessageOutput {
        message_id: record.message_id.clone(),
        md5_of_message_body: record.md5_of_body.clone(),
        md5_of_message_attributes: record.md5_of_message_attributes.clone(),
        md5_of_message_system_attributes: record.md5_of_system_attributes.clone(),
        sequence_number: record.sequence_number.clone(),
    }
}

impl std::fmt::Debug for SqsQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsQueue")
            .field("name", &self.name)
            .field("arn", &self.arn)
            .finish_non_exhaustive()
    }
}
