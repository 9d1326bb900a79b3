//! Message move tasks
//!
//! A move task drains a source queue (usually a dead-letter queue) into a
//! destination on a fixed tick. Messages are received and deleted like any
//! other client would, and republished into the destination as new records.
//!
//! ```text
//! RUNNING -> CANCELLING -> CANCELLED
//!         -> COMPLETED
//!         -> FAILED
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::SqsError;
use crate::message::{ReceivedMessage, SendMessageInput, TRACE_HEADER};
use crate::queue::{ReceiveOptions, SqsQueue};
use crate::registry::QueueRegistry;

/// Tasks kept per source queue for listing
pub const MAX_TASK_HISTORY: usize = 10;
pub const MAX_MESSAGES_PER_SECOND: u32 = 500;
/// Consecutive empty receives after which a task gives up and completes
const MAX_EMPTY_POLLS: u32 = 10;

pub const COULD_NOT_DETERMINE_SOURCE: &str = "CouldNotDetermineMessageSource";
pub const NON_EXISTENT_QUEUE: &str = "AWS.SimpleQueueService.NonExistentQueue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveTaskStatus {
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl MoveTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

#[derive(Deserialize)]
struct TaskHandle {
    #[serde(rename = "taskId")]
    task_id: String,
    #[serde(rename = "sourceArn")]
    source_arn: String,
}

pub fn encode_task_handle(task_id: &str, source_arn: &str) -> String {
    let json = serde_json::json!({ "taskId": task_id, "sourceArn": source_arn });
    STANDARD.encode(json.to_string())
}

/// Returns `(task_id, source_arn)`
pub fn decode_task_handle(handle: &str) -> Result<(String, String), SqsError> {
    let not_found = || SqsError::ResourceNotFound("Task does not exist.".to_string());

    let bytes = STANDARD.decode(handle).map_err(|_| not_found())?;
    let decoded: TaskHandle = serde_json::from_slice(&bytes).map_err(|_| not_found())?;
    Ok((decoded.task_id, decoded.source_arn))
}

/// Point-in-time view used for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveTaskSummary {
    /// Only exposed while the task is running
    pub task_handle: Option<String>,
    pub status: MoveTaskStatus,
    pub source_arn: String,
    pub destination_arn: Option<String>,
    pub max_number_of_messages_per_second: Option<u32>,
    pub approximate_number_of_messages_moved: u64,
    pub approximate_number_of_messages_to_move: u64,
    pub failure_reason: Option<String>,
    pub started_timestamp: i64,
}

#[derive(Debug)]
struct TaskState {
    status: MoveTaskStatus,
    moved: u64,
    to_move: u64,
    failure_reason: Option<String>,
}

#[derive(Debug)]
pub struct MessageMoveTask {
    pub task_id: String,
    pub task_handle: String,
    pub source_arn: String,
    pub destination_arn: Option<String>,
    pub max_number_of_messages_per_second: Option<u32>,
    pub started_timestamp: i64,
    state: Mutex<TaskState>,
    driver: Mutex<Option<AbortHandle>>,
}

enum Step {
    Continue,
    Stop,
}

impl MessageMoveTask {
    /// New running task; the to-move estimate is taken from the source's
    /// current visible and in-flight counts
    pub(crate) fn new(
        source: &SqsQueue,
        destination_arn: Option<String>,
        max_number_of_messages_per_second: Option<u32>,
    ) -> Arc<Self> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let counts = source.counts();

        Arc::new(Self {
            task_handle: encode_task_handle(&task_id, source.arn()),
            task_id,
            source_arn: source.arn().to_string(),
            destination_arn,
            max_number_of_messages_per_second,
            started_timestamp: chrono::Utc::now().timestamp_millis(),
            state: Mutex::new(TaskState {
                status: MoveTaskStatus::Running,
                moved: 0,
                to_move: (counts.visible + counts.not_visible) as u64,
                failure_reason: None,
            }),
            driver: Mutex::new(None),
        })
    }

    pub fn status(&self) -> MoveTaskStatus {
        self.state.lock().status
    }

    pub fn summary(&self) -> MoveTaskSummary {
        let state = self.state.lock();
        MoveTaskSummary {
            task_handle: (state.status == MoveTaskStatus::Running).then(|| self.task_handle.clone()),
            status: state.status,
            source_arn: self.source_arn.clone(),
            destination_arn: self.destination_arn.clone(),
            max_number_of_messages_per_second: self.max_number_of_messages_per_second,
            approximate_number_of_messages_moved: state.moved,
            approximate_number_of_messages_to_move: state.to_move,
            failure_reason: state.failure_reason.clone(),
            started_timestamp: self.started_timestamp,
        }
    }

    /// Ask a running task to stop; it finishes on its next tick. Returns the
    /// number of messages moved so far.
    pub fn cancel(&self) -> Result<u64, SqsError> {
        let mut state = self.state.lock();
        if state.status != MoveTaskStatus::Running {
            return Err(SqsError::ResourceNotFound(
                "Only active tasks can be cancelled.".to_string(),
            ));
        }
        state.status = MoveTaskStatus::Cancelling;
        info!(task = %self.task_id, moved = state.moved, "Cancelling message move task");
        Ok(state.moved)
    }

    /// Stop the driver without a status change
    pub(crate) fn abort(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }

    /// Spawn the tick loop
    pub(crate) fn start(
        self: &Arc<Self>,
        source: Weak<SqsQueue>,
        registry: Weak<QueueRegistry>,
        tick: Duration,
        default_rate: u32,
    ) {
        let rate = self.max_number_of_messages_per_second.unwrap_or(default_rate);
        // Budget per tick, scaled so the configured rate holds per second
        let batch = ((u128::from(rate) * tick.as_millis()) / 1000).max(1) as usize;

        let task = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut empty_polls = 0;

            loop {
                interval.tick().await;
                match task.step(&source, &registry, batch, &mut empty_polls).await {
                    Step::Continue => {}
                    Step::Stop => break,
                }
            }
            task.driver.lock().take();
        });
        *self.driver.lock() = Some(handle.abort_handle());

        info!(
            task = %self.task_id,
            source = %self.source_arn,
            destination = ?self.destination_arn,
            rate,
            "Started message move task"
        );
    }

    async fn step(
        &self,
        source: &Weak<SqsQueue>,
        registry: &Weak<QueueRegistry>,
        batch: usize,
        empty_polls: &mut u32,
    ) -> Step {
        let remaining = {
            let mut state = self.state.lock();
            match state.status {
                MoveTaskStatus::Running => {}
                MoveTaskStatus::Cancelling => {
                    state.status = MoveTaskStatus::Cancelled;
                    info!(task = %self.task_id, moved = state.moved, "Message move task cancelled");
                    return Step::Stop;
                }
                _ => return Step::Stop,
            }
            if state.moved >= state.to_move {
                drop(state);
                self.finish(MoveTaskStatus::Completed, None);
                return Step::Stop;
            }
            state.to_move - state.moved
        };

        let (Some(source), Some(registry)) = (source.upgrade(), registry.upgrade()) else {
            self.finish(MoveTaskStatus::Failed, Some(NON_EXISTENT_QUEUE));
            return Step::Stop;
        };

        let options = ReceiveOptions {
            max_number_of_messages: batch.min(usize::try_from(remaining).unwrap_or(usize::MAX)),
            wait_time: Some(Duration::ZERO),
            visibility_timeout: None,
        };
        let messages = match source.receive(options).await {
            Ok(messages) => messages,
            Err(err) => {
                self.finish(MoveTaskStatus::Failed, Some(err.code().query_code()));
                return Step::Stop;
            }
        };

        if messages.is_empty() {
            *empty_polls += 1;
            if *empty_polls >= MAX_EMPTY_POLLS {
                self.finish(MoveTaskStatus::Completed, None);
                return Step::Stop;
            }
            return Step::Continue;
        }
        *empty_polls = 0;

        let mut messages = messages.into_iter();
        while let Some(message) = messages.next() {
            if let Err(reason) = self.move_one(&source, &registry, &message) {
                self.release(&source, std::iter::once(message).chain(messages));
                self.finish(MoveTaskStatus::Failed, Some(reason));
                return Step::Stop;
            }

            let done = {
                let mut state = self.state.lock();
                state.moved += 1;
                state.moved >= state.to_move
            };
            if done {
                self.release(&source, messages);
                self.finish(MoveTaskStatus::Completed, None);
                return Step::Stop;
            }
        }
        Step::Continue
    }

    /// Make leased but unmoved messages visible again in the source
    fn release(&self, source: &SqsQueue, messages: impl Iterator<Item = ReceivedMessage>) {
        for message in messages {
            if let Err(err) = source.change_visibility(&message.receipt_handle, 0) {
                debug!(task = %self.task_id, message_id = %message.message_id, error = %err, "Could not release message");
            }
        }
    }

    /// Publish one message to its destination and delete the original.
    /// Errors carry the failure reason recorded on the task.
    fn move_one(
        &self,
        source: &SqsQueue,
        registry: &QueueRegistry,
        message: &ReceivedMessage,
    ) -> Result<(), &'static str> {
        let destination_arn = self
            .destination_arn
            .as_deref()
            .or_else(|| message.attribute("DeadLetterQueueSourceArn"))
            .ok_or(COULD_NOT_DETERMINE_SOURCE)?;
        let destination = registry
            .get_by_arn(destination_arn)
            .ok_or(NON_EXISTENT_QUEUE)?;

        let fifo = destination.is_fifo();
        let input = SendMessageInput {
            body: message.body.clone(),
            delay_seconds: None,
            message_attributes: message.message_attributes.clone(),
            trace_header: message.attribute(TRACE_HEADER).map(str::to_string),
            message_group_id: message
                .attribute("MessageGroupId")
                .filter(|_| fifo)
                .map(str::to_string),
            message_deduplication_id: message
                .attribute("MessageDeduplicationId")
                .filter(|_| fifo)
                .map(str::to_string),
        };

        let sent = destination.republish(input).map_err(|err| {
            warn!(task = %self.task_id, error = %err, "Move task could not publish message");
            err.code().query_code()
        })?;

        if let Err(err) = source.delete(&message.receipt_handle) {
            warn!(task = %self.task_id, message_id = %message.message_id, error = %err, "Move task could not delete original");
        }
        debug!(
            task = %self.task_id,
            from = %message.message_id,
            to = %sent.message_id,
            destination = %destination.name(),
            "Moved message"
        );
        Ok(())
    }

    fn finish(&self, status: MoveTaskStatus, reason: Option<&str>) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.status = status;
        state.failure_reason = reason.map(str::to_string);

        match status {
            MoveTaskStatus::Failed => warn!(
                task = %self.task_id,
                moved = state.moved,
                reason = ?state.failure_reason,
                "Message move task failed"
            ),
            _ => info!(
                task = %self.task_id,
                moved = state.moved,
                status = status.as_str(),
                "Message move task finished"
            ),
        }
    }
}
