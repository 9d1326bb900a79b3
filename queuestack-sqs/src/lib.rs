//! In-memory SQS message-lifecycle engine for QueueStack
//!
//! Provides:
//! - Standard and FIFO queues with delay, visibility and retention timers
//! - Long-polling receive, FIFO deduplication and sequence numbers
//! - Dead-letter redrive and message move tasks
//! - The JSON protocol handler (`X-Amz-Target: AmazonSQS.*`)

pub mod attributes;
pub mod batch;
pub mod config;
pub mod error;
pub mod handlers;
pub mod message;
pub mod move_task;
pub mod queue;
pub mod receipt;
pub mod registry;
pub mod sequence;
pub mod service;
pub mod store;


pub use config::SqsConfig;
pub use error::SqsError;
pub use handlers::handle_request;
pub use message::{MessageAttributeValue, ReceivedMessage, SendMessageInput, SendMessageOutput};
pub use move_task::{MoveTaskStatus, MoveTaskSummary};
pub use queue::{PurgeOutcome, ReceiveOptions, SqsQueue};
pub use registry::QueueRegistry;
pub use service::{ReceiveMessageRequest, SqsService};
