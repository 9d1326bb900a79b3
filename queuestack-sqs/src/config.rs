//! Engine configuration

use serde::Deserialize;
use std::time::Duration;

use queuestack_core::account::{DEFAULT_ACCOUNT_ID, DEFAULT_REGION};

/// Tunables for the SQS engine.
///
/// Durations are expressed in seconds (or milliseconds where noted) so the
/// struct can be loaded straight from a config file or the environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    pub account_id: String,
    pub region: String,
    /// Base URL used when rendering queue URLs
    pub endpoint: String,
    /// Delay between accepting a purge and clearing the queue
    pub purge_cooldown_secs: u64,
    /// How long a deleted queue name stays reserved
    pub deleted_queue_cooldown_secs: u64,
    /// Move task tick period
    pub move_task_tick_millis: u64,
    /// Messages per second when a move task does not specify a rate
    pub move_task_default_rate: u32,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            region: DEFAULT_REGION.to_string(),
            endpoint: "http://localhost:4566".to_string(),
            purge_cooldown_secs: 60,
            deleted_queue_cooldown_secs: 60,
            move_task_tick_millis: 1000,
            move_task_default_rate: 300,
        }
    }
}

impl SqsConfig {
    pub fn purge_cooldown(&self) -> Duration {
        Duration::from_secs(self.purge_cooldown_secs)
    }

    pub fn deleted_queue_cooldown(&self) -> Duration {
        Duration::from_secs(self.deleted_queue_cooldown_secs)
    }

    pub fn move_task_tick(&self) -> Duration {
        Duration::from_millis(self.move_task_tick_millis.max(1))
    }
}
