//! Process-wide queue registry
//!
//! Maps `(account, region, name)` to live queues, remembers recently deleted
//! names, and keeps the per-source history of message move tasks. The
//! registry is created once by the service and handed to every queue as a
//! weak reference so redrive can find dead-letter queues.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use queuestack_core::{AccountRegionKey, Arn};
use tokio::time::Instant;
use tracing::info;

use crate::attributes::{validate_queue_name, QueueAttributeName, QueueAttributes};
use crate::config::SqsConfig;
use crate::error::SqsError;
use crate::move_task::{MessageMoveTask, MoveTaskStatus, MAX_TASK_HISTORY};
use crate::queue::SqsQueue;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub scope: AccountRegionKey,
    pub name: String,
}

impl QueueKey {
    pub fn new(scope: &AccountRegionKey, name: &str) -> Self {
        Self {
            scope: scope.clone(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct QueueRegistry {
    config: SqsConfig,
    queues: DashMap<QueueKey, Arc<SqsQueue>>,
    tombstones: DashMap<QueueKey, Instant>,
    /// Newest first, keyed by source queue ARN
    move_tasks: DashMap<String, VecDeque<Arc<MessageMoveTask>>>,
}

impl QueueRegistry {
    pub fn new(config: SqsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            queues: DashMap::new(),
            tombstones: DashMap::new(),
            move_tasks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &SqsConfig {
        &self.config
    }

    pub fn queue_url(&self, scope: &AccountRegionKey, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            scope.account_id,
            name
        )
    }

    /// Create a queue, or return the existing one when every requested
    /// attribute already matches
    pub fn create_queue(
        self: &Arc<Self>,
        scope: &AccountRegionKey,
        name: &str,
        attrs: &HashMap<String, String>,
    ) -> Result<Arc<SqsQueue>, SqsError> {
        validate_queue_name(name)?;
        let attributes = QueueAttributes::for_new_queue(name, attrs)?;
        let key = QueueKey::new(scope, name);

        if let Some(deleted_at) = self.tombstones.get(&key).map(|t| *t.value()) {
            if deleted_at.elapsed() < self.config.deleted_queue_cooldown() {
                return Err(SqsError::QueueDeletedRecently);
            }
            self.tombstones.remove(&key);
        }

        let existing = match self.queues.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let queue = SqsQueue::new(
                    name.to_string(),
                    self.queue_url(scope, name),
                    scope.clone(),
                    attributes,
                    self.config.purge_cooldown(),
                    Arc::downgrade(self),
                );
                entry.insert(queue.clone());
                info!(queue = %name, url = %queue.url(), fifo = queue.is_fifo(), "Created queue");
                return Ok(queue);
            }
        };

        let current = existing.attributes();
        for key in attrs.keys() {
            let attr = QueueAttributeName::parse(key)?;
            if current.stored_value(attr) != attributes.stored_value(attr) {
                return Err(SqsError::QueueAlreadyExists(key.clone()));
            }
        }
        Ok(existing)
    }

    pub fn get(&self, scope: &AccountRegionKey, name: &str) -> Option<Arc<SqsQueue>> {
        self.queues
            .get(&QueueKey::new(scope, name))
            .map(|q| q.value().clone())
    }

    pub fn get_by_arn(&self, arn: &str) -> Option<Arc<SqsQueue>> {
        let arn = Arn::parse(arn)?;
        if arn.service != "sqs" {
            return None;
        }
        self.get(&arn.scope, &arn.resource)
    }

    /// Remove a queue, stop its timers and reserve its name for the cool-down
    pub fn delete(&self, scope: &AccountRegionKey, name: &str) -> Result<(), SqsError> {
        let key = QueueKey::new(scope, name);
        let (key, queue) = self
            .queues
            .remove(&key)
            .ok_or(SqsError::QueueDoesNotExist)?;

        self.tombstones.insert(key, Instant::now());
        if let Some((_, tasks)) = self.move_tasks.remove(queue.arn()) {
            tasks.iter().for_each(|task| task.abort());
        }
        queue.shutdown();

        info!(queue = %name, "Deleted queue");
        Ok(())
    }

    /// Live queues in `scope`, sorted by name
    pub fn list(&self, scope: &AccountRegionKey, prefix: Option<&str>) -> Vec<Arc<SqsQueue>> {
        let mut queues: Vec<Arc<SqsQueue>> = self
            .queues
            .iter()
            .filter(|entry| &entry.key().scope == scope)
            .filter(|entry| prefix.map_or(true, |p| entry.key().name.starts_with(p)))
            .map(|entry| entry.value().clone())
            .collect();
        queues.sort_by(|a, b| a.name().cmp(b.name()));
        queues
    }

    /// Queues whose redrive policy targets `dlq_arn`
    pub fn dead_letter_sources(&self, dlq_arn: &str) -> Vec<Arc<SqsQueue>> {
        let mut sources: Vec<Arc<SqsQueue>> = self
            .queues
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|queue| {
                queue
                    .redrive_policy()
                    .is_some_and(|policy| policy.dead_letter_target_arn == dlq_arn)
            })
            .collect();
        sources.sort_by(|a, b| a.name().cmp(b.name()));
        sources
    }

    /// Record a new task; fails while another task on the same source is
    /// still running
    pub(crate) fn register_move_task(&self, task: Arc<MessageMoveTask>) -> Result<(), SqsError> {
        let mut history = self.move_tasks.entry(task.source_arn.clone()).or_default();
        if history
            .iter()
            .any(|existing| existing.status() == MoveTaskStatus::Running)
        {
            return Err(SqsError::InvalidParameterValue(
                "There is already a task running. Only one active task is allowed for a source queue arn at a given time."
                    .to_string(),
            ));
        }

        history.push_front(task);
        history.truncate(MAX_TASK_HISTORY);
        Ok(())
    }

    /// Task history for a source, newest first
    pub fn move_tasks(&self, source_arn: &str) -> Vec<Arc<MessageMoveTask>> {
        self.move_tasks
            .get(source_arn)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn find_move_task(&self, source_arn: &str, task_id: &str) -> Option<Arc<MessageMoveTask>> {
        self.move_tasks
            .get(source_arn)?
            .iter()
            .find(|task| task.task_id == task_id)
            .cloned()
    }

    /// Drop every queue, tombstone and move task
    pub fn reset(&self) {
        let tasks: Vec<Arc<MessageMoveTask>> = self
            .move_tasks
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        self.move_tasks.clear();
        tasks.iter().for_each(|task| task.abort());

        let queues: Vec<Arc<SqsQueue>> = self.queues.iter().map(|e| e.value().clone()).collect();
        self.queues.clear();
        self.tombstones.clear();
        queues.iter().for_each(|queue| queue.shutdown());

        info!(queues = queues.len(), tasks = tasks.len(), "Registry reset");
    }
}
