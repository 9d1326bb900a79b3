//! Message record store
//!
//! Holds every record of one queue in append order. Each record carries three
//! independent timers (delay, visibility, retention). Timers are identified by
//! the record's append position, which is never reused, so a late timer can
//! never act on a different record that happens to share a message id.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::message::{MessageRecord, ReceivedMessage};
use crate::receipt;

/// Timed transitions a record can go through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    DelayExpired,
    /// Carries the lease epoch it was armed for
    VisibilityExpired(u64),
    RetentionExpired,
}

/// Arms timers on behalf of the store
pub trait Scheduler {
    fn schedule(&self, after: Duration, position: u64, event: TimerEvent) -> AbortHandle;
}

#[derive(Default)]
struct RecordTimers {
    delay: Option<AbortHandle>,
    visibility: Option<AbortHandle>,
    retention: Option<AbortHandle>,
}

impl RecordTimers {
    fn cancel_all(&mut self) {
        for handle in [
            self.delay.take(),
            self.visibility.take(),
            self.retention.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct StoredRecord {
    record: MessageRecord,
    timers: RecordTimers,
    lease_epoch: u64,
}

/// Counts reported through queue attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    /// Not delayed and visible
    pub visible: usize,
    /// Leased
    pub not_visible: usize,
    pub delayed: usize,
}

#[derive(Default)]
pub struct MessageStore {
    records: BTreeMap<u64, StoredRecord>,
    index: HashMap<String, u64>,
    next_position: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert at the tail and arm delay and retention timers. Returns the
    /// record's position.
    pub fn append(
        &mut self,
        mut record: MessageRecord,
        delay: Duration,
        retention: Duration,
        scheduler: &impl Scheduler,
    ) -> u64 {
        let position = self.next_position;
        self.next_position += 1;

        let mut timers = RecordTimers::default();
        record.delayed = !delay.is_zero();
        if record.delayed {
            timers.delay = Some(scheduler.schedule(delay, position, TimerEvent::DelayExpired));
        }
        timers.retention = Some(scheduler.schedule(retention, position, TimerEvent::RetentionExpired));

        // A message id is unique within one queue
        if let Some(previous) = self.index.insert(record.message_id.clone(), position) {
            if let Some(mut stale) = self.records.remove(&previous) {
                stale.timers.cancel_all();
            }
        }
        self.records.insert(
            position,
            StoredRecord {
                record,
                timers,
                lease_epoch: 0,
            },
        );
        position
    }

    pub fn get(&self, message_id: &str) -> Option<&MessageRecord> {
        let position = self.index.get(message_id)?;
        self.records.get(position).map(|stored| &stored.record)
    }

    pub fn position_of(&self, message_id: &str) -> Option<u64> {
        self.index.get(message_id).copied()
    }

    /// Lease up to `max` offerable records, scanning in append order
    pub fn lease_offerable(
        &mut self,
        max: usize,
        timeout: Duration,
        queue_name: &str,
        scheduler: &impl Scheduler,
    ) -> Vec<ReceivedMessage> {
        let positions: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, stored)| stored.record.is_offerable())
            .map(|(position, _)| *position)
            .take(max)
            .collect();

        positions
            .into_iter()
            .filter_map(|position| self.lease(position, timeout, queue_name, scheduler))
            .collect()
    }

    /// Lease one record: hide it, count the receive, issue a fresh handle and
    /// arm the visibility timer.
    fn lease(
        &mut self,
        position: u64,
        timeout: Duration,
        queue_name: &str,
        scheduler: &impl Scheduler,
    ) -> Option<ReceivedMessage> {
        let stored = self.records.get_mut(&position)?;
        let now = chrono::Utc::now().timestamp_millis();

        let record = &mut stored.record;
        record.visible = false;
        record.receive_count += 1;
        record.first_receive_timestamp.get_or_insert(now);
        record.receipt_handle = Some(receipt::encode(queue_name, &record.message_id, now));

        Self::arm_visibility(stored, position, timeout, scheduler);
        Some(stored.record.snapshot())
    }

    /// Re-arm the visibility timer of an existing record, hiding it if it was
    /// visible. Delay and retention timers are untouched.
    pub fn set_visibility_timeout(
        &mut self,
        position: u64,
        timeout: Duration,
        scheduler: &impl Scheduler,
    ) -> Option<u64> {
        let stored = self.records.get_mut(&position)?;
        stored.record.visible = false;
        Some(Self::arm_visibility(stored, position, timeout, scheduler))
    }

    fn arm_visibility(
        stored: &mut StoredRecord,
        position: u64,
        timeout: Duration,
        scheduler: &impl Scheduler,
    ) -> u64 {
        stored.lease_epoch += 1;
        if let Some(previous) = stored.timers.visibility.take() {
            previous.abort();
        }
        stored.timers.visibility = Some(scheduler.schedule(
            timeout,
            position,
            TimerEvent::VisibilityExpired(stored.lease_epoch),
        ));
        stored.lease_epoch
    }

    /// Clear the delayed flag. Returns true when the record became offerable.
    pub fn expire_delay(&mut self, position: u64) -> bool {
        match self.records.get_mut(&position) {
            Some(stored) => {
                stored.timers.delay = None;
                stored.record.delayed = false;
                stored.record.is_offerable()
            }
            None => false,
        }
    }

    /// Check a visibility expiry against the current lease. Returns the
    /// record's receive count when the expiry is current.
    pub fn visibility_expired(&mut self, position: u64, epoch: u64) -> Option<u32> {
        let stored = self.records.get_mut(&position)?;
        if stored.lease_epoch != epoch || stored.record.visible {
            return None;
        }
        stored.timers.visibility = None;
        Some(stored.record.receive_count)
    }

    /// End the lease and make the record offerable again
    pub fn release(&mut self, position: u64) -> bool {
        match self.records.get_mut(&position) {
            Some(stored) => {
                if let Some(timer) = stored.timers.visibility.take() {
                    timer.abort();
                }
                stored.lease_epoch += 1;
                stored.record.visible = true;
                stored.record.receipt_handle = None;
                stored.record.is_offerable()
            }
            None => false,
        }
    }

    /// Delete a record and cancel its timers
    pub fn remove_at(&mut self, position: u64) -> Option<MessageRecord> {
        let mut stored = self.records.remove(&position)?;
        stored.timers.cancel_all();
        self.index.remove(&stored.record.message_id);
        Some(stored.record)
    }

    pub fn remove(&mut self, message_id: &str) -> Option<MessageRecord> {
        let position = self.position_of(message_id)?;
        self.remove_at(position)
    }

    /// Drop every record and cancel all timers
    pub fn clear(&mut self) -> usize {
        let count = self.records.len();
        for stored in self.records.values_mut() {
            stored.timers.cancel_all();
        }
        self.records.clear();
        self.index.clear();
        count
    }

    pub fn counts(&self) -> StoreCounts {
        let mut counts = StoreCounts::default();
        for stored in self.records.values() {
            let record = &stored.record;
            if record.delayed {
                counts.delayed += 1;
            } else if !record.visible {
                counts.not_visible += 1;
            } else {
                counts.visible += 1;
            }
        }
        counts
    }

    pub fn in_flight(&self) -> usize {
        self.records
            .values()
            .filter(|stored| !stored.record.visible)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SendMessageInput;
    use parking_lot::Mutex;

    /// Records what was scheduled without ever firing
    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<(Duration, u64, TimerEvent)>>,
    }

    impl Scheduler for RecordingScheduler {
        fn schedule(&self, after: Duration, position: u64, event: TimerEvent) -> AbortHandle {
            self.scheduled.lock().push((after, position, event));
            tokio::spawn(std::future::pending::<()>()).abort_handle()
        }
    }

    fn record(id: &str) -> MessageRecord {
        MessageRecord::new(id.to_string(), SendMessageInput::new(id), "000000000000")
    }

    const RETENTION: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_append_preserves_order() {
        let scheduler = RecordingScheduler::default();
        let mut store = MessageStore::new();
        for id in ["a", "b", "c"] {
            store.append(record(id), Duration::ZERO, RETENTION, &scheduler);
        }

        let leased = store.lease_offerable(10, Duration::from_secs(30), "q", &scheduler);
        let ids: Vec<_> = leased.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_delayed_record_not_offerable() {
        let scheduler = RecordingScheduler::default();
        let mut store = MessageStore::new();
        let position = store.append(record("a"), Duration::from_secs(5), RETENTION, &scheduler);

        assert_eq!(store.counts().delayed, 1);
        assert!(store
            .lease_offerable(1, Duration::from_secs(30), "q", &scheduler)
            .is_empty());

        assert!(store.expire_delay(position));
        assert_eq!(
            store
                .lease_offerable(1, Duration::from_secs(30), "q", &scheduler)
                .len(),
            1
        );

        let events: Vec<_> = scheduler.scheduled.lock().iter().map(|s| s.2).collect();
        assert!(events.contains(&TimerEvent::DelayExpired));
        assert!(events.contains(&TimerEvent::RetentionExpired));
    }

    #[tokio::test]
    async fn test_lease_stamps_record() {
        let scheduler = RecordingScheduler::default();
        let mut store = MessageStore::new();
        store.append(record("a"), Duration::ZERO, RETENTION, &scheduler);

        let first = store.lease_offerable(1, Duration::from_secs(30), "q", &scheduler);
        assert_eq!(first[0].receive_count(), 1);
        assert!(first[0].attribute("ApproximateFirstReceiveTimestamp").is_some());
        assert_eq!(store.counts().not_visible, 1);
        assert_eq!(store.in_flight(), 1);

        // Leased records are not offered again
        assert!(store
            .lease_offerable(1, Duration::from_secs(30), "q", &scheduler)
            .is_empty());
    }

    #[tokio::test]
    async fn test_stale_visibility_expiry_ignored() {
        let scheduler = RecordingScheduler::default();
        let mut store = MessageStore::new();
        let position = store.append(record("a"), Duration::ZERO, RETENTION, &scheduler);
        store.lease_offerable(1, Duration::from_secs(30), "q", &scheduler);

        let epoch = store
            .set_visibility_timeout(position, Duration::from_secs(60), &scheduler)
            .unwrap();

        assert_eq!(store.visibility_expired(position, epoch - 1), None);
        assert_eq!(store.visibility_expired(position, epoch), Some(1));
        assert!(store.release(position));
        assert_eq!(store.get("a").unwrap().receipt_handle, None);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let scheduler = RecordingScheduler::default();
        let mut store = MessageStore::new();
        store.append(record("a"), Duration::ZERO, RETENTION, &scheduler);
        store.append(record("b"), Duration::ZERO, RETENTION, &scheduler);

        assert!(store.remove("a").is_some());
        assert!(store.remove("a").is_none());
        assert_eq!(store.len(), 1);

        assert_eq!(store.clear(), 1);
        assert!(store.is_empty());
        assert!(store.get("b").is_none());
    }
}
