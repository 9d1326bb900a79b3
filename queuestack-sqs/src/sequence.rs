//! FIFO sequence numbers and deduplication

use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::attributes::DeduplicationScope;

/// Identical deduplication ids inside this window resolve to the first send
pub const DEDUP_WINDOW: Duration = Duration::from_secs(300);

struct GroupSequence {
    seed: u64,
    counter: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deduplicated {
    pub message_id: String,
    pub sequence_number: Option<String>,
}

struct DedupEntry {
    original: Deduplicated,
    recorded_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    group: Option<String>,
    deduplication_id: String,
}

impl DedupKey {
    fn new(scope: DeduplicationScope, group: &str, deduplication_id: &str) -> Self {
        Self {
            group: match scope {
                DeduplicationScope::Queue => None,
                DeduplicationScope::MessageGroup => Some(group.to_string()),
            },
            deduplication_id: deduplication_id.to_string(),
        }
    }
}

/// Per-queue sequence and deduplication bookkeeping
#[derive(Default)]
pub struct SequenceTracker {
    groups: HashMap<String, GroupSequence>,
    sent: HashMap<DedupKey, DedupEntry>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next 20-digit sequence number for `group`: a 10-digit per-group seed
    /// followed by the zero-padded per-group counter.
    pub fn next_sequence_number(&mut self, group: &str) -> String {
        let entry = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupSequence {
                seed: rand::thread_rng().gen_range(1_000_000_000..10_000_000_000),
                counter: 0,
            });
        entry.counter += 1;
        format!("{}{:010}", entry.seed, entry.counter)
    }

    /// Earlier send with the same deduplication id still inside the window
    pub fn find_duplicate(
        &mut self,
        scope: DeduplicationScope,
        group: &str,
        deduplication_id: &str,
    ) -> Option<Deduplicated> {
        let now = Instant::now();
        self.sent
            .retain(|_, entry| now.duration_since(entry.recorded_at) < DEDUP_WINDOW);

        self.sent
            .get(&DedupKey::new(scope, group, deduplication_id))
            .map(|entry| entry.original.clone())
    }

    pub fn remember(
        &mut self,
        scope: DeduplicationScope,
        group: &str,
        deduplication_id: &str,
        original: Deduplicated,
    ) {
        self.sent.insert(
            DedupKey::new(scope, group, deduplication_id),
            DedupEntry {
                original,
                recorded_at: Instant::now(),
            },
        );
    }

    pub fn clear_deduplication(&mut self) {
        self.sent.clear();
    }
}
