//! Dedup Ledger
//!
//! Bounded record of identities whose business effect has already been
//! triggered. Answers "have I seen this logically distinct event" in O(1).
//!
//! # Retention
//! - `ttl`: an identity is guaranteed to be remembered for at least this
//!   long. Older entries are treated as absent and may be evicted; a
//!   redelivery after that point is processed again. This is the accepted
//!   staleness trade-off for bounded memory.
//! - `capacity`: soft bound on live entries, evicting oldest first. With a
//!   TTL configured, eviction never touches an entry inside the window; the
//!   ledger grows past capacity instead. Without a TTL, the window is the
//!   newest `capacity` identities.
//!
//! # Concurrency
//! Entries live in a `DashMap`; `check_and_mark` uses the entry API so the
//! check and the insert happen under the same shard lock. Two concurrent
//! calls for one identity cannot both observe "first time".

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::IntCounter;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::event::{Identity, PartitionKey};

/// Which partitions share a ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupScope {
    /// Each partition key owns its ledger
    #[default]
    Partition,
    /// A single ledger shared by every partition
    Global,
}

impl FromStr for DedupScope {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "partition" | "per-partition" => Ok(DedupScope::Partition),
            "global" | "shared" => Ok(DedupScope::Global),
            other => Err(IngestError::Config(format!("Unknown dedup scope: {}", other))),
        }
    }
}

/// Retention settings for a [`DedupLedger`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerConfig {
    pub ttl: Option<Duration>,
    pub capacity: Option<usize>,
}

impl LedgerConfig {
    /// Never expires, never evicts
    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// Read-only view of one ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupRecord {
    pub identity: Identity,
    /// Partition the identity was first seen on
    pub partition: PartitionKey,
    /// Monotonic first-seen sequence number
    pub sequence: u64,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    sequence: u64,
    partition: PartitionKey,
    first_seen_at: DateTime<Utc>,
    created_at: Instant,
}

impl LedgerEntry {
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => self.created_at.elapsed() > ttl,
            None => false,
        }
    }
}

pub struct DedupLedger {
    entries: DashMap<Identity, LedgerEntry>,
    /// Insertion order for capacity eviction; may hold stale pairs
    order: Mutex<VecDeque<(u64, Identity)>>,
    next_sequence: AtomicU64,
    evictions: AtomicU64,
    eviction_counter: Option<IntCounter>,
    config: LedgerConfig,
}

impl DedupLedger {
    pub fn new(config: LedgerConfig) -> Self {
        debug!(
            ttl = ?config.ttl,
            capacity = ?config.capacity,
            "Initializing dedup ledger"
        );
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(1),
            evictions: AtomicU64::new(0),
            eviction_counter: None,
            config,
        }
    }

    /// Also count capacity evictions on `counter`
    pub fn with_eviction_counter(mut self, counter: IntCounter) -> Self {
        self.eviction_counter = Some(counter);
        self
    }

    pub fn config(&self) -> LedgerConfig {
        self.config
    }

    /// Check whether `identity` is currently remembered
    pub fn seen(&self, identity: &Identity) -> bool {
        self.entries
            .get(identity)
            .map(|entry| !entry.is_expired(self.config.ttl))
            .unwrap_or(false)
    }

    /// Record `identity` as seen, attributing it to `partition`
    pub fn mark_seen(&self, identity: &Identity, partition: &PartitionKey) {
        let _ = self.try_mark(identity, partition);
    }

    /// Atomically check and record `identity`
    ///
    /// Returns `true` if this is the first time the identity is seen (or its
    /// previous entry has expired), `false` for a duplicate.
    pub fn check_and_mark(&self, identity: &Identity, partition: &PartitionKey) -> bool {
        self.try_mark(identity, partition).is_some()
    }

    /// Like [`check_and_mark`](Self::check_and_mark), returning the new
    /// entry's sequence number so the caller can later [`unmark`](Self::unmark) it
    pub fn try_mark(&self, identity: &Identity, partition: &PartitionKey) -> Option<u64> {
        let inserted = match self.entries.entry(identity.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(self.config.ttl) {
                    debug!(identity = %identity, "Expired dedup entry - allowing reprocessing");
                    let entry = self.new_entry(partition);
                    let sequence = entry.sequence;
                    occupied.insert(entry);
                    Some(sequence)
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) => {
                let entry = self.new_entry(partition);
                let sequence = entry.sequence;
                vacant.insert(entry);
                Some(sequence)
            }
        };

        // Shard lock is released before touching the order queue
        if let Some(sequence) = inserted {
            if self.config.capacity.is_some() {
                self.order.lock().push_back((sequence, identity.clone()));
                self.enforce_capacity();
            }
        }

        inserted
    }

    /// Forget the entry created by `try_mark` with `sequence`
    ///
    /// A newer entry for the same identity is left alone.
    pub fn unmark(&self, identity: &Identity, sequence: u64) -> bool {
        let removed = self
            .entries
            .remove_if(identity, |_, entry| entry.sequence == sequence)
            .is_some();
        if removed {
            debug!(identity = %identity, "Dedup entry unmarked for retry");
        }
        removed
    }

    /// Delete entries older than the TTL
    ///
    /// Should be called periodically to reclaim memory; see
    /// `EventProcessor::spawn_ledger_cleanup`.
    ///
    /// # Returns
    /// Number of entries removed
    pub fn cleanup_expired(&self) -> usize {
        let ttl = match self.config.ttl {
            Some(ttl) => ttl,
            None => return 0,
        };

        let expired: Vec<(Identity, u64)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(Some(ttl)))
            .map(|entry| (entry.key().clone(), entry.value().sequence))
            .collect();

        let mut removed = 0;
        for (identity, sequence) in expired {
            if self
                .entries
                .remove_if(&identity, |_, entry| entry.sequence == sequence)
                .is_some()
            {
                removed += 1;
            }
        }

        if self.config.capacity.is_some() {
            self.prune_stale_order();
        }

        if removed > 0 {
            info!(
                removed = removed,
                remaining = self.entries.len(),
                "Cleaned up expired dedup entries"
            );
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries dropped by capacity eviction since creation or reset
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Remove every entry
    pub fn clear(&self) {
        let mut order = self.order.lock();
        self.entries.clear();
        order.clear();
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Remove the entries first seen on `partition`
    pub fn clear_partition(&self, partition: &PartitionKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| &entry.partition != partition);
        if self.config.capacity.is_some() {
            self.prune_stale_order();
        }
        before.saturating_sub(self.entries.len())
    }

    /// Live entries in first-seen order, optionally restricted to one partition
    pub fn records(&self, partition: Option<&PartitionKey>) -> Vec<DedupRecord> {
        let mut records: Vec<DedupRecord> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(self.config.ttl))
            .filter(|entry| partition.map_or(true, |p| &entry.value().partition == p))
            .map(|entry| DedupRecord {
                identity: entry.key().clone(),
                partition: entry.value().partition.clone(),
                sequence: entry.value().sequence,
                first_seen_at: entry.value().first_seen_at,
            })
            .collect();
        records.sort_by_key(|record| record.sequence);
        records
    }

    fn new_entry(&self, partition: &PartitionKey) -> LedgerEntry {
        LedgerEntry {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            partition: partition.clone(),
            first_seen_at: Utc::now(),
            created_at: Instant::now(),
        }
    }

    fn is_current(&self, sequence: u64, identity: &Identity) -> bool {
        self.entries
            .get(identity)
            .map(|entry| entry.sequence == sequence)
            .unwrap_or(false)
    }

    fn enforce_capacity(&self) {
        let capacity = match self.config.capacity {
            Some(capacity) => capacity,
            None => return,
        };

        let mut order = self.order.lock();
        while self.entries.len() > capacity {
            let (sequence, identity) = match order.front() {
                Some((sequence, identity)) => (*sequence, identity.clone()),
                None => break,
            };

            if !self.is_current(sequence, &identity) {
                order.pop_front();
                continue;
            }

            let evictable = match self.config.ttl {
                Some(ttl) => self
                    .entries
                    .get(&identity)
                    .map(|entry| entry.is_expired(Some(ttl)))
                    .unwrap_or(true),
                None => true,
            };

            if !evictable {
                warn!(
                    entries = self.entries.len(),
                    capacity = capacity,
                    "Dedup ledger over capacity; oldest entry is still inside the retention window"
                );
                break;
            }

            order.pop_front();
            if self
                .entries
                .remove_if(&identity, |_, entry| entry.sequence == sequence)
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                if let Some(counter) = &self.eviction_counter {
                    counter.inc();
                }
                debug!(identity = %identity, "Evicted oldest dedup entry");
            }
        }
    }

    fn prune_stale_order(&self) {
        let mut order = self.order.lock();
        while let Some((sequence, identity)) = order.front() {
            if self.is_current(*sequence, identity) {
                break;
            }
            order.pop_front();
        }
    }
}

impl Default for DedupLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::unbounded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn id(value: &str) -> Identity {
        Identity::from(value)
    }

    #[test]
    fn test_basic_deduplication() {
        let ledger = DedupLedger::default();
        let p = PartitionKey::global();

        assert!(ledger.check_and_mark(&id("event_1"), &p));
        assert!(!ledger.check_and_mark(&id("event_1"), &p));
        assert!(ledger.check_and_mark(&id("event_2"), &p));
        assert!(ledger.seen(&id("event_1")));
        assert!(!ledger.seen(&id("event_3")));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_ttl_expiration() {
        let ledger = DedupLedger::new(LedgerConfig {
            ttl: Some(Duration::from_millis(100)),
            capacity: None,
        });
        let p = PartitionKey::global();

        assert!(ledger.check_and_mark(&id("event_1"), &p));
        assert!(!ledger.check_and_mark(&id("event_1"), &p));

        thread::sleep(Duration::from_millis(150));

        assert!(!ledger.seen(&id("event_1")));
        assert!(ledger.check_and_mark(&id("event_1"), &p));
    }

    #[test]
    fn test_cleanup_partial() {
        let ledger = DedupLedger::new(LedgerConfig {
            ttl: Some(Duration::from_millis(100)),
            capacity: None,
        });
        let p = PartitionKey::global();

        for i in 0..5 {
            assert!(ledger.check_and_mark(&id(&format!("event_{}", i)), &p));
        }

        thread::sleep(Duration::from_millis(150));

        for i in 5..10 {
            assert!(ledger.check_and_mark(&id(&format!("event_{}", i)), &p));
        }

        assert_eq!(ledger.len(), 10);
        assert_eq!(ledger.cleanup_expired(), 5);
        assert_eq!(ledger.len(), 5);
    }

    #[test]
    fn test_capacity_without_ttl_evicts_oldest() {
        let ledger = DedupLedger::new(LedgerConfig {
            ttl: None,
            capacity: Some(3),
        });
        let p = PartitionKey::global();

        for name in ["a", "b", "c", "d"] {
            assert!(ledger.check_and_mark(&id(name), &p));
        }

        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.evictions(), 1);
        assert!(!ledger.seen(&id("a")));
        assert!(ledger.seen(&id("d")));
    }

    #[test]
    fn test_capacity_never_evicts_inside_window() {
        let ledger = DedupLedger::new(LedgerConfig {
            ttl: Some(Duration::from_secs(60)),
            capacity: Some(2),
        });
        let p = PartitionKey::global();

        for name in ["a", "b", "c", "d"] {
            assert!(ledger.check_and_mark(&id(name), &p));
        }

        // Over capacity, but every entry is still inside the retention window
        assert_eq!(ledger.len(), 4);
        assert_eq!(ledger.evictions(), 0);
        assert!(!ledger.check_and_mark(&id("a"), &p));
    }

    #[test]
    fn test_capacity_evicts_expired_entries_first() {
        let ledger = DedupLedger::new(LedgerConfig {
            ttl: Some(Duration::from_millis(50)),
            capacity: Some(2),
        });
        let p = PartitionKey::global();

        assert!(ledger.check_and_mark(&id("old_1"), &p));
        assert!(ledger.check_and_mark(&id("old_2"), &p));
        thread::sleep(Duration::from_millis(80));
        assert!(ledger.check_and_mark(&id("new_1"), &p));
        assert!(ledger.check_and_mark(&id("new_2"), &p));

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.evictions(), 2);
    }

    #[test]
    fn test_unmark_only_removes_matching_entry() {
        let ledger = DedupLedger::default();
        let p = PartitionKey::global();

        let sequence = ledger.try_mark(&id("event_1"), &p).unwrap();
        assert!(!ledger.unmark(&id("event_1"), sequence + 100));
        assert!(ledger.seen(&id("event_1")));

        assert!(ledger.unmark(&id("event_1"), sequence));
        assert!(!ledger.seen(&id("event_1")));
        assert!(ledger.check_and_mark(&id("event_1"), &p));
    }

    #[test]
    fn test_clear_partition() {
        let ledger = DedupLedger::default();
        let a = PartitionKey::from("a");
        let b = PartitionKey::from("b");

        ledger.mark_seen(&id("x"), &a);
        ledger.mark_seen(&id("y"), &b);
        ledger.mark_seen(&id("z"), &a);

        assert_eq!(ledger.clear_partition(&a), 2);
        assert!(!ledger.seen(&id("x")));
        assert!(ledger.seen(&id("y")));

        ledger.clear();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_records_are_in_first_seen_order() {
        let ledger = DedupLedger::default();
        let p = PartitionKey::global();

        for name in ["c", "a", "b", "a"] {
            ledger.mark_seen(&id(name), &p);
        }

        let identities: Vec<String> = ledger
            .records(None)
            .into_iter()
            .map(|r| r.identity.to_string())
            .collect();
        assert_eq!(identities, vec!["c", "a", "b"]);
        assert!(ledger.records(Some(&PartitionKey::from("other"))).is_empty());
    }

    #[test]
    fn test_concurrent_check_and_mark_has_single_winner() {
        let ledger = Arc::new(DedupLedger::new(LedgerConfig {
            ttl: Some(Duration::from_secs(60)),
            capacity: Some(10_000),
        }));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let p = PartitionKey::from(format!("p{}", worker));
                    (0..200)
                        .filter(|i| ledger.check_and_mark(&id(&format!("event_{}", i)), &p))
                        .count()
                })
            })
            .collect();

        let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 200);
        assert_eq!(ledger.len(), 200);
    }

    #[test]
    fn test_dedup_scope_parsing() {
        assert_eq!("partition".parse::<DedupScope>().unwrap(), DedupScope::Partition);
        assert_eq!("GLOBAL".parse::<DedupScope>().unwrap(), DedupScope::Global);
        assert!("cluster".parse::<DedupScope>().is_err());
    }
}
