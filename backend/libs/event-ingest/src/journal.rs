//! Ordered Intake Log and Quarantine Store
//!
//! Both are append-only sequences owned by a single partition. They are
//! mutated only through `&mut self` by the partition's writer, and read
//! through [`AppendLog::snapshot`], which returns an owned copy: later
//! appends are never visible through a snapshot already taken.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::event::{Event, Identity, Payload};

/// One raw delivery, as received (duplicates and poison included)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntakeRecord {
    /// Arrival position within the partition, starting at 1
    pub sequence: u64,
    pub payload: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub delivery_attempt: u32,
    pub received_at: DateTime<Utc>,
}

impl IntakeRecord {
    pub fn new(sequence: u64, event: &Event) -> Self {
        Self {
            sequence,
            payload: event.payload().clone(),
            key: event.key().map(str::to_string),
            delivery_attempt: event.delivery_attempt(),
            received_at: Utc::now(),
        }
    }
}

/// An event diverted from normal processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantineRecord {
    /// Intake sequence of the delivery that was quarantined
    pub sequence: u64,
    /// `None` when the event was too malformed to derive an identity
    pub identity: Option<Identity>,
    pub payload: Payload,
    pub reason: String,
    pub delivery_attempt: u32,
    pub quarantined_at: DateTime<Utc>,
}

impl QuarantineRecord {
    pub fn new(
        sequence: u64,
        identity: Option<Identity>,
        event: &Event,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            sequence,
            identity,
            payload: event.payload().clone(),
            reason: reason.into(),
            delivery_attempt: event.delivery_attempt(),
            quarantined_at: Utc::now(),
        }
    }
}

/// Append-only sequence with optional retention
///
/// With a retention of `n`, only the newest `n` entries are kept; the
/// relative order of retained entries never changes.
#[derive(Debug, Clone)]
pub struct AppendLog<T> {
    entries: VecDeque<T>,
    retention: Option<usize>,
    appended: u64,
}

/// Per-partition record of every delivery
pub type IntakeLog = AppendLog<IntakeRecord>;

/// Per-partition record of quarantined deliveries
pub type QuarantineStore = AppendLog<QuarantineRecord>;

impl<T: Clone> AppendLog<T> {
    pub fn new(retention: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
            appended: 0,
        }
    }

    pub fn append(&mut self, entry: T) {
        self.entries.push_back(entry);
        self.appended += 1;

        if let Some(retention) = self.retention {
            while self.entries.len() > retention {
                self.entries.pop_front();
            }
        }
    }

    /// Owned, ordered copy of the retained entries
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ever appended, including ones dropped by retention
    pub fn total_appended(&self) -> u64 {
        self.appended
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.appended = 0;
    }
}

impl<T: Clone> Default for AppendLog<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let mut log = IntakeLog::default();
        for (i, payload) in ["event1", "event2", "event3"].iter().enumerate() {
            log.append(IntakeRecord::new(i as u64 + 1, &Event::new(*payload)));
        }

        let payloads: Vec<String> = log
            .snapshot()
            .iter()
            .map(|r| r.payload.to_string())
            .collect();
        assert_eq!(payloads, vec!["event1", "event2", "event3"]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut log: AppendLog<u32> = AppendLog::default();
        log.append(1);

        let mut snapshot = log.snapshot();
        snapshot.push(99);
        log.append(2);

        assert_eq!(snapshot, vec![1, 99]);
        assert_eq!(log.snapshot(), vec![1, 2]);
    }

    #[test]
    fn test_retention_drops_oldest() {
        let mut log: AppendLog<u32> = AppendLog::new(Some(2));
        for i in 1..=5 {
            log.append(i);
        }

        assert_eq!(log.snapshot(), vec![4, 5]);
        assert_eq!(log.total_appended(), 5);

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.total_appended(), 0);
    }

    #[test]
    fn test_quarantine_record_keeps_context() {
        let event = Event::new("poison-pill").with_delivery_attempt(2);
        let record = QuarantineRecord::new(7, Some(Identity::from("poison-pill")), &event, "poison-sentinel");

        assert_eq!(record.sequence, 7);
        assert_eq!(record.payload.to_string(), "poison-pill");
        assert_eq!(record.reason, "poison-sentinel");
        assert_eq!(record.delivery_attempt, 2);
    }
}
