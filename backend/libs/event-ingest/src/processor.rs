//! Event Processor
//!
//! Orchestrates intake for every partition key:
//!
//! ```text
//! intake(event, key)
//!   → append to key's intake log        (always, duplicates included)
//!   → derive identity                   (malformed → quarantine)
//!   → classify                          (poison → quarantine)
//!   → ledger check-and-mark             (seen → DuplicateIgnored)
//!   → effect, under budget              (Processed / EffectFailed / EffectTimedOut)
//! ```
//!
//! Each partition's state sits behind its own async mutex, so all mutations
//! to one key are performed by a single writer in arrival order. Intake also
//! holds a shared reset gate; `reset(All)` takes it exclusively, so it
//! observes either none or all of an intake. `snapshot()` shares the gate and
//! locks partitions one at a time: every partition is captured between two
//! intakes, and intake on other keys is never held up by a pending snapshot.
//!
//! The ledger is marked *before* the effect runs. A duplicate arriving while
//! the effect is still in flight (possible with a global ledger) is already
//! classified as a duplicate.
//!
//! The effect must not call back into `reset` or `snapshot` on the same
//! processor; it runs while the partition is held.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::{classifier_from_config, guarded_classify, Classification, PoisonClassifier};
use crate::config::IngestConfig;
use crate::effect::{run_with_budget, Effect, EffectError, EffectFailurePolicy};
use crate::error::IngestResult;
use crate::event::{Event, Identity, PartitionKey};
use crate::journal::{IntakeLog, IntakeRecord, QuarantineRecord, QuarantineStore};
use crate::ledger::{DedupLedger, DedupRecord, DedupScope};
use crate::metrics::IngestMetrics;
use crate::outcome::ProcessingOutcome;

/// Scope of a [`EventProcessor::reset`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    Partition(PartitionKey),
    All,
}

/// Point-in-time copy of one partition's state
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionSnapshot {
    pub received: Vec<IntakeRecord>,
    pub processed: Vec<DedupRecord>,
    pub quarantined: Vec<QuarantineRecord>,
}

/// Consistent copy of every partition's state
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorSnapshot {
    pub partitions: BTreeMap<PartitionKey, PartitionSnapshot>,
}

impl ProcessorSnapshot {
    pub fn partition(&self, key: &PartitionKey) -> Option<&PartitionSnapshot> {
        self.partitions.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(|p| {
            p.received.is_empty() && p.processed.is_empty() && p.quarantined.is_empty()
        })
    }
}

struct PartitionState {
    key: PartitionKey,
    intake_log: IntakeLog,
    quarantine: QuarantineStore,
    ledger: Arc<DedupLedger>,
    next_sequence: u64,
}

impl PartitionState {
    fn record_arrival(&mut self, event: &Event) -> u64 {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.intake_log.append(IntakeRecord::new(sequence, event));
        sequence
    }

    fn clear(&mut self, shared_ledger: bool) {
        self.intake_log.clear();
        self.quarantine.clear();
        self.next_sequence = 0;
        if shared_ledger {
            self.ledger.clear_partition(&self.key);
        } else {
            self.ledger.clear();
        }
    }

    fn snapshot(&self) -> PartitionSnapshot {
        PartitionSnapshot {
            received: self.intake_log.snapshot(),
            processed: self.ledger.records(Some(&self.key)),
            quarantined: self.quarantine.snapshot(),
        }
    }
}

#[derive(Clone)]
struct PartitionHandle {
    state: Arc<Mutex<PartitionState>>,
    ledger: Arc<DedupLedger>,
}

pub struct EventProcessor {
    config: IngestConfig,
    classifier: Arc<dyn PoisonClassifier>,
    effect: Arc<dyn Effect>,
    partitions: DashMap<PartitionKey, PartitionHandle>,
    shared_ledger: Option<Arc<DedupLedger>>,
    reset_gate: RwLock<()>,
    metrics: IngestMetrics,
}

impl EventProcessor {
    /// Create a processor using the classifier described by `config`
    pub fn new(config: IngestConfig, effect: impl Effect + 'static) -> IngestResult<Self> {
        config.check()?;

        let metrics = IngestMetrics::new(&config.service_name);
        let shared_ledger = match config.dedup_scope {
            DedupScope::Global => Some(Arc::new(
                DedupLedger::new(config.ledger_config())
                    .with_eviction_counter(metrics.ledger_evictions.clone()),
            )),
            DedupScope::Partition => None,
        };

        info!(
            service = %config.service_name,
            identity_policy = ?config.identity_policy,
            dedup_scope = ?config.dedup_scope,
            effect_timeout = ?config.effect_timeout,
            "Event processor initialized"
        );

        Ok(Self {
            classifier: Arc::new(classifier_from_config(&config)),
            effect: Arc::new(effect),
            partitions: DashMap::new(),
            shared_ledger,
            reset_gate: RwLock::new(()),
            metrics,
            config,
        })
    }

    /// Replace the poison classifier
    pub fn with_classifier(mut self, classifier: impl PoisonClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    /// Hand one event to the processor on `partition`
    ///
    /// Never fails: every failure mode is a [`ProcessingOutcome`]. Returns
    /// once the event is fully recorded and, if applicable, its effect has
    /// completed.
    pub async fn intake(&self, event: Event, partition: PartitionKey) -> ProcessingOutcome {
        let _gate = self.reset_gate.read().await;
        let handle = self.partition_handle(&partition);
        let mut state = handle.state.lock().await;

        let sequence = state.record_arrival(&event);
        self.metrics.received.inc();
        info!(
            partition = %partition,
            sequence = sequence,
            delivery_attempt = event.delivery_attempt(),
            payload = %event.payload(),
            "Received event"
        );

        let outcome = self.process(&mut state, sequence, &event).await;
        self.metrics.record_outcome(&outcome);
        outcome
    }

    /// Intake on the implicit global partition
    pub async fn intake_global(&self, event: Event) -> ProcessingOutcome {
        self.intake(event, PartitionKey::global()).await
    }

    async fn process(
        &self,
        state: &mut PartitionState,
        sequence: u64,
        event: &Event,
    ) -> ProcessingOutcome {
        let identity = match self.config.identity_policy.derive(event) {
            Ok(identity) => identity,
            Err(e) => {
                let reason = format!("malformed-event: {}", e);
                return Self::quarantine(state, sequence, None, event, reason);
            }
        };

        if let Classification::Quarantine(reason) = guarded_classify(self.classifier.as_ref(), event) {
            return Self::quarantine(state, sequence, Some(identity), event, reason);
        }

        let ledger_sequence = match state.ledger.try_mark(&identity, &state.key) {
            Some(ledger_sequence) => ledger_sequence,
            None => {
                warn!(
                    partition = %state.key,
                    identity = %identity,
                    "Duplicate event ignored"
                );
                return ProcessingOutcome::DuplicateIgnored;
            }
        };

        self.refresh_ledger_gauge();

        match run_with_budget(self.effect.as_ref(), event, self.config.effect_timeout).await {
            Ok(()) => {
                info!(
                    partition = %state.key,
                    identity = %identity,
                    "Processed event"
                );
                ProcessingOutcome::Processed
            }
            Err(err) => {
                warn!(
                    partition = %state.key,
                    identity = %identity,
                    error = %err,
                    "Event effect failed"
                );
                self.apply_failure_policy(state, &identity, ledger_sequence);

                match err {
                    EffectError::Elapsed(budget) => ProcessingOutcome::EffectTimedOut { budget },
                    EffectError::Failed(error) | EffectError::Panicked(error) => {
                        ProcessingOutcome::EffectFailed { error }
                    }
                }
            }
        }
    }

    fn quarantine(
        state: &mut PartitionState,
        sequence: u64,
        identity: Option<Identity>,
        event: &Event,
        reason: String,
    ) -> ProcessingOutcome {
        error!(
            partition = %state.key,
            sequence = sequence,
            payload = %event.payload(),
            reason = %reason,
            "Poison event quarantined"
        );
        state
            .quarantine
            .append(QuarantineRecord::new(sequence, identity, event, reason.clone()));
        ProcessingOutcome::Quarantined { reason }
    }

    fn apply_failure_policy(&self, state: &PartitionState, identity: &Identity, ledger_sequence: u64) {
        if self.config.effect_failure_policy == EffectFailurePolicy::UnmarkForRetry
            && state.ledger.unmark(identity, ledger_sequence)
        {
            self.refresh_ledger_gauge();
            debug!(
                partition = %state.key,
                identity = %identity,
                "Identity unmarked; next redelivery will be processed"
            );
        }
    }

    /// Atomically clear ledger, intake log and quarantine store for `scope`
    pub async fn reset(&self, scope: ResetScope) {
        match scope {
            ResetScope::All => {
                let _gate = self.reset_gate.write().await;
                let partitions = self.partitions.len();
                self.partitions.clear();
                if let Some(ledger) = &self.shared_ledger {
                    ledger.clear();
                }
                self.metrics.ledger_entries.set(0);
                info!(partitions = partitions, "Event processor state cleared");
            }
            ResetScope::Partition(key) => {
                let _gate = self.reset_gate.read().await;
                let handle = match self.existing_handle(&key) {
                    Some(handle) => handle,
                    None => return,
                };
                let mut state = handle.state.lock().await;
                state.clear(self.shared_ledger.is_some());
                drop(state);
                self.refresh_ledger_gauge();
                info!(partition = %key, "Partition state cleared");
            }
        }
    }

    /// Raw deliveries on `partition`, in arrival order
    pub async fn received_events(&self, partition: &PartitionKey) -> Vec<IntakeRecord> {
        match self.existing_handle(partition) {
            Some(handle) => {
                let state = handle.state.lock().await;
                state.intake_log.snapshot()
            }
            None => Vec::new(),
        }
    }

    /// Identities whose effect was triggered on `partition`, in first-seen order
    pub async fn processed_identities(&self, partition: &PartitionKey) -> Vec<DedupRecord> {
        match self.existing_handle(partition) {
            Some(handle) => {
                let state = handle.state.lock().await;
                state.ledger.records(Some(&state.key))
            }
            None => Vec::new(),
        }
    }

    /// Quarantined deliveries on `partition`, in arrival order
    pub async fn quarantined_events(&self, partition: &PartitionKey) -> Vec<QuarantineRecord> {
        match self.existing_handle(partition) {
            Some(handle) => {
                let state = handle.state.lock().await;
                state.quarantine.snapshot()
            }
            None => Vec::new(),
        }
    }

    /// Partition keys with state, sorted
    pub fn partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self.partitions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Snapshot of every partition, each taken between two intakes
    ///
    /// No `reset(All)` can interleave. A partition whose effect is in flight
    /// is captured once that intake completes; other partitions keep
    /// accepting intake meanwhile.
    pub async fn snapshot(&self) -> ProcessorSnapshot {
        let _gate = self.reset_gate.read().await;

        let handles: Vec<(PartitionKey, PartitionHandle)> = self
            .partitions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut partitions = BTreeMap::new();
        for (key, handle) in handles {
            let state = handle.state.lock().await;
            partitions.insert(key, state.snapshot());
        }

        ProcessorSnapshot { partitions }
    }

    /// Total identities held across ledgers
    pub fn ledger_len(&self) -> usize {
        match &self.shared_ledger {
            Some(ledger) => ledger.len(),
            None => self.partitions.iter().map(|e| e.value().ledger.len()).sum::<usize>(),
        }
    }

    /// Sweep expired entries from every ledger
    pub fn cleanup_expired(&self) -> usize {
        let removed = match &self.shared_ledger {
            Some(ledger) => ledger.cleanup_expired(),
            None => self
                .partitions
                .iter()
                .map(|e| Arc::clone(&e.value().ledger))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|ledger| ledger.cleanup_expired())
                .sum::<usize>(),
        };
        self.refresh_ledger_gauge();
        removed
    }

    fn refresh_ledger_gauge(&self) {
        self.metrics.ledger_entries.set(self.ledger_len() as i64);
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `interval`
    pub fn spawn_ledger_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = processor.cleanup_expired();
                debug!(
                    removed = removed,
                    remaining = processor.ledger_len(),
                    "Ledger cleanup sweep finished"
                );
            }
        })
    }

    fn existing_handle(&self, key: &PartitionKey) -> Option<PartitionHandle> {
        self.partitions.get(key).map(|e| e.value().clone())
    }

    fn partition_handle(&self, key: &PartitionKey) -> PartitionHandle {
        if let Some(handle) = self.existing_handle(key) {
            return handle;
        }

        self.partitions
            .entry(key.clone())
            .or_insert_with(|| self.new_partition(key))
            .value()
            .clone()
    }

    fn new_partition(&self, key: &PartitionKey) -> PartitionHandle {
        let ledger = match &self.shared_ledger {
            Some(ledger) => Arc::clone(ledger),
            None => Arc::new(
                DedupLedger::new(self.config.ledger_config())
                    .with_eviction_counter(self.metrics.ledger_evictions.clone()),
            ),
        };

        debug!(partition = %key, "Creating partition state");

        let state = PartitionState {
            key: key.clone(),
            intake_log: IntakeLog::new(self.config.intake_log_retention),
            quarantine: QuarantineStore::new(self.config.quarantine_retention),
            ledger: Arc::clone(&ledger),
            next_sequence: 0,
        };

        PartitionHandle {
            state: Arc::new(Mutex::new(state)),
            ledger,
        }
    }
}
