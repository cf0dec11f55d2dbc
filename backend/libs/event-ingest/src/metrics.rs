use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts};
use tracing::warn;

use crate::outcome::ProcessingOutcome;

#[derive(Clone)]
pub struct IngestMetrics {
    pub received: IntCounter,
    pub processed: IntCounter,
    pub duplicates: IntCounter,
    pub quarantined: IntCounter,
    pub effect_failures: IntCounterVec,
    pub ledger_evictions: IntCounter,
    pub ledger_entries: IntGauge,
}

impl IngestMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let received = IntCounter::with_opts(
            Opts::new(
                "ingest_events_received_total",
                "Total number of events handed to the processor (duplicates and poison included)",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_events_received_total");

        let processed = IntCounter::with_opts(
            Opts::new(
                "ingest_events_processed_total",
                "Total number of events whose business effect was invoked",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_events_processed_total");

        let duplicates = IntCounter::with_opts(
            Opts::new(
                "ingest_events_duplicate_total",
                "Total number of duplicate events ignored",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_events_duplicate_total");

        let quarantined = IntCounter::with_opts(
            Opts::new(
                "ingest_events_quarantined_total",
                "Total number of events diverted to quarantine",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_events_quarantined_total");

        let effect_failures = IntCounterVec::new(
            Opts::new(
                "ingest_effect_failures_total",
                "Total number of business effect failures by kind",
            )
            .const_label("service", service.to_string()),
            &["kind"],
        )
        .expect("valid metric opts for ingest_effect_failures_total");

        let ledger_evictions = IntCounter::with_opts(
            Opts::new(
                "ingest_ledger_evictions_total",
                "Total number of dedup ledger entries evicted by capacity",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_ledger_evictions_total");

        let ledger_entries = IntGauge::with_opts(
            Opts::new(
                "ingest_ledger_entries",
                "Number of identities currently held by dedup ledgers",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_ledger_entries");

        for metric in [
            Box::new(received.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(processed.clone()),
            Box::new(duplicates.clone()),
            Box::new(quarantined.clone()),
            Box::new(effect_failures.clone()),
            Box::new(ledger_evictions.clone()),
            Box::new(ledger_entries.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register ingest metric: {}", e);
            }
        }

        Self {
            received,
            processed,
            duplicates,
            quarantined,
            effect_failures,
            ledger_evictions,
            ledger_entries,
        }
    }

    pub fn record_outcome(&self, outcome: &ProcessingOutcome) {
        match outcome {
            ProcessingOutcome::Processed => self.processed.inc(),
            ProcessingOutcome::DuplicateIgnored => self.duplicates.inc(),
            ProcessingOutcome::Quarantined { .. } => self.quarantined.inc(),
            ProcessingOutcome::EffectFailed { .. } => {
                self.effect_failures.with_label_values(&["failed"]).inc()
            }
            ProcessingOutcome::EffectTimedOut { .. } => {
                self.effect_failures.with_label_values(&["timed_out"]).inc()
            }
        }
    }
}
