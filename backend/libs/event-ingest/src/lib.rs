//! # Event Ingestion Core
//!
//! Consumer-side intake for an at-least-once event stream. Every delivery is
//! recorded, poison events are isolated, and each logically distinct event
//! triggers its business effect at most once.
//!
//! ## Problem
//!
//! An at-least-once log hands the consumer:
//! - **Redeliveries**: the same event arrives again after a rebalance or retry
//! - **Poison events**: payloads that must never reach business logic
//! - **Interleaved partitions**: independent keys arriving concurrently
//!
//! ## Solution
//!
//! - **Dedup ledger**: atomic check-and-mark per identity, bounded by TTL and capacity
//! - **Poison classifier**: pluggable rules, quarantined before the ledger is touched
//! - **Intake log**: every raw delivery in arrival order, duplicates included
//! - **Single writer per partition**: per-key state mutated in arrival order
//!
//! ## Architecture
//!
//! ```text
//! Stream → IngestDispatcher → partition worker → EventProcessor
//!                                                    ↓
//!                         intake log → identity → classifier → ledger → effect
//!                                                    ↓
//!                                             quarantine store
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use event_ingest::{Event, EventProcessor, FnEffect, IngestConfig, ProcessingOutcome};
//!
//! # async fn example() -> event_ingest::IngestResult<()> {
//! let effect = FnEffect::new(|event: Event| async move {
//!     create_notification(event.payload()).await?;
//!     Ok(())
//! });
//! let processor = EventProcessor::new(IngestConfig::from_env()?, effect)?;
//!
//! match processor.intake_global(Event::new("order-42")).await {
//!     ProcessingOutcome::Processed => println!("effect ran"),
//!     ProcessingOutcome::DuplicateIgnored => println!("already handled"),
//!     other => println!("not processed: {}", other),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - Effect invoked at most once per identity within the ledger retention window
//! - Poison events never reach the effect and never enter the ledger
//! - `reset` and `snapshot` never observe a half-applied intake

pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod effect;
pub mod error;
pub mod event;
pub mod journal;
pub mod ledger;
pub mod metrics;
pub mod observability;
pub mod outcome;
pub mod processor;

pub use classifier::{
    classifier_from_config, guarded_classify, BlocklistClassifier, Classification,
    CompositeClassifier, MaxSizeClassifier, PoisonClassifier, SentinelClassifier, Utf8Classifier,
    CLASSIFIER_FAULT, DEFAULT_POISON_SENTINEL,
};
pub use config::IngestConfig;
pub use dispatcher::IngestDispatcher;
pub use effect::{Effect, EffectError, EffectFailurePolicy, FnEffect, NoopEffect};
pub use error::{IngestError, IngestResult};
pub use event::{Delivery, Event, Identity, IdentityPolicy, PartitionKey, Payload, GLOBAL_PARTITION};
pub use journal::{IntakeRecord, QuarantineRecord};
pub use ledger::{DedupLedger, DedupRecord, DedupScope, LedgerConfig};
pub use metrics::IngestMetrics;
pub use observability::{init_tracing, LogFormat};
pub use outcome::{OutcomeKind, ProcessingOutcome};
pub use processor::{EventProcessor, PartitionSnapshot, ProcessorSnapshot, ResetScope};
