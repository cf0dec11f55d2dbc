//! Poison classification
//!
//! A classifier decides, from the event alone, whether it may enter normal
//! processing. Classifiers hold no shared mutable state. A classifier that
//! panics is treated as having quarantined the event with
//! [`CLASSIFIER_FAULT`], so a broken rule cannot halt intake.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::config::IngestConfig;
use crate::event::{Event, Payload};

/// Quarantine reason recorded when a classifier faults
pub const CLASSIFIER_FAULT: &str = "classifier-fault";

/// Default poison sentinel
pub const DEFAULT_POISON_SENTINEL: &str = "poison-pill";

/// Decision for a single event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Accept,
    Quarantine(String),
}

impl Classification {
    pub fn quarantine(reason: impl Into<String>) -> Self {
        Classification::Quarantine(reason.into())
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Classification::Accept)
    }
}

/// Poison policy strategy
pub trait PoisonClassifier: Send + Sync {
    fn classify(&self, event: &Event) -> Classification;
}

impl<F> PoisonClassifier for F
where
    F: Fn(&Event) -> Classification + Send + Sync,
{
    fn classify(&self, event: &Event) -> Classification {
        self(event)
    }
}

/// Run `classifier`, converting a panic into `Quarantine("classifier-fault")`
pub fn guarded_classify(classifier: &dyn PoisonClassifier, event: &Event) -> Classification {
    match catch_unwind(AssertUnwindSafe(|| classifier.classify(event))) {
        Ok(classification) => classification,
        Err(_) => {
            tracing::error!(payload = %event.payload(), "Poison classifier panicked");
            Classification::quarantine(CLASSIFIER_FAULT)
        }
    }
}

/// Quarantines payloads equal to a designated sentinel
#[derive(Debug, Clone)]
pub struct SentinelClassifier {
    sentinel: Payload,
}

impl SentinelClassifier {
    pub fn new(sentinel: impl Into<Payload>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }
}

impl Default for SentinelClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_POISON_SENTINEL)
    }
}

impl PoisonClassifier for SentinelClassifier {
    fn classify(&self, event: &Event) -> Classification {
        if event.payload() == &self.sentinel {
            Classification::quarantine("poison-sentinel")
        } else {
            Classification::Accept
        }
    }
}

/// Quarantines payloads larger than a byte limit
#[derive(Debug, Clone, Copy)]
pub struct MaxSizeClassifier {
    max_bytes: usize,
}

impl MaxSizeClassifier {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl PoisonClassifier for MaxSizeClassifier {
    fn classify(&self, event: &Event) -> Classification {
        let len = event.payload().len();
        if len > self.max_bytes {
            Classification::quarantine(format!(
                "payload-too-large: {} > {} bytes",
                len, self.max_bytes
            ))
        } else {
            Classification::Accept
        }
    }
}

/// Quarantines payloads that are not valid UTF-8
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Classifier;

impl PoisonClassifier for Utf8Classifier {
    fn classify(&self, event: &Event) -> Classification {
        match event.payload().as_str() {
            Some(_) => Classification::Accept,
            None => Classification::quarantine("invalid-utf8"),
        }
    }
}

/// Quarantines payloads on an explicit blocklist
#[derive(Debug, Clone, Default)]
pub struct BlocklistClassifier {
    blocked: HashSet<Payload>,
}

impl BlocklistClassifier {
    pub fn new<I, P>(blocked: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Payload>,
    {
        Self {
            blocked: blocked.into_iter().map(Into::into).collect(),
        }
    }
}

impl PoisonClassifier for BlocklistClassifier {
    fn classify(&self, event: &Event) -> Classification {
        if self.blocked.contains(event.payload()) {
            Classification::quarantine("blocklisted")
        } else {
            Classification::Accept
        }
    }
}

/// Applies rules in order; the first quarantine wins
#[derive(Default)]
pub struct CompositeClassifier {
    rules: Vec<Box<dyn PoisonClassifier>>,
}

impl CompositeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: impl PoisonClassifier + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl PoisonClassifier for CompositeClassifier {
    fn classify(&self, event: &Event) -> Classification {
        for rule in &self.rules {
            let classification = rule.classify(event);
            if !classification.is_accept() {
                return classification;
            }
        }
        Classification::Accept
    }
}

/// Build the classifier described by `config`
pub fn classifier_from_config(config: &IngestConfig) -> CompositeClassifier {
    let mut classifier = CompositeClassifier::new();

    if let Some(sentinel) = &config.poison_sentinel {
        classifier = classifier.with_rule(SentinelClassifier::new(sentinel.as_str()));
    }
    if let Some(max_bytes) = config.max_payload_bytes {
        classifier = classifier.with_rule(MaxSizeClassifier::new(max_bytes));
    }
    if config.require_utf8 {
        classifier = classifier.with_rule(Utf8Classifier);
    }
    if !config.blocklist.is_empty() {
        classifier = classifier.with_rule(BlocklistClassifier::new(
            config.blocklist.iter().map(String::as_str),
        ));
    }

    classifier
}
