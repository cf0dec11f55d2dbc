use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Result of handing one event to the processor
///
/// Every intake yields exactly one outcome; none of them is an error from
/// the pipeline's point of view. The caller decides whether to acknowledge
/// the underlying delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessingOutcome {
    /// First time this identity was seen; effect ran successfully
    Processed,

    /// Identity already in the ledger; effect not invoked
    DuplicateIgnored,

    /// Event diverted to the quarantine store; effect not invoked
    Quarantined { reason: String },

    /// Effect returned an error (or panicked)
    EffectFailed { error: String },

    /// Effect exceeded its execution budget
    EffectTimedOut {
        #[serde(with = "duration_millis")]
        budget: Duration,
    },
}

/// Fieldless view of [`ProcessingOutcome`], handy for comparisons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Processed,
    DuplicateIgnored,
    Quarantined,
    EffectFailed,
    EffectTimedOut,
}

impl ProcessingOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ProcessingOutcome::Processed => OutcomeKind::Processed,
            ProcessingOutcome::DuplicateIgnored => OutcomeKind::DuplicateIgnored,
            ProcessingOutcome::Quarantined { .. } => OutcomeKind::Quarantined,
            ProcessingOutcome::EffectFailed { .. } => OutcomeKind::EffectFailed,
            ProcessingOutcome::EffectTimedOut { .. } => OutcomeKind::EffectTimedOut,
        }
    }

    /// The delivery can be acknowledged without further action
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            ProcessingOutcome::Processed
                | ProcessingOutcome::DuplicateIgnored
                | ProcessingOutcome::Quarantined { .. }
        )
    }

    /// The effect failed or timed out
    pub fn is_effect_failure(&self) -> bool {
        matches!(
            self,
            ProcessingOutcome::EffectFailed { .. } | ProcessingOutcome::EffectTimedOut { .. }
        )
    }
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingOutcome::Processed => write!(f, "processed"),
            ProcessingOutcome::DuplicateIgnored => write!(f, "duplicate_ignored"),
            ProcessingOutcome::Quarantined { reason } => write!(f, "quarantined ({})", reason),
            ProcessingOutcome::EffectFailed { error } => write!(f, "effect_failed ({})", error),
            ProcessingOutcome::EffectTimedOut { budget } => {
                write!(f, "effect_timed_out (after {:?})", budget)
            }
        }
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
