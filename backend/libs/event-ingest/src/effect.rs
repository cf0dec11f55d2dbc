//! Business effect invocation
//!
//! The effect is the only place external business logic runs. It is called
//! at most once per distinct identity per ledger epoch, under an execution
//! budget. Errors, timeouts and panics are all converted to [`EffectError`].

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::IngestError;
use crate::event::Event;

/// Downstream business effect
#[async_trait]
pub trait Effect: Send + Sync {
    async fn apply(&self, event: &Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<E: Effect + ?Sized> Effect for Arc<E> {
    async fn apply(&self, event: &Event) -> anyhow::Result<()> {
        (**self).apply(event).await
    }
}

/// Adapts an async closure taking an owned [`Event`]
///
/// ```ignore
/// let effect = FnEffect::new(|event: Event| async move {
///     send_notification(event.payload()).await?;
///     Ok(())
/// });
/// ```
pub struct FnEffect<F>(F);

impl<F, Fut> FnEffect<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Effect for FnEffect<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn apply(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Effect that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEffect;

#[async_trait]
impl Effect for NoopEffect {
    async fn apply(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What happens to an identity whose effect failed or timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectFailurePolicy {
    /// Identity stays seen; redeliveries are ignored as duplicates
    #[default]
    KeepSeen,
    /// Identity is removed from the ledger; the next redelivery runs the effect again
    UnmarkForRetry,
}

impl FromStr for EffectFailurePolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keep-seen" | "keep" => Ok(EffectFailurePolicy::KeepSeen),
            "unmark-for-retry" | "retry" => Ok(EffectFailurePolicy::UnmarkForRetry),
            other => Err(IngestError::Config(format!(
                "Unknown effect failure policy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    #[error("Effect timed out after {0:?}")]
    Elapsed(Duration),
    #[error("Effect failed: {0}")]
    Failed(String),
    #[error("Effect panicked: {0}")]
    Panicked(String),
}

/// Run `effect` for `event` within `budget`
pub async fn run_with_budget(
    effect: &dyn Effect,
    event: &Event,
    budget: Duration,
) -> Result<(), EffectError> {
    let guarded = AssertUnwindSafe(effect.apply(event)).catch_unwind();

    match timeout(budget, guarded).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(EffectError::Failed(format!("{:#}", e))),
        Ok(Err(panic)) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(EffectError::Panicked(message))
        }
        Err(_) => Err(EffectError::Elapsed(budget)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_effect_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let effect = FnEffect::new(move |_event: Event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let result = run_with_budget(&effect, &Event::new("e1"), Duration::from_secs(1)).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_effect_failure() {
        let effect = FnEffect::new(|_event: Event| async { Err(anyhow::anyhow!("downstream rejected")) });

        let result = run_with_budget(&effect, &Event::new("e1"), Duration::from_secs(1)).await;
        match result {
            Err(EffectError::Failed(message)) => assert!(message.contains("downstream rejected")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_effect_timeout() {
        let effect = FnEffect::new(|_event: Event| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        });

        let result = run_with_budget(&effect, &Event::new("e1"), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(EffectError::Elapsed(_))));
    }

    #[tokio::test]
    async fn test_effect_panic_is_caught() {
        let effect = FnEffect::new(|event: Event| async move {
            if event.payload().as_str() == Some("e1") {
                panic!("effect exploded");
            }
            Ok(())
        });

        let result = run_with_budget(&effect, &Event::new("e1"), Duration::from_secs(1)).await;
        match result {
            Err(EffectError::Panicked(message)) => assert!(message.contains("effect exploded")),
            other => panic!("expected panic, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_noop_effect() {
        assert!(run_with_budget(&NoopEffect, &Event::new("x"), Duration::from_millis(10))
            .await
            .is_ok());
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!(
            "keep-seen".parse::<EffectFailurePolicy>().unwrap(),
            EffectFailurePolicy::KeepSeen
        );
        assert_eq!(
            "unmark-for-retry".parse::<EffectFailurePolicy>().unwrap(),
            EffectFailurePolicy::UnmarkForRetry
        );
        assert!("drop".parse::<EffectFailurePolicy>().is_err());
    }
}
