//! Ingestion configuration
//!
//! Loaded from `INGEST_*` environment variables (a `.env` file is honoured
//! for local development). Every field has a default, so
//! `IngestConfig::default()` is a valid configuration.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `INGEST_SERVICE_NAME` | `event-ingest` |
//! | `INGEST_IDENTITY_POLICY` | `content` |
//! | `INGEST_DEDUP_SCOPE` | `partition` |
//! | `INGEST_DEDUP_TTL_SECS` | `604800` (7 days, `0` disables expiry) |
//! | `INGEST_DEDUP_CAPACITY` | `1000000` (`0` disables the bound) |
//! | `INGEST_EFFECT_TIMEOUT_MS` | `30000` |
//! | `INGEST_EFFECT_FAILURE_POLICY` | `keep-seen` |
//! | `INGEST_POISON_SENTINEL` | `poison-pill` (empty disables) |
//! | `INGEST_MAX_PAYLOAD_BYTES` | unset |
//! | `INGEST_REQUIRE_UTF8` | `false` |
//! | `INGEST_BLOCKLIST` | empty (comma separated) |
//! | `INGEST_INTAKE_LOG_RETENTION` | unset (unbounded) |
//! | `INGEST_QUARANTINE_RETENTION` | unset (unbounded) |
//! | `INGEST_DISPATCHER_QUEUE_CAPACITY` | `1024` |
//! | `INGEST_CLEANUP_INTERVAL_SECS` | `300` |

use std::env;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

use crate::classifier::DEFAULT_POISON_SENTINEL;
use crate::effect::EffectFailurePolicy;
use crate::error::{IngestError, IngestResult};
use crate::event::IdentityPolicy;
use crate::ledger::{DedupScope, LedgerConfig};

const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(7 * 86400);
const DEFAULT_DEDUP_CAPACITY: usize = 1_000_000;
const DEFAULT_EFFECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Configuration for an [`EventProcessor`](crate::EventProcessor) and its dispatcher
#[derive(Debug, Clone, Validate)]
pub struct IngestConfig {
    /// Service name, used as the metrics label
    #[validate(length(min = 1, max = 255))]
    pub service_name: String,

    /// How event identities are derived
    pub identity_policy: IdentityPolicy,

    /// Whether each partition owns its ledger or one ledger is shared
    pub dedup_scope: DedupScope,

    /// Retention window for seen identities (`None` = never expire)
    pub dedup_ttl: Option<Duration>,

    /// Soft bound on ledger entries (`None` = unbounded)
    #[validate(range(min = 1))]
    pub dedup_capacity: Option<usize>,

    /// Execution budget for the business effect
    pub effect_timeout: Duration,

    /// What happens to an identity whose effect failed or timed out
    pub effect_failure_policy: EffectFailurePolicy,

    /// Payload that is always quarantined (`None` disables the rule)
    pub poison_sentinel: Option<String>,

    /// Quarantine payloads larger than this
    #[validate(range(min = 1))]
    pub max_payload_bytes: Option<usize>,

    /// Quarantine payloads that are not valid UTF-8
    pub require_utf8: bool,

    /// Payloads that are always quarantined
    pub blocklist: Vec<String>,

    /// Max intake log entries kept per partition
    #[validate(range(min = 1))]
    pub intake_log_retention: Option<usize>,

    /// Max quarantine entries kept per partition
    #[validate(range(min = 1))]
    pub quarantine_retention: Option<usize>,

    /// Bounded queue depth per partition worker
    #[validate(range(min = 1, max = 1_048_576))]
    pub dispatcher_queue_capacity: usize,

    /// Period of the background ledger sweep
    pub cleanup_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            service_name: "event-ingest".to_string(),
            identity_policy: IdentityPolicy::Content,
            dedup_scope: DedupScope::Partition,
            dedup_ttl: Some(DEFAULT_DEDUP_TTL),
            dedup_capacity: Some(DEFAULT_DEDUP_CAPACITY),
            effect_timeout: DEFAULT_EFFECT_TIMEOUT,
            effect_failure_policy: EffectFailurePolicy::KeepSeen,
            poison_sentinel: Some(DEFAULT_POISON_SENTINEL.to_string()),
            max_payload_bytes: None,
            require_utf8: false,
            blocklist: Vec::new(),
            intake_log_retention: None,
            quarantine_retention: None,
            dispatcher_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> IngestResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> IngestResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string());

        let config = Self {
            service_name: var("INGEST_SERVICE_NAME").unwrap_or(defaults.service_name),
            identity_policy: match var("INGEST_IDENTITY_POLICY") {
                Some(v) => v.parse()?,
                None => defaults.identity_policy,
            },
            dedup_scope: match var("INGEST_DEDUP_SCOPE") {
                Some(v) => v.parse()?,
                None => defaults.dedup_scope,
            },
            dedup_ttl: match var("INGEST_DEDUP_TTL_SECS") {
                Some(v) => match parse_number::<u64>("INGEST_DEDUP_TTL_SECS", &v)? {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                None => defaults.dedup_ttl,
            },
            dedup_capacity: match var("INGEST_DEDUP_CAPACITY") {
                Some(v) => match parse_number::<usize>("INGEST_DEDUP_CAPACITY", &v)? {
                    0 => None,
                    n => Some(n),
                },
                None => defaults.dedup_capacity,
            },
            effect_timeout: match var("INGEST_EFFECT_TIMEOUT_MS") {
                Some(v) => Duration::from_millis(parse_number("INGEST_EFFECT_TIMEOUT_MS", &v)?),
                None => defaults.effect_timeout,
            },
            effect_failure_policy: match var("INGEST_EFFECT_FAILURE_POLICY") {
                Some(v) => v.parse()?,
                None => defaults.effect_failure_policy,
            },
            poison_sentinel: match var("INGEST_POISON_SENTINEL") {
                Some(v) if v.is_empty() => None,
                Some(v) => Some(v),
                None => defaults.poison_sentinel,
            },
            max_payload_bytes: var("INGEST_MAX_PAYLOAD_BYTES")
                .map(|v| parse_number("INGEST_MAX_PAYLOAD_BYTES", &v))
                .transpose()?,
            require_utf8: match var("INGEST_REQUIRE_UTF8") {
                Some(v) => parse_bool("INGEST_REQUIRE_UTF8", &v)?,
                None => defaults.require_utf8,
            },
            blocklist: var("INGEST_BLOCKLIST")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            intake_log_retention: var("INGEST_INTAKE_LOG_RETENTION")
                .map(|v| parse_number("INGEST_INTAKE_LOG_RETENTION", &v))
                .transpose()?,
            quarantine_retention: var("INGEST_QUARANTINE_RETENTION")
                .map(|v| parse_number("INGEST_QUARANTINE_RETENTION", &v))
                .transpose()?,
            dispatcher_queue_capacity: match var("INGEST_DISPATCHER_QUEUE_CAPACITY") {
                Some(v) => parse_number("INGEST_DISPATCHER_QUEUE_CAPACITY", &v)?,
                None => defaults.dispatcher_queue_capacity,
            },
            cleanup_interval: match var("INGEST_CLEANUP_INTERVAL_SECS") {
                Some(v) => {
                    Duration::from_secs(parse_number("INGEST_CLEANUP_INTERVAL_SECS", &v)?)
                }
                None => defaults.cleanup_interval,
            },
        };

        config.check()?;
        Ok(config)
    }

    /// Validate field ranges and cross-field constraints
    pub fn check(&self) -> IngestResult<()> {
        Validate::validate(self)
            .map_err(|e| IngestError::Config(format!("Configuration validation failed: {}", e)))?;

        if self.effect_timeout.is_zero() {
            return Err(IngestError::Config(
                "effect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(IngestError::Config(
                "cleanup_interval must be greater than zero".to_string(),
            ));
        }
        if matches!(self.dedup_ttl, Some(ttl) if ttl.is_zero()) {
            return Err(IngestError::Config(
                "dedup_ttl must be greater than zero when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Ledger settings derived from this configuration
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            ttl: self.dedup_ttl,
            capacity: self.dedup_capacity,
        }
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> IngestResult<T> {
    value
        .parse()
        .map_err(|_| IngestError::Config(format!("{} must be a non-negative integer, got '{}'", name, value)))
}

fn parse_bool(name: &str, value: &str) -> IngestResult<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(IngestError::Config(format!("{} must be a boolean, got '{}'", name, value))),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = IngestConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.identity_policy, IdentityPolicy::Content);
        assert_eq!(config.poison_sentinel.as_deref(), Some("poison-pill"));
    }

    #[test]
    fn test_from_lookup_with_no_vars_uses_defaults() {
        let config = IngestConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.dedup_scope, DedupScope::Partition);
        assert_eq!(config.dedup_ttl, Some(DEFAULT_DEDUP_TTL));
        assert_eq!(config.dispatcher_queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = IngestConfig::from_lookup(lookup(&[
            ("INGEST_IDENTITY_POLICY", "json-field:event_id"),
            ("INGEST_DEDUP_SCOPE", "global"),
            ("INGEST_DEDUP_TTL_SECS", "0"),
            ("INGEST_DEDUP_CAPACITY", "500"),
            ("INGEST_EFFECT_TIMEOUT_MS", "250"),
            ("INGEST_EFFECT_FAILURE_POLICY", "unmark-for-retry"),
            ("INGEST_POISON_SENTINEL", ""),
            ("INGEST_REQUIRE_UTF8", "yes"),
            ("INGEST_BLOCKLIST", "a, b,,c"),
            ("INGEST_INTAKE_LOG_RETENTION", "100"),
        ]))
        .unwrap();

        assert_eq!(
            config.identity_policy,
            IdentityPolicy::JsonField("event_id".to_string())
        );
        assert_eq!(config.dedup_scope, DedupScope::Global);
        assert_eq!(config.dedup_ttl, None);
        assert_eq!(config.dedup_capacity, Some(500));
        assert_eq!(config.effect_timeout, Duration::from_millis(250));
        assert_eq!(config.effect_failure_policy, EffectFailurePolicy::UnmarkForRetry);
        assert_eq!(config.poison_sentinel, None);
        assert!(config.require_utf8);
        assert_eq!(config.blocklist, vec!["a", "b", "c"]);
        assert_eq!(config.intake_log_retention, Some(100));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = IngestConfig::from_lookup(lookup(&[("INGEST_DEDUP_CAPACITY", "lots")]));
        assert!(matches!(err, Err(IngestError::Config(_))));

        let err = IngestConfig::from_lookup(lookup(&[("INGEST_EFFECT_TIMEOUT_MS", "0")]));
        assert!(matches!(err, Err(IngestError::Config(_))));

        let err = IngestConfig::from_lookup(lookup(&[("INGEST_DISPATCHER_QUEUE_CAPACITY", "0")]));
        assert!(matches!(err, Err(IngestError::Config(_))));

        let err = IngestConfig::from_lookup(lookup(&[("INGEST_DEDUP_SCOPE", "cluster")]));
        assert!(matches!(err, Err(IngestError::Config(_))));

        let err = IngestConfig::from_lookup(lookup(&[("INGEST_REQUIRE_UTF8", "maybe")]));
        assert!(matches!(err, Err(IngestError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        env::set_var("INGEST_SERVICE_NAME", "orders-ingest");
        env::set_var("INGEST_MAX_PAYLOAD_BYTES", "2048");

        let config = IngestConfig::from_env().unwrap();
        assert_eq!(config.service_name, "orders-ingest");
        assert_eq!(config.max_payload_bytes, Some(2048));

        env::remove_var("INGEST_SERVICE_NAME");
        env::remove_var("INGEST_MAX_PAYLOAD_BYTES");
    }
}
