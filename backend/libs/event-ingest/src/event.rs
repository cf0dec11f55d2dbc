//! Event model: payloads, identities and partition keys
//!
//! An [`Event`] is an opaque payload plus whatever routing metadata the
//! external log carried with it. Its [`Identity`] is derived by an
//! [`IdentityPolicy`]; derivation is pure, so the same payload (and key)
//! always yields the same identity.

use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{IngestError, IngestResult};

/// Name of the implicit partition used when the caller has no routing key
pub const GLOBAL_PARTITION: &str = "global";

/// Opaque event payload
///
/// Bytes are kept as delivered. Serialization renders them as (lossy) UTF-8
/// text, which is what the administrative snapshots expose.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Payload as text, replacing invalid sequences
    pub fn to_text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({:?})", self.to_text_lossy())
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text_lossy())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_text_lossy())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

/// Deterministic key used to recognize duplicate events
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unit of ordering and of state ownership
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The single implicit partition (global order)
    pub fn global() -> Self {
        Self(GLOBAL_PARTITION.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_PARTITION
    }
}

impl Default for PartitionKey {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A single delivered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    payload: Payload,
    /// Explicit idempotency key, when the external format carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    /// 1-based delivery attempt reported by the external log
    delivery_attempt: u32,
}

impl Event {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            key: None,
            delivery_attempt: 1,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_delivery_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = attempt;
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }
}

impl From<&str> for Event {
    fn from(payload: &str) -> Self {
        Event::new(payload)
    }
}

impl From<String> for Event {
    fn from(payload: String) -> Self {
        Event::new(payload)
    }
}

/// Inbound tuple from the external log: `(partition, payload, attempt)`
#[derive(Debug, Clone)]
pub struct Delivery {
    pub partition: PartitionKey,
    pub event: Event,
}

impl Delivery {
    pub fn new(partition: impl Into<PartitionKey>, event: impl Into<Event>) -> Self {
        Self {
            partition: partition.into(),
            event: event.into(),
        }
    }

    /// Delivery on the implicit global partition
    pub fn global(event: impl Into<Event>) -> Self {
        Self::new(PartitionKey::global(), event)
    }
}

/// Content identities of binary payloads, and of text that already starts
/// with this prefix, are hex-encoded under it so the two can never collide
const HEX_IDENTITY_PREFIX: &str = "hex:";

/// How an event's identity is derived
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityPolicy {
    /// Payload content equality
    #[default]
    Content,
    /// SHA-256 of the payload bytes
    ContentDigest,
    /// Key carried alongside the payload (e.g. a broker header)
    ExplicitKey,
    /// Named top-level field of a JSON object payload
    JsonField(String),
}

impl IdentityPolicy {
    /// Derive the identity of `event`
    ///
    /// Fails with `InvalidEvent` / `IdentityUnavailable` when the event is
    /// structurally unfit for this policy; callers quarantine such events.
    pub fn derive(&self, event: &Event) -> IngestResult<Identity> {
        let payload = event.payload();

        match self {
            IdentityPolicy::Content => Ok(match payload.as_str() {
                Some(text) if !text.starts_with(HEX_IDENTITY_PREFIX) => Identity::new(text),
                _ => Identity::new(format!(
                    "{}{}",
                    HEX_IDENTITY_PREFIX,
                    hex::encode(payload.as_bytes())
                )),
            }),
            IdentityPolicy::ContentDigest => {
                let digest = Sha256::digest(payload.as_bytes());
                Ok(Identity::new(format!("sha256:{}", hex::encode(digest))))
            }
            IdentityPolicy::ExplicitKey => match event.key() {
                Some(key) if !key.trim().is_empty() => Ok(Identity::new(key)),
                Some(_) => Err(IngestError::IdentityUnavailable(
                    "explicit key is empty".to_string(),
                )),
                None => Err(IngestError::IdentityUnavailable(
                    "event carries no explicit key".to_string(),
                )),
            },
            IdentityPolicy::JsonField(field) => {
                if payload.is_empty() {
                    return Err(IngestError::InvalidEvent("payload is empty".to_string()));
                }

                let value: serde_json::Value = serde_json::from_slice(payload.as_bytes())
                    .map_err(|e| IngestError::InvalidEvent(format!("payload is not JSON: {}", e)))?;

                let object = value.as_object().ok_or_else(|| {
                    IngestError::InvalidEvent("payload is not a JSON object".to_string())
                })?;

                match object.get(field) {
                    Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(Identity::new(s.as_str())),
                    Some(serde_json::Value::Number(n)) => Ok(Identity::new(n.to_string())),
                    Some(_) => Err(IngestError::IdentityUnavailable(format!(
                        "field '{}' is not a non-empty string or number",
                        field
                    ))),
                    None => Err(IngestError::IdentityUnavailable(format!(
                        "field '{}' is missing",
                        field
                    ))),
                }
            }
        }
    }
}

impl FromStr for IdentityPolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "content" => return Ok(IdentityPolicy::Content),
            "content-digest" | "digest" | "sha256" => return Ok(IdentityPolicy::ContentDigest),
            "explicit-key" | "key" => return Ok(IdentityPolicy::ExplicitKey),
            _ => {}
        }

        match s.split_once(':') {
            Some((prefix, field)) if prefix.eq_ignore_ascii_case("json-field") && !field.is_empty() => {
                Ok(IdentityPolicy::JsonField(field.to_string()))
            }
            _ => Err(IngestError::Config(format!("Unknown identity policy: {}", s))),
        }
    }
}
