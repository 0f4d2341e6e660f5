//! Fingerprint cache for agent results.
//!
//! Results are keyed by a deterministic hash of the requesting user, the
//! agent name and the canonical payload, so an identical request within the
//! TTL is answered without a remote call.

mod memory;

pub use memory::InMemoryCache;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Payload keys that change on every request and never identify a result.
const VOLATILE_KEYS: &[&str] = &["RequestId"];

/// Key/value store for agent results.
///
/// Implementations must tolerate concurrent access from many turns.
#[async_trait]
pub trait FingerprintCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: String, ttl: Duration);

    async fn delete(&self, key: &str);
}

/// Cache used when caching is switched off; every operation is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCache;

#[async_trait]
impl FingerprintCache for DisabledCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) {}

    async fn delete(&self, _key: &str) {}
}

/// Serialize `value` with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut sorted = Map::new();
                for key in keys {
                    sorted.insert(key.clone(), canonicalize(&map[key]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// Deterministic fingerprint of one dispatch.
///
/// Hex SHA-256 of `{user}_{agent}{canonical payload}`; volatile keys such as
/// `RequestId` are left out.
pub fn fingerprint(user_id: &str, agent: &str, payload: &Map<String, Value>) -> String {
    let stable: Map<String, Value> = payload
        .iter()
        .filter(|(k, _)| !VOLATILE_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let material = format!("{}_{}{}", user_id, agent, canonical_json(&Value::Object(stable)));
    hex::encode(Sha256::digest(material.as_bytes()))
}
