//! The unit of work carried by every queue.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const FAILED_TRIES: &str = "failed_tries";

/// An opaque JSON object produced by a publisher.
///
/// The only field the framework itself interprets is `failed_tries`, which the
/// retry path bumps before re-publishing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItem(Map<String, Value>);

impl QueueItem {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Converts any serializable object into an item. Non-object values are rejected.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(serde::de::Error::custom(format!(
                "queue items must be JSON objects, got {}",
                other
            ))),
        }
    }

    /// Wraps a body that is not a JSON object as `{"raw": <lossy utf-8>}`.
    pub fn from_raw(body: &[u8]) -> Self {
        let mut map = Map::new();
        map.insert("raw".to_string(), Value::from(String::from_utf8_lossy(body).into_owned()));
        Self(map)
    }

    /// Decodes the item into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.0.clone()))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn failed_tries(&self) -> u32 {
        self.0
            .get(FAILED_TRIES)
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    /// Bumps `failed_tries` in place and returns the new count.
    pub fn increment_failed_tries(&mut self) -> u32 {
        let next = self.failed_tries().saturating_add(1);
        self.0.insert(FAILED_TRIES.to_string(), Value::from(next));
        next
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for QueueItem {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for QueueItem {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_serialize(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failed_tries_defaults_to_zero_and_increments() {
        let mut item = QueueItem::try_from(json!({"type": "good"})).unwrap();
        assert_eq!(item.failed_tries(), 0);

        assert_eq!(item.increment_failed_tries(), 1);
        assert_eq!(item.increment_failed_tries(), 2);
        assert_eq!(item.get("failed_tries"), Some(&json!(2)));
    }

    #[test]
    fn test_non_object_values_are_rejected() {
        assert!(QueueItem::try_from(json!(["not", "an", "object"])).is_err());
        assert!(QueueItem::try_from(json!("text")).is_err());
    }

    #[test]
    fn test_raw_bodies_are_kept_verbatim() {
        let item = QueueItem::from_raw(b"not json {");
        assert_eq!(item.into_value(), json!({"raw": "not json {"}));

        let item = QueueItem::from_raw(&[b'o', b'k', 0xff]);
        assert_eq!(item.get("raw"), Some(&json!("ok\u{fffd}")));
    }

    #[test]
    fn test_decode_typed_event() {
        #[derive(Deserialize)]
        struct Event {
            user_profile_id: u64,
        }

        let item = QueueItem::try_from(json!({"user_profile_id": 7, "extra": true})).unwrap();
        let event: Event = item.decode().unwrap();
        assert_eq!(event.user_profile_id, 7);
    }
}
