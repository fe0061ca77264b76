//! Execution context: the scoped key/value store used for checkpoints and
//! controlled data flow between steps.
//!
//! A context belongs either to a job execution (visible to every step of that
//! run) or to a step execution (visible only to that step). Values are kept
//! in their JSON form so any repository can persist them as-is.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ContextError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    entries: BTreeMap<String, JsonValue>,
    #[serde(skip)]
    dirty: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Store any serializable value under `key`.
    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), ContextError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|source| ContextError::Conversion {
            key: key.clone(),
            source,
        })?;
        self.put_value(key, value);
        Ok(())
    }

    pub fn put_value(&mut self, key: impl Into<String>, value: JsonValue) {
        let key = key.into();
        if self.entries.get(&key) != Some(&value) {
            self.entries.insert(key, value);
            self.dirty = true;
        }
    }

    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.put_value(key, JsonValue::String(value.into()));
    }

    pub fn put_long(&mut self, key: impl Into<String>, value: i64) {
        self.put_value(key, JsonValue::from(value));
    }

    pub fn put_double(&mut self, key: impl Into<String>, value: f64) {
        self.put_value(key, JsonValue::from(value));
    }

    pub fn get_value(&self, key: &str) -> Option<&JsonValue> {
        self.entries.get(key)
    }

    /// Decode the value under `key`. `Ok(None)` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ContextError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|source| ContextError::Conversion {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(JsonValue::as_str)
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(JsonValue::as_i64)
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        self.entries.get(key).and_then(JsonValue::as_f64)
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether the context changed since the last [`clear_dirty`](Self::clear_dirty).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Copy the listed keys from `source`; keys absent in `source` are skipped.
    /// Returns the keys actually copied.
    pub fn copy_keys_from<'k>(
        &mut self,
        source: &ExecutionContext,
        keys: impl IntoIterator<Item = &'k str>,
    ) -> Vec<String> {
        let mut copied = Vec::new();
        for key in keys {
            if let Some(value) = source.get_value(key) {
                self.put_value(key, value.clone());
                copied.push(key.to_string());
            }
        }
        copied
    }
}

// Equality ignores the dirty flag.
impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_round_trip() {
        let mut ctx = ExecutionContext::new();
        ctx.put_string("name", "alpha");
        ctx.put_long("count", 3);
        ctx.put("tags", vec!["a", "b"]).unwrap();

        assert_eq!(ctx.get_string("name"), Some("alpha"));
        assert_eq!(ctx.get_long("count"), Some(3));
        assert_eq!(ctx.get::<Vec<String>>("tags").unwrap(), Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(ctx.get::<i64>("missing").unwrap(), None);
    }

    #[test]
    fn get_reports_conversion_failures() {
        let mut ctx = ExecutionContext::new();
        ctx.put_string("count", "three");
        assert!(matches!(ctx.get::<i64>("count"), Err(ContextError::Conversion { .. })));
    }

    #[test]
    fn dirty_tracks_real_changes_only() {
        let mut ctx = ExecutionContext::new();
        assert!(!ctx.is_dirty());
        ctx.put_long("a", 1);
        assert!(ctx.is_dirty());
        ctx.clear_dirty();
        ctx.put_long("a", 1);
        assert!(!ctx.is_dirty());
        ctx.remove("a");
        assert!(ctx.is_dirty());
    }

    #[test]
    fn copy_keys_only_moves_listed_keys() {
        let mut step = ExecutionContext::new();
        step.put_string("result", "aaaa");
        step.put_long("reader.position", 10);

        let mut job = ExecutionContext::new();
        let copied = job.copy_keys_from(&step, ["result", "absent"]);

        assert_eq!(copied, vec!["result".to_string()]);
        assert_eq!(job.get_string("result"), Some("aaaa"));
        assert!(!job.contains_key("reader.position"));
    }

    #[test]
    fn serializes_entries_only() {
        let mut ctx = ExecutionContext::new();
        ctx.put_long("a", 1);
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json, json!({"entries": {"a": 1}}));

        let back: ExecutionContext = serde_json::from_value(json).unwrap();
        assert_eq!(back.get_long("a"), Some(1));
        assert!(!back.is_dirty());
    }
}
