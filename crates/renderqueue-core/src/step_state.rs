//! Typed accessors over a job's step-state checkpoint bag.
//!
//! The bag itself is kept opaque to the core (a `serde_json::Value` object):
//! handlers checkpoint typed values through `get`/`set`/`delete` without the
//! core ever interpreting the contents.

use serde::{de::DeserializeOwned, Serialize};

/// A mapping-to-opaque-value checkpoint, backed by a JSON object.
///
/// `JobStore` implementations persist the whole bag as one JSONB column and
/// hand a fresh `StepState` wrapper to handlers on each invocation; writes
/// made through [`StepState::set`] are staged in memory and must be flushed
/// back through the store by the executor (see
/// `renderqueue-postgres::executor`).
#[derive(Debug, Clone, Default)]
pub struct StepState {
    bag: serde_json::Map<String, serde_json::Value>,
}

impl StepState {
    pub fn from_value(value: serde_json::Value) -> Self {
        let bag = match value {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self { bag }
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.bag)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.bag
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        if let Ok(json) = serde_json::to_value(value) {
            self.bag.insert(key.into(), json);
        }
    }

    pub fn delete(&mut self, key: &str) {
        self.bag.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.bag.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        let mut state = StepState::default();
        state.set("frames_rendered", 42u32);
        assert_eq!(state.get::<u32>("frames_rendered"), Some(42));
    }

    #[test]
    fn get_missing_key_is_none() {
        let state = StepState::default();
        assert_eq!(state.get::<u32>("nope"), None);
    }

    #[test]
    fn delete_removes_key() {
        let mut state = StepState::default();
        state.set("sentinel", true);
        assert!(state.contains("sentinel"));
        state.delete("sentinel");
        assert!(!state.contains("sentinel"));
    }

    #[test]
    fn from_value_ignores_non_object_json() {
        let state = StepState::from_value(serde_json::json!([1, 2, 3]));
        assert!(!state.contains("anything"));
        assert_eq!(state.into_value(), serde_json::json!({}));
    }

    #[test]
    fn roundtrips_through_value() {
        let mut state = StepState::default();
        state.set("checkpoint", "uploaded");
        let value = state.into_value();
        let restored = StepState::from_value(value);
        assert_eq!(restored.get::<String>("checkpoint"), Some("uploaded".to_string()));
    }
}
