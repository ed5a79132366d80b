//! Mutable per-stub state exposed to response injections as `state`.

use parking_lot::Mutex;
use rhai::{Dynamic, ImmutableString, Map};
use std::sync::Arc;

/// Key/value store shared by reference between every invocation of one stub.
///
/// Cloning yields another handle to the same map.
#[derive(Clone, Default)]
pub struct CallState {
    values: Arc<Mutex<Map>>,
}

impl CallState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: ImmutableString) -> Dynamic {
        self.values
            .lock()
            .get(key.as_str())
            .cloned()
            .unwrap_or(Dynamic::UNIT)
    }

    pub fn set(&mut self, key: ImmutableString, value: Dynamic) {
        self.values.lock().insert(key.as_str().into(), value);
    }

    pub fn contains(&mut self, key: ImmutableString) -> bool {
        self.values.lock().contains_key(key.as_str())
    }

    /// Add one to an integer counter, starting from zero. Returns the new value.
    pub fn increment(&mut self, key: ImmutableString) -> i64 {
        let mut values = self.values.lock();
        let next = values
            .get(key.as_str())
            .and_then(|v| v.as_int().ok())
            .unwrap_or(0)
            + 1;
        values.insert(key.as_str().into(), Dynamic::from(next));
        next
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    /// Snapshot as JSON, for logging and inspection.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self.values.lock().clone();
        super::rhai_engine::dynamic_to_json(Dynamic::from(map))
    }

    pub(super) fn register(engine: &mut rhai::Engine) {
        engine
            .register_type_with_name::<CallState>("CallState")
            .register_fn("get", CallState::get)
            .register_fn("set", CallState::set)
            .register_fn("contains", CallState::contains)
            .register_fn("increment", CallState::increment)
            .register_indexer_get(CallState::get)
            .register_indexer_set(CallState::set);
    }
}

impl std::fmt::Debug for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallState")
            .field("keys", &self.values.lock().len())
            .finish()
    }
}
