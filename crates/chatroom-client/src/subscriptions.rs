//! Source path to publish callback, at most one per path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// Called with each payload published by a source.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callbacks keyed by source path.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: Mutex<HashMap<String, Callback>>,
}

impl SubscriptionTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `callback` for `source`, replacing any earlier one.
    pub fn insert(&self, source: impl Into<String>, callback: Callback) -> bool {
        self.entries.lock().insert(source.into(), callback).is_some()
    }

    /// Drop the callback for `source`.
    pub fn remove(&self, source: &str) -> bool {
        self.entries.lock().remove(source).is_some()
    }

    /// Whether `source` has a callback.
    pub fn contains(&self, source: &str) -> bool {
        self.entries.lock().contains_key(source)
    }

    /// Sorted source paths.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.entries.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Invoke the callback for `source`. Returns `false` if there is none.
    /// The callback runs outside the table's lock.
    pub fn dispatch(&self, source: &str, payload: &Value) -> bool {
        let callback = self.entries.lock().get(source).cloned();
        match callback {
            Some(callback) => {
                callback(payload);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_to_registered_source_only() {
        let table = SubscriptionTable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _ = table.insert("svc.a", Arc::new(move |v: &Value| sink.lock().push(v.clone())));

        assert!(table.dispatch("svc.a", &json!({"n": 1})));
        assert!(!table.dispatch("svc.b", &json!({"n": 2})));
        assert_eq!(*seen.lock(), vec![json!({"n": 1})]);
    }

    #[test]
    fn later_subscribe_overwrites() {
        let table = SubscriptionTable::new();
        let hits = Arc::new(Mutex::new((0, 0)));
        let first = Arc::clone(&hits);
        let second = Arc::clone(&hits);
        assert!(!table.insert("p", Arc::new(move |_: &Value| first.lock().0 += 1)));
        assert!(table.insert("p", Arc::new(move |_: &Value| second.lock().1 += 1)));
        let _ = table.dispatch("p", &Value::Null);
        assert_eq!(*hits.lock(), (0, 1));
    }

    #[test]
    fn callback_may_touch_the_table() {
        let table = Arc::new(SubscriptionTable::new());
        let inner = Arc::clone(&table);
        let _ = table.insert("p", Arc::new(move |_: &Value| {
            let _ = inner.remove("p");
        }));
        assert!(table.dispatch("p", &Value::Null));
        assert!(!table.contains("p"));
    }
}
