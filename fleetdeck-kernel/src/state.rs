use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

/// Last control failure per service or environment id.
/// Written by the dispatcher, read by the aggregator on every tick.
#[derive(Clone, Default)]
pub struct LastErrors {
    inner: Shared<HashMap<String, String>>,
}

impl LastErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: &str, message: impl Into<String>) {
        self.inner.lock().insert(id.to_string(), message.into());
    }

    /// Returns true when an error was actually cleared.
    pub fn clear(&self, id: &str) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.inner.lock().get(id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.inner.lock().clone()
    }
}
