//! In-memory mock notifier for testing.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{BusError, ChangeNotifier, Result};

/// Records every published id instead of talking to a broker.
///
/// Can be flipped to fail so callers' fire-and-forget handling is testable.
#[derive(Debug, Default)]
pub struct MockChangeNotifier {
    published: Mutex<Vec<(String, i64)>>,
    fail: Mutex<bool>,
}

impl MockChangeNotifier {
    /// Create a mock that accepts all publishes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail.
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }

    /// All (routing_key, record_id) pairs published so far.
    pub fn published(&self) -> Vec<(String, i64)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ChangeNotifier for MockChangeNotifier {
    async fn publish(&self, routing_key: &str, record_id: i64) -> Result<()> {
        if *self.fail.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(BusError::Publish("mock notifier set to fail".to_string()));
        }
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((routing_key.to_string(), record_id));
        Ok(())
    }
}
