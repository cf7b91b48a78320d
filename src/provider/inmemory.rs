use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Envelope, provider::Provider};

/// In-memory provider for testing or local pipelines.
///
/// Every handled envelope is appended to a shared queue. Useful for:
/// - Unit and integration testing
/// - Simulating delivery without a real downstream system
/// - Debugging message flows
#[derive(Clone)]
pub struct InMemoryProvider {
    driver_name: String,
    handled: Arc<Mutex<Vec<Envelope>>>,
}

impl InMemoryProvider {
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            handled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Copies of every envelope handled so far, in handling order.
    pub fn handled(&self) -> Vec<Envelope> {
        self.handled.lock().clone()
    }

    /// Return every handled envelope and clear the queue.
    pub fn take_handled(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.handled.lock())
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// "Handle" an envelope by appending it to the in-memory queue.
    #[tracing::instrument(skip_all)]
    async fn handle(&self, envelope: &Envelope) -> Result<(), tower::BoxError> {
        self.handled.lock().push(envelope.clone());
        tracing::info!(
            envelope_id = %envelope.id,
            driver_name = %envelope.driver_name,
            payload_len = envelope.payload.len(),
            "Envelope handled by in-memory provider",
        );
        Ok(())
    }
}
