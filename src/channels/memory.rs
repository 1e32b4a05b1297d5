//! In-memory channel for tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::channels::{Channel, IncomingMessage, OutgoingResponse};
use crate::error::ChannelError;

/// Records everything delivered to it.
pub struct MemoryChannel {
    name: String,
    deliveries: Mutex<Vec<String>>,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deliveries: Mutex::new(Vec::new()),
        }
    }

    /// Message contents delivered so far, in order.
    pub fn deliveries(&self) -> Vec<String> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn respond(
        &self,
        _msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        self.deliveries.lock().unwrap().push(response.content);
        Ok(())
    }

    async fn deliver(&self, response: OutgoingResponse) -> Result<(), ChannelError> {
        self.deliveries.lock().unwrap().push(response.content);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
