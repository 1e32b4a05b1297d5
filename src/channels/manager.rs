//! Channel manager: routes outgoing messages to named channels.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::channels::{Channel, IncomingMessage, OutgoingResponse};
use crate::error::ChannelError;

/// Holds the registered channels and routes by name.
///
/// Channels are stored behind `Arc` so sends never hold the map lock across
/// an await.
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a channel under its own name.
    pub fn add(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        self.channels
            .write()
            .expect("channel lock poisoned")
            .insert(name.clone(), channel);
        tracing::debug!(channel = %name, "channel registered");
    }

    fn get(&self, name: &str) -> Result<Arc<dyn Channel>, ChannelError> {
        self.channels
            .read()
            .expect("channel lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| ChannelError::NotFound {
                name: name.to_string(),
            })
    }

    /// Reply in the context of an incoming message.
    pub async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        let channel = self.get(&msg.channel)?;
        channel.respond(msg, response).await
    }

    /// Proactively deliver to a channel by name.
    pub async fn deliver(
        &self,
        channel: &str,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        let channel = self.get(channel)?;
        channel.deliver(response).await
    }

    /// Names of all registered channels.
    pub fn names(&self) -> Vec<String> {
        self.channels
            .read()
            .expect("channel lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}
