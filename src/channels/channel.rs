//! Channel trait and message types.
//!
//! The orchestration core is transport-agnostic: a channel is anything with
//! a name that can deliver text (and optionally images) and hand back
//! incoming messages in the unified shape below. Concrete connectors
//! (Matrix, Discord, HTTP, ...) live outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::llm::ImageData;

/// A message received from an external channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Unique message ID.
    pub id: Uuid,
    /// Channel this message came from.
    pub channel: String,
    /// Message content.
    pub content: String,
    /// Attached images, if the transport supports them.
    pub images: Vec<ImageData>,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    /// Create a new incoming message.
    pub fn new(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            content: content.into(),
            images: Vec::new(),
            received_at: Utc::now(),
        }
    }

    /// Attach images.
    pub fn with_images(mut self, images: Vec<ImageData>) -> Self {
        self.images = images;
        self
    }
}

/// Response to send back to a channel.
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    /// The content to send.
    pub content: String,
    /// Optional image payload.
    pub image: Option<ImageData>,
}

impl OutgoingResponse {
    /// Create a simple text response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            image: None,
        }
    }

    /// Attach an image.
    pub fn with_image(mut self, image: ImageData) -> Self {
        self.image = Some(image);
        self
    }
}

/// Trait for message channels.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name (e.g., "matrix", "discord", "cli").
    fn name(&self) -> &str;

    /// Reply in the context of an incoming message.
    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError>;

    /// Proactively deliver a message without a prior incoming message.
    ///
    /// Used for scheduled-job results and failure reports.
    async fn deliver(&self, response: OutgoingResponse) -> Result<(), ChannelError>;

    /// Check if the channel is healthy.
    async fn health_check(&self) -> Result<(), ChannelError>;
}
