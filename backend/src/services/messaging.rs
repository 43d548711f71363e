// Message routing - per-channel delivery behind one MessageSender

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{CollaboratorError, CollaboratorResult, DeliveryReceipt, MessageSender, OutboundMessage};
use crate::workflows::steps::MessageChannel;

/// Accepts every message and records it in the log. Used for channels without
/// a configured provider.
#[derive(Debug, Clone, Default)]
pub struct LoggingSender;

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send(&self, message: &OutboundMessage) -> CollaboratorResult<DeliveryReceipt> {
        let provider_message_id = format!("log-{}", Uuid::new_v4());
        info!(
            lead_id = %message.lead_id,
            channel = message.channel.as_str(),
            to = %message.to,
            template_id = ?message.template_id,
            provider_message_id = %provider_message_id,
            "Message delivered to log sink"
        );
        Ok(DeliveryReceipt { provider_message_id })
    }
}

/// Dispatches each message to the sender registered for its channel
#[derive(Clone, Default)]
pub struct ChannelRouter {
    routes: HashMap<MessageChannel, Arc<dyn MessageSender>>,
    fallback: Option<Arc<dyn MessageSender>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, channel: MessageChannel, sender: Arc<dyn MessageSender>) -> Self {
        self.routes.insert(channel, sender);
        self
    }

    pub fn fallback(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.fallback = Some(sender);
        self
    }
}

#[async_trait]
impl MessageSender for ChannelRouter {
    async fn send(&self, message: &OutboundMessage) -> CollaboratorResult<DeliveryReceipt> {
        let sender = self
            .routes
            .get(&message.channel)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                CollaboratorError::rejected(
                    "messaging",
                    format!("no sender configured for {}", message.channel.as_str()),
                )
            })?;
        sender.send(message).await
    }
}
