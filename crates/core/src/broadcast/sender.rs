use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::retry::{with_rate_limit_retry, RetryPolicy};
use super::{ApiError, MessageTransport, OutboundMessage};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("could not open a direct conversation with {recipient_id}")]
    ChannelUnavailable { recipient_id: String },
    #[error(transparent)]
    Api(#[from] ApiError),
}

pub struct DirectMessageSender {
    transport: Arc<dyn MessageTransport>,
    retry_policy: RetryPolicy,
}

impl DirectMessageSender {
    pub fn new(transport: Arc<dyn MessageTransport>, retry_policy: RetryPolicy) -> Self {
        Self { transport, retry_policy }
    }

    /// Opens the private conversation, then delivers into it. Both calls go
    /// through the rate-limit retry; a failed open never attempts delivery.
    pub async fn send_direct(
        &self,
        recipient_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError> {
        let transport = self.transport.as_ref();

        let channel_id = with_rate_limit_retry(&self.retry_policy, "conversations.open", || {
            transport.open_direct_channel(recipient_id)
        })
        .await?
        .filter(|channel_id| !channel_id.trim().is_empty())
        .ok_or_else(|| DeliveryError::ChannelUnavailable { recipient_id: recipient_id.to_owned() })?;

        let channel = channel_id.as_str();
        with_rate_limit_retry(&self.retry_policy, "chat.postMessage", || {
            transport.deliver(channel, message)
        })
        .await?;

        debug!(
            event_name = "broadcast.sender.delivered",
            recipient_id,
            channel_id = channel,
            "direct message delivered"
        );
        Ok(())
    }
}
