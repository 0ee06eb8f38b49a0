//! Broadcast & delivery deduplication core.
//!
//! Sends a one-time notification (a "message kind", e.g. `welcome`) to every
//! eligible member of a channel, at most once per TTL window:
//! - **Delivery cache** (`cache`) - (recipient, kind) suppression with TTL expiry
//! - **Retry wrapper** (`retry`) - bounded backoff for rate-limited calls
//! - **Sender** (`sender`) - open a direct conversation and deliver into it
//! - **Enumerator** (`enumerator`) - paginated membership + batched attribute lookups
//! - **Orchestrator** (`orchestrator`) - preview and paced execute
//! - **Campaign** (`campaign`) - preview/confirm/cancel state machine
//!
//! # Architecture
//!
//! ```text
//! preview:  Enumerator → Cache filter → BroadcastPreview
//! execute:  for each id → Cache re-check → Sender → Cache mark → BroadcastReport
//! ```
//!
//! All outbound calls go through [`retry::with_rate_limit_retry`] and reach the
//! outside world only via [`RecipientDirectory`] and [`MessageTransport`].

pub mod cache;
pub mod campaign;
pub mod enumerator;
pub mod memory;
pub mod orchestrator;
pub mod retry;
pub mod sender;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use cache::{CacheStats, Clock, DeliveryCache, DeliveryRecord, ManualClock, SystemClock};
pub use campaign::{
    BroadcastCampaign, BroadcastEvent, BroadcastState, BroadcastTransitionError, CancelOutcome,
    ConfirmOutcome, ConfirmedRun,
};
pub use enumerator::{EnumeratorConfig, RecipientEnumerator};
pub use orchestrator::{
    BroadcastOrchestrator, BroadcastPreview, BroadcastReport, DeliveryFailure, DeliveryOutcome,
    OrchestratorConfig, PreviewOutcome,
};
pub use retry::{with_rate_limit_retry, RetryPolicy};
pub use sender::{DeliveryError, DirectMessageSender};

pub const WELCOME_MESSAGE_KIND: &str = "welcome";

/// Failure classification shared by the directory and transport collaborators.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub id: String,
    pub is_bot: bool,
    pub is_deleted: bool,
}

impl Recipient {
    /// Stand-in for a member whose attributes could not be read. Marked
    /// deleted so it never becomes eligible.
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self { id: id.into(), is_bot: false, is_deleted: true }
    }

    pub fn is_active(&self) -> bool {
        !self.is_bot && !self.is_deleted
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberPage {
    pub member_ids: Vec<String>,
    pub next_cursor: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemberAttributes {
    pub is_bot: bool,
    pub is_deleted: bool,
}

/// A direct message: fallback text plus optional structured blocks.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<serde_json::Value>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), blocks: Vec::new() }
    }

    pub fn with_blocks(mut self, blocks: Vec<serde_json::Value>) -> Self {
        self.blocks = blocks;
        self
    }
}

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn list_members(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MemberPage, ApiError>;

    async fn get_attributes(&self, recipient_id: &str) -> Result<MemberAttributes, ApiError>;
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Opens (or reuses) a private conversation. `None` means the remote side
    /// answered without a channel identifier.
    async fn open_direct_channel(&self, recipient_id: &str) -> Result<Option<String>, ApiError>;

    async fn deliver(&self, channel_id: &str, message: &OutboundMessage) -> Result<(), ApiError>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ApiError, Recipient};

    #[test]
    fn retry_after_is_only_reported_for_rate_limits() {
        let limited = ApiError::RateLimited { retry_after: Some(Duration::from_secs(3)) };
        assert!(limited.is_rate_limited());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));

        let missing = ApiError::NotFound("user_not_found".to_owned());
        assert!(!missing.is_rate_limited());
        assert_eq!(missing.retry_after(), None);
    }

    #[test]
    fn placeholder_recipient_is_never_active() {
        let recipient = Recipient::placeholder("U404");
        assert!(recipient.is_deleted);
        assert!(!recipient.is_bot);
        assert!(!recipient.is_active());
    }
}
