//! In-memory directory and transport for tests and local dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ApiError, MemberAttributes, MemberPage, MessageTransport, OutboundMessage, RecipientDirectory,
};

#[derive(Default)]
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
}

#[derive(Default)]
struct DirectoryState {
    members: Vec<(String, MemberAttributes)>,
    lookup_failures: HashMap<String, ApiError>,
    listing_failure: Option<ApiError>,
    listing_calls: usize,
    lookup_calls: usize,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, id: &str, attributes: MemberAttributes) -> &Self {
        self.state().members.push((id.to_owned(), attributes));
        self
    }

    pub fn add_user(&self, id: &str) -> &Self {
        self.add_member(id, MemberAttributes::default())
    }

    pub fn add_bot(&self, id: &str) -> &Self {
        self.add_member(id, MemberAttributes { is_bot: true, is_deleted: false })
    }

    pub fn add_deactivated(&self, id: &str) -> &Self {
        self.add_member(id, MemberAttributes { is_bot: false, is_deleted: true })
    }

    pub fn fail_lookup(&self, id: &str, error: ApiError) -> &Self {
        self.state().lookup_failures.insert(id.to_owned(), error);
        self
    }

    pub fn fail_listing(&self, error: ApiError) -> &Self {
        self.state().listing_failure = Some(error);
        self
    }

    pub fn listing_calls(&self) -> usize {
        self.state().listing_calls
    }

    pub fn lookup_calls(&self) -> usize {
        self.state().lookup_calls
    }

    fn state(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecipientDirectory for InMemoryDirectory {
    async fn list_members(
        &self,
        _channel_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MemberPage, ApiError> {
        let mut state = self.state();
        state.listing_calls += 1;
        if let Some(error) = &state.listing_failure {
            return Err(error.clone());
        }

        let offset = match cursor {
            Some(cursor) => cursor
                .strip_prefix("offset:")
                .and_then(|raw| raw.parse::<usize>().ok())
                .ok_or_else(|| ApiError::Transport(format!("invalid_cursor: {cursor}")))?,
            None => 0,
        };
        let limit = usize::try_from(limit.max(1)).unwrap_or(usize::MAX);
        let end = offset.saturating_add(limit).min(state.members.len());
        let member_ids =
            state.members.get(offset..end).unwrap_or_default().iter().map(|(id, _)| id.clone());

        Ok(MemberPage {
            member_ids: member_ids.collect(),
            // an exhausted listing reports an empty cursor rather than none
            next_cursor: Some(if end < state.members.len() {
                format!("offset:{end}")
            } else {
                String::new()
            }),
        })
    }

    async fn get_attributes(&self, recipient_id: &str) -> Result<MemberAttributes, ApiError> {
        let mut state = self.state();
        state.lookup_calls += 1;
        if let Some(error) = state.lookup_failures.get(recipient_id) {
            return Err(error.clone());
        }

        state
            .members
            .iter()
            .find(|(id, _)| id == recipient_id)
            .map(|(_, attributes)| *attributes)
            .ok_or_else(|| ApiError::NotFound("user_not_found".to_owned()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedDelivery {
    pub recipient_id: String,
    pub channel_id: String,
    pub message: OutboundMessage,
}

#[derive(Default)]
pub struct RecordingTransport {
    state: Mutex<TransportState>,
}

#[derive(Default)]
struct TransportState {
    channels: HashMap<String, String>,
    missing_channels: HashSet<String>,
    open_failures: HashMap<String, ApiError>,
    delivery_failures: HashMap<String, ApiError>,
    pending_rate_limits: u32,
    rate_limit_hint: Option<Duration>,
    deliveries: Vec<RecordedDelivery>,
    open_calls: usize,
    deliver_calls: usize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn omit_channel_for(&self, recipient_id: &str) -> &Self {
        self.state().missing_channels.insert(recipient_id.to_owned());
        self
    }

    pub fn fail_open_for(&self, recipient_id: &str, error: ApiError) -> &Self {
        self.state().open_failures.insert(recipient_id.to_owned(), error);
        self
    }

    pub fn fail_delivery_for(&self, recipient_id: &str, error: ApiError) -> &Self {
        self.state().delivery_failures.insert(recipient_id.to_owned(), error);
        self
    }

    /// Rejects the next `times` deliveries as rate limited.
    pub fn rate_limit_deliveries(&self, times: u32, retry_after: Option<Duration>) -> &Self {
        let mut state = self.state();
        state.pending_rate_limits = times;
        state.rate_limit_hint = retry_after;
        drop(state);
        self
    }

    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.state().deliveries.clone()
    }

    pub fn delivered_recipients(&self) -> Vec<String> {
        self.state().deliveries.iter().map(|delivery| delivery.recipient_id.clone()).collect()
    }

    pub fn open_calls(&self) -> usize {
        self.state().open_calls
    }

    pub fn deliver_calls(&self) -> usize {
        self.state().deliver_calls
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn open_direct_channel(&self, recipient_id: &str) -> Result<Option<String>, ApiError> {
        let mut state = self.state();
        state.open_calls += 1;
        if let Some(error) = state.open_failures.get(recipient_id) {
            return Err(error.clone());
        }
        if state.missing_channels.contains(recipient_id) {
            return Ok(None);
        }

        let channel_id = format!("D-{recipient_id}");
        state.channels.insert(channel_id.clone(), recipient_id.to_owned());
        Ok(Some(channel_id))
    }

    async fn deliver(&self, channel_id: &str, message: &OutboundMessage) -> Result<(), ApiError> {
        let mut state = self.state();
        state.deliver_calls += 1;
        if state.pending_rate_limits > 0 {
            state.pending_rate_limits -= 1;
            return Err(ApiError::RateLimited { retry_after: state.rate_limit_hint });
        }

        let recipient_id = state
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("channel_not_found".to_owned()))?;
        if let Some(error) = state.delivery_failures.get(&recipient_id) {
            return Err(error.clone());
        }

        state.deliveries.push(RecordedDelivery {
            recipient_id,
            channel_id: channel_id.to_owned(),
            message: message.clone(),
        });
        Ok(())
    }
}
