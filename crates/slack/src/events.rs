use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    blocks::{self, MessageTemplate, CANCEL_BROADCAST_ACTION, CONFIRM_BROADCAST_ACTION},
    commands::{
        normalize_broadcast_command, BroadcastCommandService, CommandParseError,
        CommandRouteError, CommandRouter, NoopBroadcastCommandService, SlashCommandPayload,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlackEnvelope {
    pub envelope_id: String,
    pub event: SlackEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlackEvent {
    SlashCommand(SlashCommandPayload),
    BlockAction(BlockActionEvent),
    MemberJoinedChannel(MemberJoinedChannelEvent),
    Unsupported { event_type: String },
}

impl SlackEvent {
    pub fn event_type(&self) -> SlackEventType {
        match self {
            Self::SlashCommand(_) => SlackEventType::SlashCommand,
            Self::BlockAction(_) => SlackEventType::BlockAction,
            Self::MemberJoinedChannel(_) => SlackEventType::MemberJoinedChannel,
            Self::Unsupported { .. } => SlackEventType::Unsupported,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlackEventType {
    SlashCommand,
    BlockAction,
    MemberJoinedChannel,
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockActionEvent {
    pub channel_id: String,
    pub message_ts: String,
    pub user_id: String,
    pub action_id: String,
    pub value: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberJoinedChannelEvent {
    pub channel_id: String,
    pub user_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Responded(MessageTemplate),
    Processed,
    Ignored,
}

/// What happened when someone joined a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberJoinedOutcome {
    /// The channel is not the welcome channel.
    OtherChannel,
    AlreadyWelcomed,
    Welcomed,
    /// The welcome DM failed. The member is still marked as welcomed.
    WelcomeFailed { error: String },
    /// Direct messages are turned off. The member is marked as welcomed.
    DirectMessagesDisabled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventHandlerError {
    #[error(transparent)]
    Parse(#[from] CommandParseError),
    #[error(transparent)]
    Route(#[from] CommandRouteError),
    #[error("block action handler failure: {0}")]
    BlockAction(String),
    #[error("member joined handler failure: {0}")]
    MemberJoined(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] EventHandlerError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> SlackEventType;
    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<SlackEventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let Some(handler) = self.handlers.get(&envelope.event.event_type()) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(envelope, ctx).await.map_err(DispatchError::from)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

pub fn default_dispatcher() -> EventDispatcher {
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(SlashCommandHandler::new(NoopBroadcastCommandService));
    dispatcher.register(BlockActionHandler::new(NoopBlockActionService));
    dispatcher.register(MemberJoinedHandler::new(NoopMemberJoinedService));
    dispatcher
}

/// Wires one service that answers commands, buttons and joins into every handler.
pub fn broadcast_dispatcher<S>(service: S) -> EventDispatcher
where
    S: BroadcastCommandService + BlockActionService + MemberJoinedService + Clone + 'static,
{
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(SlashCommandHandler::new(service.clone()));
    dispatcher.register(BlockActionHandler::new(service.clone()));
    dispatcher.register(MemberJoinedHandler::new(service));
    dispatcher
}

pub struct SlashCommandHandler<S> {
    router: CommandRouter<S>,
}

impl<S> SlashCommandHandler<S>
where
    S: BroadcastCommandService,
{
    pub fn new(service: S) -> Self {
        Self { router: CommandRouter::new(service) }
    }
}

#[async_trait]
impl<S> EventHandler for SlashCommandHandler<S>
where
    S: BroadcastCommandService + 'static,
{
    fn event_type(&self) -> SlackEventType {
        SlackEventType::SlashCommand
    }

    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        _ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let SlackEvent::SlashCommand(payload) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        let normalized = normalize_broadcast_command(payload.clone())?;
        let message = self.router.route(normalized).await?;
        Ok(HandlerResult::Responded(message))
    }
}

#[async_trait]
pub trait BlockActionService: Send + Sync {
    async fn handle_block_action(
        &self,
        event: &BlockActionEvent,
        ctx: &EventContext,
    ) -> Result<Option<MessageTemplate>, EventHandlerError>;
}

pub struct BlockActionHandler<S> {
    service: S,
}

impl<S> BlockActionHandler<S>
where
    S: BlockActionService,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S> EventHandler for BlockActionHandler<S>
where
    S: BlockActionService + 'static,
{
    fn event_type(&self) -> SlackEventType {
        SlackEventType::BlockAction
    }

    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let SlackEvent::BlockAction(event) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        let message = self.service.handle_block_action(event, ctx).await?;
        Ok(match message {
            Some(message) => HandlerResult::Responded(message),
            None => HandlerResult::Processed,
        })
    }
}

pub struct NoopBlockActionService;

#[async_trait]
impl BlockActionService for NoopBlockActionService {
    async fn handle_block_action(
        &self,
        event: &BlockActionEvent,
        ctx: &EventContext,
    ) -> Result<Option<MessageTemplate>, EventHandlerError> {
        let request_id = event.request_id.as_deref().unwrap_or(&ctx.correlation_id);
        match event.action_id.as_str() {
            CANCEL_BROADCAST_ACTION => Ok(Some(blocks::broadcast_cancelled_message())),
            CONFIRM_BROADCAST_ACTION => Ok(Some(blocks::error_message(
                "Broadcast indisponível neste ambiente.",
                request_id,
            ))),
            _ => Ok(None),
        }
    }
}

#[async_trait]
pub trait MemberJoinedService: Send + Sync {
    async fn handle_member_joined(
        &self,
        event: &MemberJoinedChannelEvent,
        ctx: &EventContext,
    ) -> Result<MemberJoinedOutcome, EventHandlerError>;
}

pub struct MemberJoinedHandler<S> {
    service: S,
}

impl<S> MemberJoinedHandler<S>
where
    S: MemberJoinedService,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S> EventHandler for MemberJoinedHandler<S>
where
    S: MemberJoinedService + 'static,
{
    fn event_type(&self) -> SlackEventType {
        SlackEventType::MemberJoinedChannel
    }

    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let SlackEvent::MemberJoinedChannel(event) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        Ok(match self.service.handle_member_joined(event, ctx).await? {
            MemberJoinedOutcome::OtherChannel => HandlerResult::Ignored,
            _ => HandlerResult::Processed,
        })
    }
}

#[derive(Default)]
pub struct NoopMemberJoinedService;

#[async_trait]
impl MemberJoinedService for NoopMemberJoinedService {
    async fn handle_member_joined(
        &self,
        _event: &MemberJoinedChannelEvent,
        _ctx: &EventContext,
    ) -> Result<MemberJoinedOutcome, EventHandlerError> {
        Ok(MemberJoinedOutcome::OtherChannel)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        default_dispatcher, BlockActionEvent, EventContext, EventDispatcher, HandlerResult,
        MemberJoinedChannelEvent, SlackEnvelope, SlackEvent,
    };
    use crate::commands::SlashCommandPayload;

    fn block_action(action_id: &str) -> SlackEnvelope {
        SlackEnvelope {
            envelope_id: format!("env-{action_id}"),
            event: SlackEvent::BlockAction(BlockActionEvent {
                channel_id: "C1".to_owned(),
                message_ts: "1730000000.6000".to_owned(),
                user_id: "U6".to_owned(),
                action_id: action_id.to_owned(),
                value: Some("C0BENEFITS".to_owned()),
                request_id: Some("req-block-1".to_owned()),
            }),
        }
    }

    #[tokio::test]
    async fn dispatcher_routes_slash_commands() {
        let dispatcher = default_dispatcher();
        let envelope = SlackEnvelope {
            envelope_id: "env-1".to_owned(),
            event: SlackEvent::SlashCommand(SlashCommandPayload {
                command: "/beneficios-broadcast-preview".to_owned(),
                text: "help".to_owned(),
                channel_id: "C1".to_owned(),
                user_id: "U1".to_owned(),
                trigger_ts: "1".to_owned(),
                request_id: "req-1".to_owned(),
            }),
        };

        let result =
            dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");

        assert!(matches!(result, HandlerResult::Responded(_)));
    }

    #[tokio::test]
    async fn dispatcher_surfaces_unsupported_slash_command_as_error() {
        let dispatcher = default_dispatcher();
        let envelope = SlackEnvelope {
            envelope_id: "env-unsupported".to_owned(),
            event: SlackEvent::SlashCommand(SlashCommandPayload {
                command: "/beneficios".to_owned(),
                text: String::new(),
                channel_id: "C1".to_owned(),
                user_id: "U1".to_owned(),
                trigger_ts: "1".to_owned(),
                request_id: "req-1".to_owned(),
            }),
        };

        let result = dispatcher.dispatch(&envelope, &EventContext::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dispatcher_returns_ignored_when_no_handler_registered() {
        let dispatcher = EventDispatcher::new();
        let envelope = SlackEnvelope {
            envelope_id: "env-2".to_owned(),
            event: SlackEvent::MemberJoinedChannel(MemberJoinedChannelEvent {
                channel_id: "C1".to_owned(),
                user_id: "U2".to_owned(),
            }),
        };

        let result =
            dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");

        assert_eq!(result, HandlerResult::Ignored);
    }

    #[test]
    fn default_dispatcher_registers_handlers() {
        let dispatcher = default_dispatcher();
        assert_eq!(dispatcher.handler_count(), 3);
    }

    #[tokio::test]
    async fn noop_block_actions_answer_cancel_and_ignore_unknown() {
        let dispatcher = default_dispatcher();

        let cancelled = dispatcher
            .dispatch(&block_action("cancel_broadcast"), &EventContext::default())
            .await
            .expect("dispatch");
        let HandlerResult::Responded(message) = cancelled else {
            panic!("cancel should respond");
        };
        assert!(message.fallback_text.contains("Broadcast cancelado"));

        let unknown = dispatcher
            .dispatch(&block_action("unknown.action"), &EventContext::default())
            .await
            .expect("dispatch");
        assert_eq!(unknown, HandlerResult::Processed);
    }

    #[tokio::test]
    async fn unsupported_events_are_ignored() {
        let dispatcher = default_dispatcher();
        let envelope = SlackEnvelope {
            envelope_id: "env-3".to_owned(),
            event: SlackEvent::Unsupported { event_type: "reaction_added".to_owned() },
        };

        let result =
            dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");
        assert_eq!(result, HandlerResult::Ignored);
    }
}
