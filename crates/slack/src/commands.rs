use async_trait::async_trait;
use thiserror::Error;

use crate::blocks::{self, MessageTemplate};

pub const BROADCAST_PREVIEW_COMMAND: &str = "/beneficios-broadcast-preview";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlashCommandPayload {
    pub command: String,
    pub text: String,
    pub channel_id: String,
    pub user_id: String,
    pub trigger_ts: String,
    pub request_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub command: String,
    pub verb: String,
    pub freeform_args: String,
    pub channel_id: String,
    pub user_id: String,
    pub trigger_ts: String,
    pub request_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastCommand {
    /// Preview the configured welcome channel, or the channel mentioned in
    /// the command text.
    Preview { channel_override: Option<String> },
    Help,
    Unknown { verb: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("unsupported slash command: {0}")]
    UnsupportedCommand(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandRouteError {
    #[error("command service failed: {0}")]
    Service(String),
}

pub fn normalize_broadcast_command(
    payload: SlashCommandPayload,
) -> Result<CommandEnvelope, CommandParseError> {
    if payload.command != BROADCAST_PREVIEW_COMMAND {
        return Err(CommandParseError::UnsupportedCommand(payload.command));
    }

    let text = payload.text.trim().to_owned();
    let mut parts = text.split_whitespace();
    let verb = parts.next().map(str::to_owned).unwrap_or_default();
    let freeform_args = parts.collect::<Vec<_>>().join(" ");

    Ok(CommandEnvelope {
        command: BROADCAST_PREVIEW_COMMAND.trim_start_matches('/').to_owned(),
        verb,
        freeform_args,
        channel_id: payload.channel_id,
        user_id: payload.user_id,
        trigger_ts: payload.trigger_ts,
        request_id: payload.request_id,
    })
}

pub fn parse_broadcast_command(input: &str) -> BroadcastCommand {
    let verb = input.split_whitespace().next().unwrap_or_default();
    classify_broadcast_command(verb)
}

pub struct CommandRouter<S> {
    service: S,
}

impl<S> CommandRouter<S>
where
    S: BroadcastCommandService,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub async fn route(
        &self,
        envelope: CommandEnvelope,
    ) -> Result<MessageTemplate, CommandRouteError> {
        match classify_broadcast_command(&envelope.verb) {
            BroadcastCommand::Preview { channel_override } => {
                self.service.preview_broadcast(channel_override, &envelope).await
            }
            BroadcastCommand::Help => Ok(blocks::help_message()),
            BroadcastCommand::Unknown { verb } => Ok(blocks::error_message(
                &format!(
                    "Argumento desconhecido `{verb}`. Use `{BROADCAST_PREVIEW_COMMAND} help`."
                ),
                &envelope.request_id,
            )),
        }
    }
}

#[async_trait]
pub trait BroadcastCommandService: Send + Sync {
    async fn preview_broadcast(
        &self,
        channel_override: Option<String>,
        envelope: &CommandEnvelope,
    ) -> Result<MessageTemplate, CommandRouteError>;
}

#[derive(Default)]
pub struct NoopBroadcastCommandService;

#[async_trait]
impl BroadcastCommandService for NoopBroadcastCommandService {
    async fn preview_broadcast(
        &self,
        channel_override: Option<String>,
        envelope: &CommandEnvelope,
    ) -> Result<MessageTemplate, CommandRouteError> {
        let channel = channel_override.unwrap_or_else(|| envelope.channel_id.clone());
        Ok(blocks::error_message(
            &format!("Broadcast indisponível para <#{channel}> neste ambiente."),
            &envelope.request_id,
        ))
    }
}

fn classify_broadcast_command(verb: &str) -> BroadcastCommand {
    if verb.is_empty() {
        return BroadcastCommand::Preview { channel_override: None };
    }
    if verb.eq_ignore_ascii_case("help") {
        return BroadcastCommand::Help;
    }
    match parse_channel_token(verb) {
        Some(channel_id) => BroadcastCommand::Preview { channel_override: Some(channel_id) },
        None => BroadcastCommand::Unknown { verb: verb.to_owned() },
    }
}

/// Accepts a Slack channel mention (`<#C123|name>`) or a bare channel id.
fn parse_channel_token(token: &str) -> Option<String> {
    let candidate = match token.strip_prefix("<#").and_then(|rest| rest.strip_suffix('>')) {
        Some(mention) => mention.split('|').next().unwrap_or(mention),
        None => token,
    };

    let mut chars = candidate.chars();
    let prefix_ok = matches!(chars.next(), Some('C' | 'G'));
    let rest_ok = candidate.len() > 1
        && chars.all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit());
    (prefix_ok && rest_ok).then(|| candidate.to_owned())
}
