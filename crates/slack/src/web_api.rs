//! Slack Web API adapter for the broadcast core.
//!
//! Implements [`RecipientDirectory`] and [`MessageTransport`] on top of
//! `conversations.members`, `users.info`, `conversations.open` and
//! `chat.postMessage`. Response decoding is kept in free functions so it can
//! be exercised without a network.

use std::time::Duration;

use async_trait::async_trait;
use perkbot_core::{
    broadcast::{
        ApiError, MemberAttributes, MemberPage, MessageTransport, OutboundMessage,
        RecipientDirectory,
    },
    config::SlackConfig,
};
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

const RATE_LIMIT_CODES: &[&str] = &["ratelimited", "rate_limited", "slack_webapi_rate_limited"];
const NOT_FOUND_CODES: &[&str] = &["user_not_found", "users_not_found", "channel_not_found"];
const PERMISSION_CODES: &[&str] = &[
    "missing_scope",
    "not_authed",
    "invalid_auth",
    "account_inactive",
    "not_in_channel",
    "not_allowed_token_type",
    "cannot_dm_bot",
    "restricted_action",
];

pub struct SlackWebClient {
    http: Client,
    base_url: String,
    bot_token: SecretString,
}

impl SlackWebClient {
    pub fn new(config: &SlackConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_owned(),
            bot_token: config.bot_token.clone(),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    async fn get<T>(&self, method: &str, query: &[(&str, &str)]) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let request = self
            .http
            .get(self.endpoint(method))
            .bearer_auth(self.bot_token.expose_secret())
            .query(query);
        self.send(method, request).await
    }

    async fn post<B, T>(&self, method: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self
            .http
            .post(self.endpoint(method))
            .bearer_auth(self.bot_token.expose_secret())
            .json(body);
        self.send(method, request).await
    }

    async fn send<T>(&self, method: &str, request: reqwest::RequestBuilder) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response =
            request.send().await.map_err(|error| ApiError::Transport(error.to_string()))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await.map_err(|error| ApiError::Transport(error.to_string()))?;

        debug!(
            event_name = "slack.web_api.response",
            method,
            status = status.as_u16(),
            "slack web api responded"
        );
        decode_response(status, retry_after.as_deref(), &body)
    }
}

#[derive(Deserialize)]
struct ResponseStatus {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Default, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<String>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct UserInfoResponse {
    user: Option<SlackUser>,
}

#[derive(Deserialize)]
struct SlackUser {
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    deleted: bool,
}

#[derive(Deserialize)]
struct OpenConversationResponse {
    channel: Option<ChannelRef>,
}

#[derive(Deserialize)]
struct ChannelRef {
    id: Option<String>,
}

#[derive(Deserialize)]
struct PostMessageResponse {}

#[derive(Serialize)]
struct OpenConversationRequest<'a> {
    users: &'a str,
}

#[derive(Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    blocks: &'a Vec<serde_json::Value>,
}

#[async_trait]
impl RecipientDirectory for SlackWebClient {
    async fn list_members(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MemberPage, ApiError> {
        let limit = limit.to_string();
        let mut query = vec![("channel", channel_id), ("limit", limit.as_str())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let response: MembersResponse = self.get("conversations.members", &query).await?;
        Ok(MemberPage {
            member_ids: response.members,
            next_cursor: response.response_metadata.unwrap_or_default().next_cursor,
        })
    }

    async fn get_attributes(&self, recipient_id: &str) -> Result<MemberAttributes, ApiError> {
        let response: UserInfoResponse = self.get("users.info", &[("user", recipient_id)]).await?;
        let user = response.user.ok_or_else(|| ApiError::NotFound(recipient_id.to_owned()))?;
        Ok(MemberAttributes { is_bot: user.is_bot, is_deleted: user.deleted })
    }
}

#[async_trait]
impl MessageTransport for SlackWebClient {
    async fn open_direct_channel(&self, recipient_id: &str) -> Result<Option<String>, ApiError> {
        let response: OpenConversationResponse = self
            .post("conversations.open", &OpenConversationRequest { users: recipient_id })
            .await?;
        Ok(response.channel.and_then(|channel| channel.id).filter(|id| !id.is_empty()))
    }

    async fn deliver(&self, channel_id: &str, message: &OutboundMessage) -> Result<(), ApiError> {
        let _: PostMessageResponse = self
            .post(
                "chat.postMessage",
                &PostMessageRequest {
                    channel: channel_id,
                    text: &message.text,
                    blocks: &message.blocks,
                },
            )
            .await?;
        Ok(())
    }
}

/// Maps a Slack error code onto the core error kinds.
pub fn classify_slack_error(code: &str, retry_after: Option<Duration>) -> ApiError {
    if RATE_LIMIT_CODES.contains(&code) {
        ApiError::RateLimited { retry_after }
    } else if NOT_FOUND_CODES.contains(&code) {
        ApiError::NotFound(code.to_owned())
    } else if PERMISSION_CODES.contains(&code) {
        ApiError::PermissionDenied(code.to_owned())
    } else {
        ApiError::Transport(code.to_owned())
    }
}

/// Parses a `Retry-After` header given in (possibly fractional) seconds.
/// Non-positive or unparseable values yield `None`.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let seconds = value?.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    Some(Duration::from_millis((seconds * 1000.0).ceil() as u64))
}

pub fn decode_response<T>(
    status: StatusCode,
    retry_after: Option<&str>,
    body: &str,
) -> Result<T, ApiError>
where
    T: DeserializeOwned,
{
    let retry_after = parse_retry_after(retry_after);
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ApiError::RateLimited { retry_after });
    }

    let envelope: ResponseStatus = serde_json::from_str(body).map_err(|error| {
        if status.is_success() {
            ApiError::Transport(format!("malformed slack response: {error}"))
        } else {
            ApiError::Transport(format!("slack responded with {status}"))
        }
    })?;

    if !envelope.ok {
        let code = envelope.error.unwrap_or_else(|| "unknown_error".to_owned());
        return Err(classify_slack_error(&code, retry_after));
    }

    serde_json::from_str(body)
        .map_err(|error| ApiError::Transport(format!("malformed slack response: {error}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use perkbot_core::broadcast::ApiError;
    use reqwest::StatusCode;

    use super::{
        classify_slack_error, decode_response, parse_retry_after, MembersResponse,
        OpenConversationResponse, UserInfoResponse,
    };

    #[test]
    fn rate_limit_codes_and_status_map_to_rate_limited() {
        for code in ["ratelimited", "rate_limited", "slack_webapi_rate_limited"] {
            assert!(classify_slack_error(code, None).is_rate_limited(), "{code}");
        }

        let result = decode_response::<MembersResponse>(
            StatusCode::TOO_MANY_REQUESTS,
            Some("2"),
            "",
        );
        assert!(matches!(
            result,
            Err(ApiError::RateLimited { retry_after: Some(delay) }) if delay == Duration::from_secs(2)
        ));
    }

    #[test]
    fn retry_after_accepts_fractional_seconds_and_rejects_garbage() {
        assert_eq!(parse_retry_after(Some("1.2")), Some(Duration::from_millis(1_200)));
        assert_eq!(parse_retry_after(Some(" 30 ")), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(Some("0")), None);
        assert_eq!(parse_retry_after(Some("-1")), None);
        assert_eq!(parse_retry_after(Some("soon")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn error_codes_are_classified() {
        assert_eq!(
            classify_slack_error("user_not_found", None),
            ApiError::NotFound("user_not_found".to_owned())
        );
        assert_eq!(
            classify_slack_error("missing_scope", None),
            ApiError::PermissionDenied("missing_scope".to_owned())
        );
        assert_eq!(
            classify_slack_error("fatal_error", None),
            ApiError::Transport("fatal_error".to_owned())
        );
    }

    #[test]
    fn decodes_member_page_with_cursor() {
        let body = r#"{"ok":true,"members":["U1","U2"],"response_metadata":{"next_cursor":"dXNlcjpVMDYxTkZUVDI="}}"#;
        let page: MembersResponse =
            decode_response(StatusCode::OK, None, body).expect("members decode");

        assert_eq!(page.members, vec!["U1", "U2"]);
        assert_eq!(
            page.response_metadata.and_then(|meta| meta.next_cursor).as_deref(),
            Some("dXNlcjpVMDYxTkZUVDI=")
        );
    }

    #[test]
    fn rate_limited_error_body_keeps_header_delay() {
        let result = decode_response::<MembersResponse>(
            StatusCode::OK,
            Some("5"),
            r#"{"ok":false,"error":"ratelimited"}"#,
        );
        assert_eq!(
            result.err(),
            Some(ApiError::RateLimited { retry_after: Some(Duration::from_secs(5)) })
        );
    }

    #[test]
    fn user_flags_default_to_false() {
        let info: UserInfoResponse =
            decode_response(StatusCode::OK, None, r#"{"ok":true,"user":{"id":"U1"}}"#)
                .expect("user decode");
        let user = info.user.expect("user present");
        assert!(!user.is_bot);
        assert!(!user.deleted);
    }

    #[test]
    fn open_conversation_without_channel_id_decodes() {
        let response: OpenConversationResponse =
            decode_response(StatusCode::OK, None, r#"{"ok":true,"channel":{}}"#)
                .expect("open decode");
        assert!(response.channel.and_then(|channel| channel.id).is_none());
    }

    #[test]
    fn non_json_error_pages_become_transport_errors() {
        let result = decode_response::<MembersResponse>(
            StatusCode::BAD_GATEWAY,
            None,
            "<html>bad gateway</html>",
        );
        assert!(matches!(result, Err(ApiError::Transport(message)) if message.contains("502")));
    }
}
