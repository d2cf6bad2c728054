//! Discord REST transport.
//!
//! Reads channel history and posts/edits messages over the HTTP API with a
//! bot token. No gateway connection: the poller drives all reads.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::core::channels::{ChannelId, MessageId};
use crate::core::config::DiscordConfig;
use crate::core::transport::{InboundMessage, MessageSink, MessageSource, TransportError};

/// Used when a 429 carries no usable delay.
const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);
/// Longer server delays are cut down to this.
const MAX_RATE_LIMIT_DELAY: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct ApiAuthor {
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: String,
    author: ApiAuthor,
}

#[derive(Debug, Deserialize)]
struct ApiCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiRateLimit {
    retry_after: f64,
}

pub fn authorization_value(token: &str) -> String {
    let token = token.trim();
    if token.starts_with("Bot ") || token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bot {}", token)
    }
}

/// Server-requested delay: the JSON body is more precise than the header.
pub fn retry_after(headers: &HeaderMap, body: &str) -> Duration {
    let from_body = serde_json::from_str::<ApiRateLimit>(body)
        .ok()
        .map(|r| r.retry_after);
    let from_header = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok());
    from_body
        .or(from_header)
        .filter(|secs| *secs >= 0.0)
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_or(MAX_RATE_LIMIT_DELAY, |d| d.min(MAX_RATE_LIMIT_DELAY))
        })
        .unwrap_or(DEFAULT_RATE_LIMIT_DELAY)
}

pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> TransportError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return TransportError::RateLimited(retry_after(headers, body));
    }
    let detail = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    if status.is_server_error() {
        TransportError::Transient(detail)
    } else {
        TransportError::Rejected(detail)
    }
}

fn classify_request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        TransportError::Transient(err.to_string())
    } else {
        TransportError::Rejected(err.to_string())
    }
}

fn parse_messages(channel_id: &ChannelId, body: &str) -> Result<Vec<InboundMessage>, TransportError> {
    let raw: Vec<ApiMessage> = serde_json::from_str(body)
        .map_err(|e| TransportError::Rejected(format!("unexpected message list: {}", e)))?;
    Ok(raw
        .into_iter()
        .filter_map(|m| {
            Some(InboundMessage {
                id: MessageId::parse(&m.id)?,
                channel_id: channel_id.clone(),
                author_id: m.author.id,
                author_name: m.author.username,
                content: m.content,
                timestamp: m.timestamp,
                is_bot: m.author.bot,
            })
        })
        .collect())
}

pub struct DiscordRest {
    client: reqwest::Client,
    api_base: String,
    authorization: String,
}

impl DiscordRest {
    pub fn new(cfg: &DiscordConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .user_agent(concat!("reportbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            authorization: authorization_value(&cfg.token),
        })
    }

    /// The bot's own user id, used to skip its own messages.
    pub async fn current_user_id(&self) -> Result<String, TransportError> {
        let request = self.client.get(format!("{}/users/@me", self.api_base));
        let body = self.execute(request).await?;
        let user: ApiUser = serde_json::from_str(&body)
            .map_err(|e| TransportError::Rejected(format!("unexpected user response: {}", e)))?;
        Ok(user.id)
    }

    fn messages_url(&self, channel_id: &ChannelId) -> String {
        format!("{}/channels/{}/messages", self.api_base, channel_id)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<String, TransportError> {
        let response = request
            .header(AUTHORIZATION, &self.authorization)
            .send()
            .await
            .map_err(classify_request_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(classify_request_error)?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status, &headers, &body))
        }
    }
}

#[async_trait]
impl MessageSource for DiscordRest {
    async fn list_messages(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let request = self
            .client
            .get(self.messages_url(channel_id))
            .query(&[("limit", limit.clamp(1, 100))]);
        let body = self.execute(request).await?;
        parse_messages(channel_id, &body)
    }
}

#[async_trait]
impl MessageSink for DiscordRest {
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
    ) -> Result<MessageId, TransportError> {
        let request = self
            .client
            .post(self.messages_url(channel_id))
            .json(&serde_json::json!({ "content": content }));
        let body = self.execute(request).await?;
        let created: ApiCreated = serde_json::from_str(&body)
            .map_err(|e| TransportError::Rejected(format!("unexpected create response: {}", e)))?;
        let id = MessageId::parse(&created.id)
            .ok_or_else(|| TransportError::Rejected(format!("bad message id {}", created.id)))?;
        debug!("[discord] Posted message {} in channel {}", id, channel_id);
        Ok(id)
    }

    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), TransportError> {
        let request = self
            .client
            .patch(format!("{}/{}", self.messages_url(channel_id), message_id))
            .json(&serde_json::json!({ "content": content }));
        self.execute(request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn token_gets_the_bot_scheme_once() {
        assert_eq!(authorization_value("abc"), "Bot abc");
        assert_eq!(authorization_value(" Bot abc "), "Bot abc");
    }

    #[test]
    fn rate_limit_prefers_the_body_delay() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            &headers,
            r#"{"message": "You are being rate limited.", "retry_after": 0.25, "global": false}"#,
        );
        assert_eq!(err, TransportError::RateLimited(Duration::from_millis(250)));

        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(err, TransportError::RateLimited(Duration::from_secs(3)));

        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), "");
        assert_eq!(err, TransportError::RateLimited(DEFAULT_RATE_LIMIT_DELAY));
    }

    #[test]
    fn oversized_or_bogus_delays_are_bounded() {
        let h = HeaderMap::new();
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &h, r#"{"retry_after": 1e300}"#);
        assert_eq!(err, TransportError::RateLimited(MAX_RATE_LIMIT_DELAY));

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("inf"));
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(err, TransportError::RateLimited(MAX_RATE_LIMIT_DELAY));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("NaN"));
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(err, TransportError::RateLimited(DEFAULT_RATE_LIMIT_DELAY));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("-4"));
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(err, TransportError::RateLimited(DEFAULT_RATE_LIMIT_DELAY));
    }

    #[test]
    fn server_errors_are_transient_and_client_errors_rejected() {
        let h = HeaderMap::new();
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &h, "upstream"),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &h, r#"{"message":"Missing Access"}"#),
            TransportError::Rejected(_)
        ));
    }

    #[test]
    fn message_list_is_parsed() {
        let body = r#"[
            {"id": "1200", "content": "!relatorio", "timestamp": "2026-03-02T10:00:00+00:00",
             "author": {"id": "77", "username": "ana"}},
            {"id": "1199", "content": "done", "timestamp": "2026-03-02T09:59:00+00:00",
             "author": {"id": "5", "username": "reportbot", "bot": true}},
            {"id": "not-a-snowflake", "content": "", "author": {"id": "1"}}
        ]"#;
        let channel = ChannelId::new("10");
        let messages = parse_messages(&channel, body).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, MessageId(1200));
        assert_eq!(messages[0].author_name, "ana");
        assert!(!messages[0].is_bot);
        assert!(messages[1].is_bot);
        assert_eq!(messages[1].channel_id, channel);
    }

    #[test]
    fn malformed_listing_is_rejected() {
        assert!(matches!(
            parse_messages(&ChannelId::new("1"), "{\"message\": \"oops\"}"),
            Err(TransportError::Rejected(_))
        ));
    }
}
