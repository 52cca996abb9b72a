//! Discord REST client

use super::{AvatarStore, HistoryMessage, Platform, Presence};
use crate::config::DiscordConfig;
use crate::db::{time_snowflake, Antiavatar, ChannelId, GuildId, MessageId, UserId};
use crate::error::{Error, Result};
use crate::scan::{ProgressReporter, ScanProgress, ScanSummary};
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Discord caps message history pages at 100
const PAGE_SIZE: usize = 100;

/// Attempts per request when rate limited
const MAX_ATTEMPTS: usize = 3;

/// JSON error code for "Unknown Member"
const UNKNOWN_MEMBER: u64 = 10007;

fn de_snowflake<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
struct RawAuthor {
    #[serde(deserialize_with = "de_snowflake")]
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(deserialize_with = "de_snowflake")]
    id: u64,
    #[serde(default)]
    content: String,
    author: RawAuthor,
}

#[derive(Debug, Deserialize)]
struct RawMember {
    #[serde(default)]
    joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    #[serde(default)]
    code: u64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RateLimited {
    retry_after: f64,
}

/// Discord REST v10 client
#[derive(Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    avatar_channel_id: Option<ChannelId>,
}

impl DiscordClient {
    /// Create a client from configuration; the token is read from the
    /// environment variable the configuration names.
    pub fn from_config(config: &DiscordConfig) -> Result<Self> {
        let token = config.resolve_token()?;
        Ok(Self::new(
            config.api_base.clone(),
            token,
            config.avatar_channel_id.map(ChannelId),
        ))
    }

    pub fn new(api_base: String, token: String, avatar_channel_id: Option<ChannelId>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            avatar_channel_id,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Send a request, waiting out rate limits
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        for attempt in 1..=MAX_ATTEMPTS {
            let mut request = self
                .http
                .request(method.clone(), self.url(path))
                .header("Authorization", format!("Bot {}", self.token));
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            let wait = response
                .json::<RateLimited>()
                .await
                .map(|r| r.retry_after)
                .unwrap_or(1.0);
            tracing::debug!(path, attempt, wait, "Rate limited by Discord");
            tokio::time::sleep(Duration::from_secs_f64(wait.max(0.0))).await;
        }

        Err(Error::Platform(format!(
            "{} {}: still rate limited after {} attempts",
            method, path, MAX_ATTEMPTS
        )))
    }

    async fn error_from(response: reqwest::Response, context: &str) -> Error {
        let status = response.status();
        match response.json::<RawError>().await {
            Ok(err) => Error::Platform(format!(
                "{}: {} (code {}): {}",
                context, status, err.code, err.message
            )),
            Err(_) => Error::Platform(format!("{}: {}", context, status)),
        }
    }

    async fn fetch_page(
        &self,
        channel: ChannelId,
        before: Option<u64>,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        let mut path = format!("/channels/{}/messages?limit={}", channel, limit);
        if let Some(before) = before {
            path.push_str(&format!("&before={}", before));
        }

        let response = self.send(Method::GET, &path, None).await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response, "fetch channel history").await);
        }
        Ok(response.json().await?)
    }

    /// Look up a guild member; `None` when Discord reports an unknown member
    async fn fetch_member(&self, guild: GuildId, user: UserId) -> Result<Option<RawMember>> {
        let path = format!("/guilds/{}/members/{}", guild, user);
        let response = self.send(Method::GET, &path, None).await?;
        let status = response.status();

        if status.is_success() {
            return Ok(Some(response.json().await?));
        }
        if status == StatusCode::NOT_FOUND {
            // A 404 for an unknown guild says nothing about the member
            return match response.json::<RawError>().await {
                Ok(err) if err.code == UNKNOWN_MEMBER => Ok(None),
                Ok(err) => Err(Error::Platform(format!(
                    "member lookup in guild {}: code {}: {}",
                    guild, err.code, err.message
                ))),
                Err(e) => Err(Error::Platform(format!(
                    "member lookup in guild {}: unreadable 404: {}",
                    guild, e
                ))),
            };
        }
        Err(Self::error_from(response, "member lookup").await)
    }

    /// Replace the content of a message the bot sent
    pub async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: &str,
    ) -> Result<()> {
        let path = format!("/channels/{}/messages/{}", channel, message);
        let body = serde_json::json!({ "content": content });
        let response = self.send(Method::PATCH, &path, Some(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response, "edit message").await);
        }
        Ok(())
    }

    /// Delete a message. Deleting a message that is already gone succeeds.
    pub async fn delete_message(&self, channel: ChannelId, message: MessageId) -> Result<()> {
        let path = format!("/channels/{}/messages/{}", channel, message);
        let response = self.send(Method::DELETE, &path, None).await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::error_from(response, "delete message").await)
    }
}

#[async_trait]
impl Platform for DiscordClient {
    fn history(
        &self,
        guild: GuildId,
        channel: ChannelId,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> BoxStream<'static, Result<HistoryMessage>> {
        let client = self.clone();
        let after_id = after.map(time_snowflake);

        Box::pin(try_stream! {
            let mut before: Option<u64> = None;
            let mut yielded = 0usize;

            'pages: while yielded < limit {
                let page = client
                    .fetch_page(channel, before, (limit - yielded).min(PAGE_SIZE))
                    .await?;
                if page.is_empty() {
                    break;
                }

                for raw in page {
                    if matches!(after_id, Some(after_id) if raw.id <= after_id) {
                        break 'pages;
                    }
                    before = Some(raw.id);
                    yielded += 1;
                    yield HistoryMessage {
                        id: MessageId(raw.id),
                        guild_id: guild,
                        channel_id: channel,
                        author_id: UserId(raw.author.id),
                        content: raw.content,
                    };
                }
            }
        })
    }

    async fn member_presence(&self, guild: GuildId, user: UserId) -> Result<Presence> {
        Ok(match self.fetch_member(guild, user).await? {
            Some(_) => Presence::Present,
            None => Presence::Absent,
        })
    }

    async fn member_joined_at(&self, guild: GuildId, user: UserId) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .fetch_member(guild, user)
            .await?
            .and_then(|member| member.joined_at))
    }
}

#[async_trait]
impl AvatarStore for DiscordClient {
    async fn delete_antiavatar(&self, antiavatar: &Antiavatar) -> Result<()> {
        let channel = self.avatar_channel_id.ok_or_else(|| {
            Error::Config("discord.avatar_channel_id is not configured".to_string())
        })?;
        self.delete_message(channel, antiavatar.message_id).await
    }
}

/// A Discord message that is edited in place to show scan progress
pub struct DiscordStatusMessage {
    client: DiscordClient,
    channel: ChannelId,
    message: MessageId,
}

impl DiscordStatusMessage {
    pub fn new(client: DiscordClient, channel: ChannelId, message: MessageId) -> Self {
        Self {
            client,
            channel,
            message,
        }
    }
}

#[async_trait]
impl ProgressReporter for DiscordStatusMessage {
    async fn update(&self, progress: &ScanProgress) -> Result<()> {
        self.client
            .edit_message(self.channel, self.message, &progress.render())
            .await
    }

    async fn finish(&self, summary: &ScanSummary) -> Result<()> {
        self.client
            .edit_message(self.channel, self.message, &summary.render())
            .await
    }
}
