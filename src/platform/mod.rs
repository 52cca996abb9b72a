//! Chat platform collaborator
//!
//! Parrot reads message history and membership state from the chat platform
//! and deletes the avatar artifacts it uploaded there. Both concerns sit
//! behind traits so the core can run against Discord or a test double.

mod discord;
#[cfg(any(test, feature = "mock-platform"))]
mod mock;

pub use discord::{DiscordClient, DiscordStatusMessage};
#[cfg(any(test, feature = "mock-platform"))]
pub use mock::{MockPlatform, MockPresence};

use crate::db::{Antiavatar, ChannelId, GuildId, Message, MessageId, UserId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// A message as read from channel history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
}

impl HistoryMessage {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            content: self.content,
            author_id: self.author_id,
            channel_id: self.channel_id,
            guild_id: self.guild_id,
        }
    }
}

/// Whether a user is currently in a guild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
}

/// Read access to the chat platform
#[async_trait]
pub trait Platform: Send + Sync {
    /// Messages in `channel`, newest first, stopping at `limit` messages or at
    /// the first message sent at or before `after`.
    fn history(
        &self,
        guild: GuildId,
        channel: ChannelId,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> BoxStream<'static, Result<HistoryMessage>>;

    /// Look the user up in the guild. Errors mean the answer is unknown, not
    /// that the user is absent.
    async fn member_presence(&self, guild: GuildId, user: UserId) -> Result<Presence>;

    /// When the user joined the guild, or `None` if they aren't in it
    async fn member_joined_at(&self, guild: GuildId, user: UserId) -> Result<Option<DateTime<Utc>>>;
}

/// Storage for derived avatars hosted on the platform
#[async_trait]
pub trait AvatarStore: Send + Sync {
    async fn delete_antiavatar(&self, antiavatar: &Antiavatar) -> Result<()>;
}
