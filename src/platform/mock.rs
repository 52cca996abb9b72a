//! In-process platform double for tests

use super::{AvatarStore, HistoryMessage, Platform, Presence};
use crate::db::{snowflake_time, Antiavatar, ChannelId, GuildId, MessageId, UserId};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted answer for a member lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPresence {
    Present,
    Absent,
    /// The lookup fails
    Unavailable,
}

#[derive(Default)]
struct MockState {
    /// Channel history, oldest first
    histories: HashMap<ChannelId, Vec<HistoryMessage>>,
    presence: HashMap<(GuildId, UserId), MockPresence>,
    joined_at: HashMap<(GuildId, UserId), DateTime<Utc>>,
    failing_avatars: HashSet<(UserId, GuildId)>,
    deleted_avatars: Vec<(UserId, GuildId)>,
    presence_lookups: usize,
}

/// Platform double with scripted history, presence and avatar failures
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
    item_delay: Option<Duration>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before yielding each history item
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = Some(delay);
        self
    }

    /// Append a message to a channel's history. The message ID doubles as its
    /// timestamp, so IDs should increase.
    pub fn push_message(
        &self,
        guild: GuildId,
        channel: ChannelId,
        id: u64,
        author: UserId,
        content: &str,
    ) {
        let mut state = self.lock();
        state
            .histories
            .entry(channel)
            .or_default()
            .push(HistoryMessage {
                id: MessageId(id),
                guild_id: guild,
                channel_id: channel,
                author_id: author,
                content: content.to_string(),
            });
    }

    pub fn set_presence(&self, guild: GuildId, user: UserId, presence: MockPresence) {
        self.lock().presence.insert((guild, user), presence);
    }

    /// Record a join time; the member also becomes present
    pub fn set_joined_at(&self, guild: GuildId, user: UserId, at: DateTime<Utc>) {
        let mut state = self.lock();
        state.joined_at.insert((guild, user), at);
        state.presence.insert((guild, user), MockPresence::Present);
    }

    pub fn fail_avatar_deletion(&self, user: UserId, guild: GuildId) {
        self.lock().failing_avatars.insert((user, guild));
    }

    pub fn deleted_avatars(&self) -> Vec<(UserId, GuildId)> {
        self.lock().deleted_avatars.clone()
    }

    pub fn presence_lookups(&self) -> usize {
        self.lock().presence_lookups
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn history(
        &self,
        _guild: GuildId,
        channel: ChannelId,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> BoxStream<'static, Result<HistoryMessage>> {
        let items: Vec<HistoryMessage> = self
            .lock()
            .histories
            .get(&channel)
            .map(|h| {
                h.iter()
                    .rev()
                    .take_while(|m| match after {
                        Some(after) => snowflake_time(m.id.0) > after,
                        None => true,
                    })
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let delay = self.item_delay;
        stream::iter(items)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(item)
            })
            .boxed()
    }

    async fn member_presence(&self, guild: GuildId, user: UserId) -> Result<Presence> {
        let mut state = self.lock();
        state.presence_lookups += 1;
        match state.presence.get(&(guild, user)) {
            Some(MockPresence::Present) => Ok(Presence::Present),
            Some(MockPresence::Absent) | None => Ok(Presence::Absent),
            Some(MockPresence::Unavailable) => Err(Error::Platform(format!(
                "guild {} unavailable",
                guild
            ))),
        }
    }

    async fn member_joined_at(&self, guild: GuildId, user: UserId) -> Result<Option<DateTime<Utc>>> {
        let state = self.lock();
        match state.presence.get(&(guild, user)) {
            Some(MockPresence::Present) => Ok(state.joined_at.get(&(guild, user)).copied()),
            Some(MockPresence::Absent) | None => Ok(None),
            Some(MockPresence::Unavailable) => Err(Error::Platform(format!(
                "guild {} unavailable",
                guild
            ))),
        }
    }
}

#[async_trait]
impl AvatarStore for MockPlatform {
    async fn delete_antiavatar(&self, antiavatar: &Antiavatar) -> Result<()> {
        let key = (antiavatar.user_id, antiavatar.guild_id);
        let mut state = self.lock();
        if state.failing_avatars.contains(&key) {
            return Err(Error::Platform(format!(
                "could not delete avatar message {}",
                antiavatar.message_id
            )));
        }
        state.deleted_avatars.push(key);
        Ok(())
    }
}
