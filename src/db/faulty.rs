//! Store double that wraps [`MemoryStore`] with scripted failures and pauses

use super::models::*;
use super::{MemoryStore, Store};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct CorpusPause {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

/// [`MemoryStore`] that can fail membership listings and hold a corpus read
pub struct FaultyStore {
    inner: MemoryStore,
    failing_memberships: AtomicBool,
    corpus_pause: Mutex<Option<CorpusPause>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing_memberships: AtomicBool::new(false),
            corpus_pause: Mutex::new(None),
        }
    }

    /// Make `user_memberships` fail from now on
    pub fn fail_user_memberships(&self) {
        self.failing_memberships.store(true, Ordering::SeqCst);
    }

    /// Hold the next `messages_content` call. The first notify fires once the
    /// read is waiting; notifying the second lets it continue.
    pub fn pause_next_corpus_read(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.corpus_pause.lock().unwrap_or_else(|e| e.into_inner()) = Some(CorpusPause {
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }
}

impl Default for FaultyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn user_exists(&self, user: UserId) -> Result<bool> {
        self.inner.user_exists(user).await
    }

    async fn wants_random_wawa(&self, user: UserId) -> Result<bool> {
        self.inner.wants_random_wawa(user).await
    }

    async fn toggle_random_wawa(&self, user: UserId) -> Result<bool> {
        self.inner.toggle_random_wawa(user).await
    }

    async fn export_user(&self, user: UserId) -> Result<Option<UserExport>> {
        self.inner.export_user(user).await
    }

    async fn delete_user(&self, user: UserId) -> Result<bool> {
        self.inner.delete_user(user).await
    }

    async fn get_guild(&self, guild: GuildId) -> Result<Option<Guild>> {
        self.inner.get_guild(guild).await
    }

    async fn set_imitation_prefix(&self, guild: GuildId, prefix: Option<String>) -> Result<()> {
        self.inner.set_imitation_prefix(guild, prefix).await
    }

    async fn set_imitation_suffix(&self, guild: GuildId, suffix: Option<String>) -> Result<()> {
        self.inner.set_imitation_suffix(guild, suffix).await
    }

    async fn guild_memberships(&self, guild: GuildId) -> Result<Vec<Membership>> {
        self.inner.guild_memberships(guild).await
    }

    async fn delete_guild(&self, guild: GuildId) -> Result<bool> {
        self.inner.delete_guild(guild).await
    }

    async fn set_channel_permission(
        &self,
        channel: ChannelId,
        guild: GuildId,
        permission: Permission,
        value: bool,
    ) -> Result<()> {
        self.inner
            .set_channel_permission(channel, guild, permission, value)
            .await
    }

    async fn channel_ids_with_permission(
        &self,
        guild: GuildId,
        permission: Permission,
    ) -> Result<Vec<ChannelId>> {
        self.inner.channel_ids_with_permission(guild, permission).await
    }

    async fn guild_channel_ids(&self, guild: GuildId) -> Result<Vec<ChannelId>> {
        self.inner.guild_channel_ids(guild).await
    }

    async fn delete_channel(&self, channel: ChannelId) -> Result<bool> {
        self.inner.delete_channel(channel).await
    }

    async fn get_membership(&self, user: UserId, guild: GuildId) -> Result<Option<Membership>> {
        self.inner.get_membership(user, guild).await
    }

    async fn set_registered(&self, user: UserId, guild: GuildId, value: bool) -> Result<()> {
        self.inner.set_registered(user, guild, value).await
    }

    async fn user_memberships(&self, user: UserId) -> Result<Vec<Membership>> {
        if self.failing_memberships.load(Ordering::SeqCst) {
            return Err(Error::Storage("membership index unavailable".to_string()));
        }
        self.inner.user_memberships(user).await
    }

    async fn mark_gone(&self, user: UserId, guild: GuildId, at: DateTime<Utc>) -> Result<bool> {
        self.inner.mark_gone(user, guild, at).await
    }

    async fn mark_present(&self, user: UserId, guild: GuildId) -> Result<bool> {
        self.inner.mark_present(user, guild).await
    }

    async fn ended_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Membership>> {
        self.inner.ended_before(cutoff).await
    }

    async fn delete_membership(&self, user: UserId, guild: GuildId) -> Result<usize> {
        self.inner.delete_membership(user, guild).await
    }

    async fn add_message(&self, message: Message) -> Result<bool> {
        self.inner.add_message(message).await
    }

    async fn messages_content(&self, user: UserId, guild: GuildId) -> Result<Vec<String>> {
        let pause = self
            .corpus_pause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(pause) = pause {
            pause.entered.notify_one();
            pause.release.notified().await;
        }
        self.inner.messages_content(user, guild).await
    }

    async fn get_antiavatar(&self, user: UserId, guild: GuildId) -> Result<Option<Antiavatar>> {
        self.inner.get_antiavatar(user, guild).await
    }

    async fn set_antiavatar(&self, antiavatar: Antiavatar) -> Result<()> {
        self.inner.set_antiavatar(antiavatar).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}
