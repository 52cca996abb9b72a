//! In-memory store with JSON snapshot persistence
//!
//! All rows live in hash maps behind a `tokio::sync::RwLock`. When opened
//! with a snapshot path, [`Store::flush`] writes the whole database to that
//! file (via a temporary file and rename) and [`MemoryStore::open`] reads it
//! back on startup.

use super::models::*;
use super::Store;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Database {
    users: HashMap<UserId, User>,
    guilds: HashMap<GuildId, Guild>,
    channels: HashMap<ChannelId, Channel>,
    memberships: HashMap<(UserId, GuildId), Membership>,
    messages: HashMap<MessageId, Message>,
    antiavatars: HashMap<(UserId, GuildId), Antiavatar>,
}

/// On-disk form of [`Database`]
#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    users: Vec<User>,
    guilds: Vec<Guild>,
    channels: Vec<Channel>,
    memberships: Vec<Membership>,
    messages: Vec<Message>,
    antiavatars: Vec<Antiavatar>,
}

impl Database {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            users: snapshot.users.into_iter().map(|u| (u.id, u)).collect(),
            guilds: snapshot.guilds.into_iter().map(|g| (g.id, g)).collect(),
            channels: snapshot.channels.into_iter().map(|c| (c.id, c)).collect(),
            memberships: snapshot
                .memberships
                .into_iter()
                .map(|m| (m.key(), m))
                .collect(),
            messages: snapshot.messages.into_iter().map(|m| (m.id, m)).collect(),
            antiavatars: snapshot
                .antiavatars
                .into_iter()
                .map(|a| ((a.user_id, a.guild_id), a))
                .collect(),
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            users: self.users.values().cloned().collect(),
            guilds: self.guilds.values().cloned().collect(),
            channels: self.channels.values().cloned().collect(),
            memberships: self.memberships.values().cloned().collect(),
            messages: self.messages.values().cloned().collect(),
            antiavatars: self.antiavatars.values().cloned().collect(),
        }
    }

    fn ensure_membership(&mut self, user: UserId, guild: GuildId) -> &mut Membership {
        self.users.entry(user).or_insert_with(|| User::new(user));
        self.guilds.entry(guild).or_insert_with(|| Guild::new(guild));
        self.memberships
            .entry((user, guild))
            .or_insert_with(|| Membership::new(user, guild))
    }

    fn cascade_membership(&mut self, user: UserId, guild: GuildId) -> bool {
        let existed = self.memberships.remove(&(user, guild)).is_some();
        self.antiavatars.remove(&(user, guild));
        self.messages
            .retain(|_, m| !(m.author_id == user && m.guild_id == guild));
        existed
    }

    fn cascade_channel(&mut self, channel: ChannelId) -> bool {
        let existed = self.channels.remove(&channel).is_some();
        self.messages.retain(|_, m| m.channel_id != channel);
        existed
    }

    fn memberships_of(&self, user: UserId) -> impl Iterator<Item = &Membership> {
        self.memberships.values().filter(move |m| m.user_id == user)
    }
}

/// In-memory [`Store`] implementation
pub struct MemoryStore {
    db: Arc<RwLock<Database>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Create an empty, purely in-memory store
    pub fn new() -> Self {
        Self {
            db: Arc::new(RwLock::new(Database::default())),
            snapshot_path: None,
        }
    }

    /// Open a store backed by a snapshot file, loading it if it exists
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let db = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read(&path).await?;
            let snapshot: Snapshot = serde_json::from_slice(&content)?;
            tracing::info!(
                path = %path.display(),
                users = snapshot.users.len(),
                messages = snapshot.messages.len(),
                "Loaded database snapshot"
            );
            Database::from_snapshot(snapshot)
        } else {
            Database::default()
        };

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            snapshot_path: Some(path),
        })
    }

    /// Snapshot file path, if any
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Number of stored messages
    pub async fn message_count(&self) -> usize {
        self.db.read().await.messages.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user_exists(&self, user: UserId) -> Result<bool> {
        Ok(self.db.read().await.users.contains_key(&user))
    }

    async fn wants_random_wawa(&self, user: UserId) -> Result<bool> {
        Ok(self
            .db
            .read()
            .await
            .users
            .get(&user)
            .map(|u| u.wants_random_wawa)
            .unwrap_or(false))
    }

    async fn toggle_random_wawa(&self, user: UserId) -> Result<bool> {
        let mut db = self.db.write().await;
        let row = db.users.entry(user).or_insert_with(|| User::new(user));
        row.wants_random_wawa = !row.wants_random_wawa;
        Ok(row.wants_random_wawa)
    }

    async fn export_user(&self, user: UserId) -> Result<Option<UserExport>> {
        let db = self.db.read().await;
        let Some(row) = db.users.get(&user) else {
            return Ok(None);
        };

        let memberships = db
            .memberships_of(user)
            .map(|membership| MembershipExport {
                membership: membership.clone(),
                antiavatar: db.antiavatars.get(&membership.key()).cloned(),
                messages: db
                    .messages
                    .values()
                    .filter(|m| m.author_id == user && m.guild_id == membership.guild_id)
                    .cloned()
                    .collect(),
            })
            .collect();

        Ok(Some(UserExport {
            user: row.clone(),
            memberships,
        }))
    }

    async fn delete_user(&self, user: UserId) -> Result<bool> {
        let mut db = self.db.write().await;
        let guilds: Vec<GuildId> = db.memberships_of(user).map(|m| m.guild_id).collect();
        for guild in guilds {
            db.cascade_membership(user, guild);
        }
        Ok(db.users.remove(&user).is_some())
    }

    async fn get_guild(&self, guild: GuildId) -> Result<Option<Guild>> {
        Ok(self.db.read().await.guilds.get(&guild).cloned())
    }

    async fn set_imitation_prefix(&self, guild: GuildId, prefix: Option<String>) -> Result<()> {
        let mut db = self.db.write().await;
        db.guilds
            .entry(guild)
            .or_insert_with(|| Guild::new(guild))
            .imitation_prefix = prefix;
        Ok(())
    }

    async fn set_imitation_suffix(&self, guild: GuildId, suffix: Option<String>) -> Result<()> {
        let mut db = self.db.write().await;
        db.guilds
            .entry(guild)
            .or_insert_with(|| Guild::new(guild))
            .imitation_suffix = suffix;
        Ok(())
    }

    async fn guild_memberships(&self, guild: GuildId) -> Result<Vec<Membership>> {
        Ok(self
            .db
            .read()
            .await
            .memberships
            .values()
            .filter(|m| m.guild_id == guild)
            .cloned()
            .collect())
    }

    async fn delete_guild(&self, guild: GuildId) -> Result<bool> {
        let mut db = self.db.write().await;
        let channels: Vec<ChannelId> = db
            .channels
            .values()
            .filter(|c| c.guild_id == guild)
            .map(|c| c.id)
            .collect();
        for channel in channels {
            db.cascade_channel(channel);
        }
        let users: Vec<UserId> = db
            .memberships
            .values()
            .filter(|m| m.guild_id == guild)
            .map(|m| m.user_id)
            .collect();
        for user in users {
            db.cascade_membership(user, guild);
        }
        db.messages.retain(|_, m| m.guild_id != guild);
        Ok(db.guilds.remove(&guild).is_some())
    }

    async fn set_channel_permission(
        &self,
        channel: ChannelId,
        guild: GuildId,
        permission: Permission,
        value: bool,
    ) -> Result<()> {
        let mut db = self.db.write().await;
        db.guilds.entry(guild).or_insert_with(|| Guild::new(guild));
        let row = db
            .channels
            .entry(channel)
            .or_insert_with(|| Channel::new(channel, guild));
        if row.guild_id != guild {
            return Err(Error::Storage(format!(
                "channel {} belongs to guild {}, not {}",
                channel, row.guild_id, guild
            )));
        }
        row.set(permission, value);
        Ok(())
    }

    async fn channel_ids_with_permission(
        &self,
        guild: GuildId,
        permission: Permission,
    ) -> Result<Vec<ChannelId>> {
        let db = self.db.read().await;
        let mut ids: Vec<ChannelId> = db
            .channels
            .values()
            .filter(|c| c.guild_id == guild && c.has(permission))
            .map(|c| c.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn guild_channel_ids(&self, guild: GuildId) -> Result<Vec<ChannelId>> {
        let db = self.db.read().await;
        let mut ids: Vec<ChannelId> = db
            .channels
            .values()
            .filter(|c| c.guild_id == guild)
            .map(|c| c.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_channel(&self, channel: ChannelId) -> Result<bool> {
        Ok(self.db.write().await.cascade_channel(channel))
    }

    async fn get_membership(&self, user: UserId, guild: GuildId) -> Result<Option<Membership>> {
        Ok(self.db.read().await.memberships.get(&(user, guild)).cloned())
    }

    async fn set_registered(&self, user: UserId, guild: GuildId, value: bool) -> Result<()> {
        self.db
            .write()
            .await
            .ensure_membership(user, guild)
            .is_registered = value;
        Ok(())
    }

    async fn user_memberships(&self, user: UserId) -> Result<Vec<Membership>> {
        Ok(self.db.read().await.memberships_of(user).cloned().collect())
    }

    async fn mark_gone(&self, user: UserId, guild: GuildId, at: DateTime<Utc>) -> Result<bool> {
        let mut db = self.db.write().await;
        match db.memberships.get_mut(&(user, guild)) {
            Some(membership) if membership.ended_since.is_none() => {
                membership.ended_since = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_present(&self, user: UserId, guild: GuildId) -> Result<bool> {
        let mut db = self.db.write().await;
        match db.memberships.get_mut(&(user, guild)) {
            Some(membership) if membership.ended_since.is_some() => {
                membership.ended_since = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ended_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Membership>> {
        Ok(self
            .db
            .read()
            .await
            .memberships
            .values()
            .filter(|m| matches!(m.ended_since, Some(t) if t < cutoff))
            .cloned()
            .collect())
    }

    async fn delete_membership(&self, user: UserId, guild: GuildId) -> Result<usize> {
        let mut db = self.db.write().await;
        db.cascade_membership(user, guild);
        Ok(db.memberships_of(user).count())
    }

    async fn add_message(&self, message: Message) -> Result<bool> {
        if message.content.trim().is_empty() {
            return Ok(false);
        }
        let mut db = self.db.write().await;
        if db.messages.contains_key(&message.id) {
            return Ok(false);
        }
        db.ensure_membership(message.author_id, message.guild_id);
        db.channels
            .entry(message.channel_id)
            .or_insert_with(|| Channel::new(message.channel_id, message.guild_id));
        db.messages.insert(message.id, message);
        Ok(true)
    }

    async fn messages_content(&self, user: UserId, guild: GuildId) -> Result<Vec<String>> {
        let db = self.db.read().await;
        let mut messages: Vec<&Message> = db
            .messages
            .values()
            .filter(|m| m.author_id == user && m.guild_id == guild)
            .collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages.into_iter().map(|m| m.content.clone()).collect())
    }

    async fn get_antiavatar(&self, user: UserId, guild: GuildId) -> Result<Option<Antiavatar>> {
        Ok(self.db.read().await.antiavatars.get(&(user, guild)).cloned())
    }

    async fn set_antiavatar(&self, antiavatar: Antiavatar) -> Result<()> {
        let mut db = self.db.write().await;
        db.ensure_membership(antiavatar.user_id, antiavatar.guild_id);
        db.antiavatars
            .insert((antiavatar.user_id, antiavatar.guild_id), antiavatar);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let content = {
            let db = self.db.read().await;
            serde_json::to_vec(&db.to_snapshot())?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, path).await?;

        tracing::debug!(path = %path.display(), bytes = content.len(), "Saved database snapshot");
        Ok(())
    }
}
