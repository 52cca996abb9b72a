//! Cascading deletion
//!
//! Forgetting a membership, a member or a whole guild touches three places:
//! the model cache, the avatar artifacts hosted on the platform, and the
//! stored rows. Every step runs even when an earlier one fails; failures are
//! collected and reported together as [`Error::DeletionIncomplete`]. Nothing
//! is rolled back.
//!
//! Cached models are invalidated both before and after the rows go, so a
//! model rebuilt while the avatars were being removed never outlives them.

use crate::db::{ChannelId, GuildId, Store, UserId};
use crate::error::{Error, Result};
use crate::markov::ModelCache;
use crate::platform::AvatarStore;
use futures::future::join_all;
use std::sync::Arc;

/// Removes everything learned about members and guilds
pub struct DeletionCoordinator {
    store: Arc<dyn Store>,
    cache: Arc<ModelCache>,
    avatars: Arc<dyn AvatarStore>,
}

impl DeletionCoordinator {
    pub fn new(store: Arc<dyn Store>, cache: Arc<ModelCache>, avatars: Arc<dyn AvatarStore>) -> Self {
        Self {
            store,
            cache,
            avatars,
        }
    }

    /// Forget a user in one guild. When it was their last membership the
    /// user is forgotten entirely.
    pub async fn delete_membership(&self, user: UserId, guild: GuildId) -> Result<()> {
        let mut failures = Vec::new();

        self.cache.invalidate(user, guild);
        if let Err(e) = self.delete_antiavatar(user, guild).await {
            failures.push(e);
        }

        match self.store.delete_membership(user, guild).await {
            Ok(remaining) => {
                // A model may have been rebuilt while the avatar was removed
                self.cache.invalidate(user, guild);
                if remaining == 0 {
                    if let Err(e) = self.delete_member(user).await {
                        collect(&mut failures, e);
                    }
                } else {
                    tracing::debug!(user = %user, remaining, "User still has memberships");
                }
            }
            Err(e) => failures.push(format!(
                "membership of user {} in guild {}: {}",
                user, guild, e
            )),
        }

        tracing::info!(user = %user, guild = %guild, failed = failures.len(), "Deleted membership");
        finish(failures)
    }

    /// Forget a user everywhere. When their memberships can't be listed the
    /// avatars can't be found either, so nothing is deleted.
    pub async fn delete_member(&self, user: UserId) -> Result<()> {
        let memberships = match self.store.user_memberships(user).await {
            Ok(memberships) => memberships,
            Err(e) => {
                return finish(vec![format!("memberships of user {}: {}", user, e)]);
            }
        };

        self.cache.invalidate_user(user);
        let branches = memberships.iter().map(|membership| {
            self.delete_antiavatar(membership.user_id, membership.guild_id)
        });
        let mut failures: Vec<String> = join_all(branches)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect();

        match self.store.delete_user(user).await {
            Ok(_) => {
                self.cache.invalidate_user(user);
            }
            Err(e) => failures.push(format!("user {}: {}", user, e)),
        }

        tracing::info!(
            user = %user,
            memberships = memberships.len(),
            failed = failures.len(),
            "Deleted member"
        );
        finish(failures)
    }

    /// Forget a guild: every membership in it, its channels and the guild row
    pub async fn delete_community(&self, guild: GuildId) -> Result<()> {
        let mut failures = Vec::new();

        let memberships = match self.store.guild_memberships(guild).await {
            Ok(memberships) => memberships,
            Err(e) => {
                failures.push(format!("memberships of guild {}: {}", guild, e));
                Vec::new()
            }
        };
        let results = join_all(
            memberships
                .iter()
                .map(|membership| self.delete_membership(membership.user_id, guild)),
        )
        .await;
        for result in results {
            if let Err(e) = result {
                collect(&mut failures, e);
            }
        }

        match self.store.guild_channel_ids(guild).await {
            Ok(channels) => {
                for channel in channels {
                    if let Err(e) = self.store.delete_channel(channel).await {
                        failures.push(format!("channel {}: {}", channel, e));
                    }
                }
            }
            Err(e) => failures.push(format!("channels of guild {}: {}", guild, e)),
        }

        if let Err(e) = self.store.delete_guild(guild).await {
            failures.push(format!("guild {}: {}", guild, e));
        }

        tracing::info!(
            guild = %guild,
            memberships = memberships.len(),
            failed = failures.len(),
            "Deleted guild"
        );
        finish(failures)
    }

    /// Forget a channel and the messages learned from it
    pub async fn delete_channel(&self, channel: ChannelId) -> Result<bool> {
        let deleted = self.store.delete_channel(channel).await?;
        if deleted {
            tracing::info!(channel = %channel, "Deleted channel");
        }
        Ok(deleted)
    }

    /// Remove the hosted avatar image, if the membership has one. The row
    /// itself goes with the membership.
    async fn delete_antiavatar(&self, user: UserId, guild: GuildId) -> std::result::Result<(), String> {
        let antiavatar = self
            .store
            .get_antiavatar(user, guild)
            .await
            .map_err(|e| format!("antiavatar of user {} in guild {}: {}", user, guild, e))?;

        if let Some(antiavatar) = antiavatar {
            self.avatars
                .delete_antiavatar(&antiavatar)
                .await
                .map_err(|e| format!("antiavatar of user {} in guild {}: {}", user, guild, e))?;
        }
        Ok(())
    }
}

fn collect(failures: &mut Vec<String>, error: Error) {
    match error {
        Error::DeletionIncomplete { failures: nested } => failures.extend(nested),
        other => failures.push(other.to_string()),
    }
}

fn finish(failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    for failure in &failures {
        tracing::warn!(failure = %failure, "Deletion step failed");
    }
    Err(Error::DeletionIncomplete { failures })
}
