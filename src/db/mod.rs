//! Persistence layer
//!
//! Parrot treats storage as a collaborator behind the [`Store`] trait. Every
//! call is atomic on its own; durability timing (e.g. periodic snapshots) is
//! up to the implementation.

#[cfg(test)]
mod faulty;
mod memory;
pub mod models;

#[cfg(test)]
pub use faulty::FaultyStore;
pub use memory::MemoryStore;
pub use models::{
    Antiavatar, Channel, ChannelId, Guild, GuildId, Membership, MembershipExport, Message,
    MessageId, Permission, User, UserExport, UserId, snowflake_time, time_snowflake,
};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Row storage with declared cascades
///
/// Cascades:
/// - deleting a user deletes their memberships
/// - deleting a membership deletes its messages and antiavatar
/// - deleting a channel deletes its messages
/// - deleting a guild deletes its channels and memberships
#[async_trait]
pub trait Store: Send + Sync {
    // Users

    async fn user_exists(&self, user: UserId) -> Result<bool>;

    async fn wants_random_wawa(&self, user: UserId) -> Result<bool>;

    /// Flip the preference flag, creating the user if needed. Returns the new value.
    async fn toggle_random_wawa(&self, user: UserId) -> Result<bool>;

    async fn export_user(&self, user: UserId) -> Result<Option<UserExport>>;

    /// Delete a user and everything they own. Returns whether the user existed.
    async fn delete_user(&self, user: UserId) -> Result<bool>;

    // Guilds

    async fn get_guild(&self, guild: GuildId) -> Result<Option<Guild>>;

    async fn set_imitation_prefix(&self, guild: GuildId, prefix: Option<String>) -> Result<()>;

    async fn set_imitation_suffix(&self, guild: GuildId, suffix: Option<String>) -> Result<()>;

    async fn guild_memberships(&self, guild: GuildId) -> Result<Vec<Membership>>;

    /// Delete the guild row. Callers are expected to have cleared its
    /// channels and memberships first; any left over cascade here.
    async fn delete_guild(&self, guild: GuildId) -> Result<bool>;

    // Channels

    async fn set_channel_permission(
        &self,
        channel: ChannelId,
        guild: GuildId,
        permission: Permission,
        value: bool,
    ) -> Result<()>;

    async fn channel_ids_with_permission(
        &self,
        guild: GuildId,
        permission: Permission,
    ) -> Result<Vec<ChannelId>>;

    async fn guild_channel_ids(&self, guild: GuildId) -> Result<Vec<ChannelId>>;

    async fn delete_channel(&self, channel: ChannelId) -> Result<bool>;

    // Memberships

    async fn get_membership(&self, user: UserId, guild: GuildId) -> Result<Option<Membership>>;

    /// Set the opt-in flag, creating user, guild and membership rows as needed
    async fn set_registered(&self, user: UserId, guild: GuildId, value: bool) -> Result<()>;

    async fn user_memberships(&self, user: UserId) -> Result<Vec<Membership>>;

    /// Record that the user left at `at`. Only stamps a membership that is
    /// currently active; returns whether a transition happened.
    async fn mark_gone(&self, user: UserId, guild: GuildId, at: DateTime<Utc>) -> Result<bool>;

    /// Clear `ended_since`. Returns whether a transition happened.
    async fn mark_present(&self, user: UserId, guild: GuildId) -> Result<bool>;

    /// Memberships that ended strictly before `cutoff`
    async fn ended_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Membership>>;

    /// Delete a membership with its messages and antiavatar row. Returns how
    /// many memberships the user has left.
    async fn delete_membership(&self, user: UserId, guild: GuildId) -> Result<usize>;

    // Messages

    /// Store a message, creating the owning rows as needed. Returns `false`
    /// for duplicates and messages with no text.
    async fn add_message(&self, message: Message) -> Result<bool>;

    async fn messages_content(&self, user: UserId, guild: GuildId) -> Result<Vec<String>>;

    // Antiavatars

    async fn get_antiavatar(&self, user: UserId, guild: GuildId) -> Result<Option<Antiavatar>>;

    async fn set_antiavatar(&self, antiavatar: Antiavatar) -> Result<()>;

    // Durability

    /// Commit pending writes
    async fn flush(&self) -> Result<()>;
}
