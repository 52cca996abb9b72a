//! Persistent row types
//!
//! These mirror the Discord entities Parrot keeps a local copy of, plus the
//! Parrot-specific state attached to them. Row IDs are the Discord snowflakes
//! of the corresponding entities.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds between the Unix epoch and the Discord epoch (2015-01-01)
pub const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

snowflake_id!(
    /// A Discord user (a "member" across guilds)
    UserId
);
snowflake_id!(
    /// A Discord guild (a "community")
    GuildId
);
snowflake_id!(ChannelId);
snowflake_id!(MessageId);

/// Smallest snowflake that could have been generated at `time`
pub fn time_snowflake(time: DateTime<Utc>) -> u64 {
    let ms = time.timestamp_millis() - DISCORD_EPOCH_MS;
    (ms.max(0) as u64) << 22
}

/// Creation time encoded in a snowflake
pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    let ms = (id >> 22) as i64 + DISCORD_EPOCH_MS;
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}

/// Channel capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Parrot may post imitations here
    CanSpeakHere,
    /// Parrot may learn from messages posted here
    CanLearnHere,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub wants_random_wawa: bool,
}

impl User {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            wants_random_wawa: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guild {
    pub id: GuildId,
    /// Overrides `imitation.default_prefix` when set
    pub imitation_prefix: Option<String>,
    /// Overrides `imitation.default_suffix` when set
    pub imitation_suffix: Option<String>,
}

impl Guild {
    pub fn new(id: GuildId) -> Self {
        Self {
            id,
            imitation_prefix: None,
            imitation_suffix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub can_speak_here: bool,
    pub can_learn_here: bool,
    pub webhook_id: Option<u64>,
}

impl Channel {
    pub fn new(id: ChannelId, guild_id: GuildId) -> Self {
        Self {
            id,
            guild_id,
            can_speak_here: false,
            can_learn_here: false,
            webhook_id: None,
        }
    }

    pub fn has(&self, permission: Permission) -> bool {
        match permission {
            Permission::CanSpeakHere => self.can_speak_here,
            Permission::CanLearnHere => self.can_learn_here,
        }
    }

    pub fn set(&mut self, permission: Permission, value: bool) {
        match permission {
            Permission::CanSpeakHere => self.can_speak_here = value,
            Permission::CanLearnHere => self.can_learn_here = value,
        }
    }
}

/// User-Guild relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub is_registered: bool,
    /// When the user left the guild. `None` while they are still there.
    pub ended_since: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn new(user_id: UserId, guild_id: GuildId) -> Self {
        Self {
            user_id,
            guild_id,
            is_registered: false,
            ended_since: None,
        }
    }

    pub fn key(&self) -> (UserId, GuildId) {
        (self.user_id, self.guild_id)
    }

    pub fn is_active(&self) -> bool {
        self.ended_since.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub author_id: UserId,
    pub channel_id: ChannelId,
    pub guild_id: GuildId,
}

/// Derived avatar hosted as an attachment in the avatar store channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Antiavatar {
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub original_url: String,
    pub url: String,
    /// Message in the avatar store channel carrying the image
    pub message_id: MessageId,
}

/// Everything Parrot knows about one user, for "download my data"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserExport {
    pub user: User,
    pub memberships: Vec<MembershipExport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipExport {
    pub membership: Membership,
    pub antiavatar: Option<Antiavatar>,
    pub messages: Vec<Message>,
}
