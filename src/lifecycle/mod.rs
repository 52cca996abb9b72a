//! Membership lifecycle
//!
//! A membership is either active or departed since some time. Departures are
//! stamped once, on the edge; rejoining clears the stamp. A periodic sweep
//! forgets memberships that stayed departed past the retention period, but
//! only after the platform confirms the member is really gone.

use crate::db::{ChannelId, GuildId, Membership, Store, UserId};
use crate::error::{Error, Result};
use crate::forget::DeletionCoordinator;
use crate::platform::{Platform, Presence};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Membership-relevant events from the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    MemberRemoved { guild: GuildId, user: UserId },
    MemberJoined { guild: GuildId, user: UserId },
    /// The bot was removed from the guild, or the guild was deleted
    GuildRemoved { guild: GuildId },
    ChannelDeleted { channel: ChannelId },
}

/// Outcome of one retention sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Memberships examined
    pub candidates: usize,
    /// Confirmed absent and forgotten
    pub deleted: usize,
    /// Found present again and restored
    pub restored: usize,
    /// Presence could not be checked; left departed
    pub unconfirmed: usize,
    /// Deletion started but did not complete
    pub failed: usize,
}

/// Tracks departures and forgets members once retention runs out
pub struct MembershipLifecycle {
    store: Arc<dyn Store>,
    platform: Arc<dyn Platform>,
    forget: Arc<DeletionCoordinator>,
    retention: Duration,
}

impl MembershipLifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        platform: Arc<dyn Platform>,
        forget: Arc<DeletionCoordinator>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            platform,
            forget,
            retention,
        }
    }

    /// The member left the guild. Only the first signal after being active
    /// starts the clock.
    pub async fn member_removed(&self, guild: GuildId, user: UserId, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.store.mark_gone(user, guild, now).await?;
        if changed {
            tracing::info!(guild = %guild, user = %user, "Member departed");
        }
        Ok(changed)
    }

    /// The member is in the guild (again)
    pub async fn member_present(&self, guild: GuildId, user: UserId) -> Result<bool> {
        let changed = self.store.mark_present(user, guild).await?;
        if changed {
            tracing::info!(guild = %guild, user = %user, "Member returned");
        }
        Ok(changed)
    }

    /// Forget every membership departed for longer than the retention period
    /// whose absence the platform confirms. Candidates are handled one at a
    /// time and a failure with one never stops the sweep.
    pub async fn prune_expired_memberships(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        let candidates = self.store.ended_before(now - self.retention).await?;
        let mut report = PruneReport {
            candidates: candidates.len(),
            ..PruneReport::default()
        };

        for membership in candidates {
            match self.prune_one(&membership).await {
                Ok(Presence::Absent) => report.deleted += 1,
                Ok(Presence::Present) => report.restored += 1,
                Err(Error::AbsenceUnconfirmed { .. }) => report.unconfirmed += 1,
                Err(e) => {
                    tracing::warn!(
                        guild = %membership.guild_id,
                        user = %membership.user_id,
                        error = %e,
                        "Failed to forget expired membership"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            candidates = report.candidates,
            deleted = report.deleted,
            restored = report.restored,
            unconfirmed = report.unconfirmed,
            failed = report.failed,
            "Pruned expired memberships"
        );
        Ok(report)
    }

    async fn prune_one(&self, membership: &Membership) -> Result<Presence> {
        let (user, guild) = membership.key();

        let presence = match self.platform.member_presence(guild, user).await {
            Ok(presence) => presence,
            Err(e) => {
                tracing::warn!(
                    guild = %guild,
                    user = %user,
                    error = %e,
                    "Could not confirm absence, keeping membership"
                );
                return Err(Error::AbsenceUnconfirmed {
                    guild: guild.0,
                    user: user.0,
                    reason: e.to_string(),
                });
            }
        };

        match presence {
            Presence::Present => {
                self.store.mark_present(user, guild).await?;
                tracing::info!(guild = %guild, user = %user, "Member still present, restored");
            }
            Presence::Absent => {
                self.forget.delete_membership(user, guild).await?;
            }
        }
        Ok(presence)
    }

    /// Apply a platform event
    pub async fn handle_event(&self, event: PlatformEvent, now: DateTime<Utc>) -> Result<()> {
        tracing::debug!(?event, "Handling platform event");
        match event {
            PlatformEvent::MemberRemoved { guild, user } => {
                self.member_removed(guild, user, now).await?;
            }
            PlatformEvent::MemberJoined { guild, user } => {
                self.member_present(guild, user).await?;
            }
            PlatformEvent::GuildRemoved { guild } => {
                self.forget.delete_community(guild).await?;
            }
            PlatformEvent::ChannelDeleted { channel } => {
                self.forget.delete_channel(channel).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarkovConfig;
    use crate::db::{MemoryStore, Message, MessageId};
    use crate::markov::ModelCache;
    use crate::platform::{MockPlatform, MockPresence};

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const GUILD: GuildId = GuildId(10);
    const OTHER_GUILD: GuildId = GuildId(20);

    struct Fixture {
        store: Arc<MemoryStore>,
        platform: Arc<MockPlatform>,
        cache: Arc<ModelCache>,
        lifecycle: MembershipLifecycle,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let platform = Arc::new(MockPlatform::new());
        let cache = Arc::new(ModelCache::from_config(
            store.clone(),
            MarkovConfig {
                seed: Some(9),
                ..MarkovConfig::default()
            },
        ));
        let forget = Arc::new(DeletionCoordinator::new(
            store.clone(),
            cache.clone(),
            platform.clone(),
        ));
        let lifecycle =
            MembershipLifecycle::new(store.clone(), platform.clone(), forget, Duration::days(30));
        Fixture {
            store,
            platform,
            cache,
            lifecycle,
        }
    }

    async fn member_with_messages(store: &MemoryStore, user: UserId, guild: GuildId) {
        store.set_registered(user, guild, true).await.unwrap();
        for i in 0..3 {
            store
                .add_message(Message {
                    id: MessageId(user.0 * 1000 + guild.0 * 10 + i),
                    content: format!("words from {} number {}", user, i),
                    author_id: user,
                    channel_id: ChannelId(guild.0 + 1),
                    guild_id: guild,
                })
                .await
                .unwrap();
        }
    }

    async fn ended_since(store: &MemoryStore, user: UserId, guild: GuildId) -> Option<DateTime<Utc>> {
        store
            .get_membership(user, guild)
            .await
            .unwrap()
            .and_then(|m| m.ended_since)
    }

    #[tokio::test]
    async fn test_departure_stamped_once() {
        let f = fixture();
        member_with_messages(&f.store, ALICE, GUILD).await;
        let first = Utc::now() - Duration::days(2);

        assert!(f.lifecycle.member_removed(GUILD, ALICE, first).await.unwrap());
        assert!(!f.lifecycle.member_removed(GUILD, ALICE, Utc::now()).await.unwrap());
        assert_eq!(ended_since(&f.store, ALICE, GUILD).await, Some(first));
    }

    #[tokio::test]
    async fn test_depart_and_rejoin_within_retention() {
        let f = fixture();
        member_with_messages(&f.store, ALICE, GUILD).await;
        let now = Utc::now();

        f.lifecycle
            .member_removed(GUILD, ALICE, now - Duration::days(5))
            .await
            .unwrap();
        assert!(f.lifecycle.member_present(GUILD, ALICE).await.unwrap());
        assert_eq!(ended_since(&f.store, ALICE, GUILD).await, None);

        let report = f.lifecycle.prune_expired_memberships(now).await.unwrap();
        assert_eq!(report, PruneReport::default());
        assert_eq!(f.store.messages_content(ALICE, GUILD).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_not_yet_expired_is_kept() {
        let f = fixture();
        member_with_messages(&f.store, ALICE, GUILD).await;
        let now = Utc::now();
        f.lifecycle
            .member_removed(GUILD, ALICE, now - Duration::days(29))
            .await
            .unwrap();

        let report = f.lifecycle.prune_expired_memberships(now).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(f.platform.presence_lookups(), 0);
    }

    #[tokio::test]
    async fn test_expired_and_confirmed_absent_is_forgotten() {
        let f = fixture();
        member_with_messages(&f.store, ALICE, GUILD).await;
        member_with_messages(&f.store, ALICE, OTHER_GUILD).await;
        f.cache.get_or_build(ALICE, GUILD).await.unwrap();
        f.platform.set_presence(GUILD, ALICE, MockPresence::Absent);
        let now = Utc::now();
        f.lifecycle
            .member_removed(GUILD, ALICE, now - Duration::days(31))
            .await
            .unwrap();

        let report = f.lifecycle.prune_expired_memberships(now).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert!(!f.cache.contains(ALICE, GUILD));
        assert!(f.store.get_membership(ALICE, GUILD).await.unwrap().is_none());
        assert!(f.store.messages_content(ALICE, GUILD).await.unwrap().is_empty());
        assert_eq!(f.store.messages_content(ALICE, OTHER_GUILD).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_expired_but_present_is_restored() {
        let f = fixture();
        member_with_messages(&f.store, ALICE, GUILD).await;
        f.platform.set_presence(GUILD, ALICE, MockPresence::Present);
        let now = Utc::now();
        f.lifecycle
            .member_removed(GUILD, ALICE, now - Duration::days(45))
            .await
            .unwrap();

        let report = f.lifecycle.prune_expired_memberships(now).await.unwrap();

        assert_eq!(report.restored, 1);
        assert_eq!(ended_since(&f.store, ALICE, GUILD).await, None);
        assert_eq!(f.store.messages_content(ALICE, GUILD).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unconfirmed_absence_is_not_deleted() {
        let f = fixture();
        member_with_messages(&f.store, ALICE, GUILD).await;
        member_with_messages(&f.store, BOB, GUILD).await;
        f.platform.set_presence(GUILD, ALICE, MockPresence::Unavailable);
        f.platform.set_presence(GUILD, BOB, MockPresence::Absent);
        let now = Utc::now();
        let departed = now - Duration::days(60);
        f.lifecycle.member_removed(GUILD, ALICE, departed).await.unwrap();
        f.lifecycle.member_removed(GUILD, BOB, departed).await.unwrap();

        let report = f.lifecycle.prune_expired_memberships(now).await.unwrap();

        assert_eq!(report.candidates, 2);
        assert_eq!(report.unconfirmed, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(ended_since(&f.store, ALICE, GUILD).await, Some(departed));
        assert!(!f.store.user_exists(BOB).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_deletion_counted() {
        let f = fixture();
        member_with_messages(&f.store, ALICE, GUILD).await;
        f.store
            .set_antiavatar(crate::db::Antiavatar {
                user_id: ALICE,
                guild_id: GUILD,
                original_url: String::new(),
                url: String::new(),
                message_id: MessageId(77),
            })
            .await
            .unwrap();
        f.platform.fail_avatar_deletion(ALICE, GUILD);
        let now = Utc::now();
        f.lifecycle
            .member_removed(GUILD, ALICE, now - Duration::days(31))
            .await
            .unwrap();

        let report = f.lifecycle.prune_expired_memberships(now).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.deleted, 0);
        // Rows are still removed
        assert!(f.store.get_membership(ALICE, GUILD).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handle_events() {
        let f = fixture();
        member_with_messages(&f.store, ALICE, GUILD).await;
        member_with_messages(&f.store, BOB, OTHER_GUILD).await;
        let now = Utc::now();

        f.lifecycle
            .handle_event(PlatformEvent::MemberRemoved { guild: GUILD, user: ALICE }, now)
            .await
            .unwrap();
        assert_eq!(ended_since(&f.store, ALICE, GUILD).await, Some(now));

        f.lifecycle
            .handle_event(PlatformEvent::MemberJoined { guild: GUILD, user: ALICE }, now)
            .await
            .unwrap();
        assert_eq!(ended_since(&f.store, ALICE, GUILD).await, None);

        f.lifecycle
            .handle_event(
                PlatformEvent::ChannelDeleted {
                    channel: ChannelId(GUILD.0 + 1),
                },
                now,
            )
            .await
            .unwrap();
        assert!(f.store.messages_content(ALICE, GUILD).await.unwrap().is_empty());

        f.lifecycle
            .handle_event(PlatformEvent::GuildRemoved { guild: OTHER_GUILD }, now)
            .await
            .unwrap();
        assert!(!f.store.user_exists(BOB).await.unwrap());
        assert!(f.store.user_exists(ALICE).await.unwrap());
    }
}
