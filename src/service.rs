//! Process-wide Parrot state
//!
//! [`Parrot`] wires the store, the platform, the model cache and the
//! coordinators together and is the surface the bot commands and the binary
//! talk to.

use crate::config::ParrotConfig;
use crate::db::{GuildId, Store, UserExport, UserId};
use crate::error::{Error, Result};
use crate::forget::DeletionCoordinator;
use crate::lifecycle::{MembershipLifecycle, PlatformEvent, PruneReport};
use crate::markov::{Gibberish, MarkovModel, ModelCache};
use crate::platform::{AvatarStore, Platform};
use crate::scan::{ProgressReporter, ScanCoordinator, ScanRequest, ScanSummary};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Generated text plus the decoration for the imitated member's name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Imitation {
    pub user: UserId,
    pub guild: GuildId,
    pub text: String,
    pub prefix: String,
    pub suffix: String,
}

impl Imitation {
    /// Name to post the imitation under, e.g. "[i] alice"
    pub fn display_name(&self, name: &str) -> String {
        format!("{} {}{}", self.prefix, name, self.suffix)
            .trim()
            .to_string()
    }
}

/// The Parrot core
pub struct Parrot {
    config: ParrotConfig,
    store: Arc<dyn Store>,
    cache: Arc<ModelCache>,
    scans: ScanCoordinator,
    forget: Arc<DeletionCoordinator>,
    lifecycle: MembershipLifecycle,
    rng: Arc<Mutex<StdRng>>,
}

impl Parrot {
    pub fn new(
        config: ParrotConfig,
        store: Arc<dyn Store>,
        platform: Arc<dyn Platform>,
        avatars: Arc<dyn AvatarStore>,
    ) -> Self {
        let rng = Arc::new(Mutex::new(match config.markov.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }));
        let cache = Arc::new(ModelCache::new(
            store.clone(),
            config.markov.clone(),
            rng.clone(),
        ));
        let scans = ScanCoordinator::new(
            store.clone(),
            platform.clone(),
            config.scan.clone(),
            &config.discord.command_prefix,
        );
        let forget = Arc::new(DeletionCoordinator::new(
            store.clone(),
            cache.clone(),
            avatars,
        ));
        let lifecycle = MembershipLifecycle::new(
            store.clone(),
            platform,
            forget.clone(),
            config.retention.period(),
        );

        Self {
            config,
            store,
            cache,
            scans,
            forget,
            lifecycle,
            rng,
        }
    }

    pub fn config(&self) -> &ParrotConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    // Scans

    pub async fn start_scan(
        &self,
        request: ScanRequest,
        reporter: &dyn ProgressReporter,
    ) -> Result<ScanSummary> {
        self.scans.start_scan(request, reporter).await
    }

    pub fn stop_scan(&self, guild: GuildId, user: UserId) -> bool {
        self.scans.stop_scan(guild, user)
    }

    pub fn is_scanning(&self, guild: GuildId, user: UserId) -> bool {
        self.scans.is_scanning(guild, user)
    }

    // Models

    /// Model for a member in a guild. Members must be registered there; bots
    /// always count as registered.
    pub async fn get_or_build_model(
        &self,
        user: UserId,
        guild: GuildId,
        is_bot: bool,
    ) -> Result<Arc<MarkovModel>> {
        if !is_bot && !self.is_registered(user, guild).await? {
            return Err(Error::NotRegistered {
                guild: guild.0,
                user: user.0,
            });
        }
        self.cache.get_or_build(user, guild).await
    }

    /// Generate a sentence in the member's style, with the guild's name
    /// decoration
    pub async fn imitate(&self, user: UserId, guild: GuildId, is_bot: bool) -> Result<Imitation> {
        let model = self.get_or_build_model(user, guild, is_bot).await?;

        let generated = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            let text = model.generate(
                &mut *rng,
                self.config.markov.max_words,
                self.config.markov.max_attempts,
            );
            text
        };
        let text =
            generated.ok_or_else(|| Error::BuildFailure("model produced no text".to_string()))?;

        let guild_row = self.store.get_guild(guild).await?;
        let defaults = &self.config.imitation;
        let prefix = guild_row
            .as_ref()
            .and_then(|g| g.imitation_prefix.clone())
            .unwrap_or_else(|| defaults.default_prefix.clone());
        let suffix = guild_row
            .and_then(|g| g.imitation_suffix)
            .unwrap_or_else(|| defaults.default_suffix.clone());

        Ok(Imitation {
            user,
            guild,
            text,
            prefix,
            suffix,
        })
    }

    /// Scramble a piece of text character by character
    pub async fn imitate_gibberish(&self, text: &str) -> Result<String> {
        let seed: u64 = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen()
        };
        let min = self.config.markov.min_state_size;
        let max = self.config.markov.max_state_size.max(min);
        let max_attempts = self.config.markov.max_attempts;
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let state_size = rng.gen_range(min..=max);
            Gibberish::new(&text, state_size).map(|g| g.generate(&mut rng, max_attempts))
        })
        .await
        .map_err(|e| Error::BuildFailure(format!("gibberish task failed: {}", e)))?
    }

    // Preferences and registration

    /// Flip whether the member wants to be imitated at random. Returns the
    /// new value.
    pub async fn toggle_preference(&self, user: UserId) -> Result<bool> {
        let value = self.store.toggle_random_wawa(user).await?;
        tracing::info!(user = %user, wants_random_wawa = value, "Toggled preference");
        Ok(value)
    }

    pub async fn is_registered(&self, user: UserId, guild: GuildId) -> Result<bool> {
        Ok(self
            .store
            .get_membership(user, guild)
            .await?
            .map(|m| m.is_registered)
            .unwrap_or(false))
    }

    pub async fn set_registered(&self, user: UserId, guild: GuildId, value: bool) -> Result<()> {
        self.store.set_registered(user, guild, value).await?;
        tracing::info!(user = %user, guild = %guild, registered = value, "Updated registration");
        Ok(())
    }

    /// Set or clear (back to the configured default) a guild's name prefix
    pub async fn set_imitation_prefix(&self, guild: GuildId, prefix: Option<String>) -> Result<()> {
        self.store.set_imitation_prefix(guild, prefix).await
    }

    pub async fn set_imitation_suffix(&self, guild: GuildId, suffix: Option<String>) -> Result<()> {
        self.store.set_imitation_suffix(guild, suffix).await
    }

    // Deletion

    pub async fn delete_membership(&self, user: UserId, guild: GuildId) -> Result<()> {
        self.forget.delete_membership(user, guild).await
    }

    pub async fn delete_member(&self, user: UserId) -> Result<()> {
        self.forget.delete_member(user).await
    }

    pub async fn delete_community(&self, guild: GuildId) -> Result<()> {
        self.forget.delete_community(guild).await
    }

    pub async fn delete_channel(&self, channel: crate::db::ChannelId) -> Result<bool> {
        self.forget.delete_channel(channel).await
    }

    // Lifecycle

    pub async fn prune_expired_memberships(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        self.lifecycle.prune_expired_memberships(now).await
    }

    pub async fn handle_event(&self, event: PlatformEvent, now: DateTime<Utc>) -> Result<()> {
        self.lifecycle.handle_event(event, now).await
    }

    /// Everything stored about a user, for "download my data"
    pub async fn export_user_data(&self, user: UserId) -> Result<Option<UserExport>> {
        self.store.export_user(user).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    /// Run the retention sweep and the periodic snapshot until `token` is
    /// cancelled. Storage is flushed once more on the way out.
    pub fn spawn_maintenance(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let prune_every = Duration::from_secs(self.config.maintenance.prune_interval_secs.max(1));
        let save_every = Duration::from_secs(self.config.storage.autosave_interval_secs.max(1));

        tokio::spawn(async move {
            let mut prune = tokio::time::interval(prune_every);
            let mut save = tokio::time::interval(save_every);
            // The first tick of an interval completes immediately
            save.tick().await;

            tracing::info!(
                prune_every_secs = prune_every.as_secs(),
                save_every_secs = save_every.as_secs(),
                "Maintenance started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = prune.tick() => {
                        if let Err(e) = self.prune_expired_memberships(Utc::now()).await {
                            tracing::error!(error = %e, "Retention sweep failed");
                        }
                    }
                    _ = save.tick() => {
                        if let Err(e) = self.flush().await {
                            tracing::error!(error = %e, "Failed to save database");
                        }
                    }
                }
            }

            if let Err(e) = self.flush().await {
                tracing::error!(error = %e, "Failed to save database on shutdown");
            }
            tracing::info!(
                models = self.cache.len(),
                model_bytes = self.cache.approx_size(),
                "Maintenance stopped"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChannelId, MemoryStore, Permission};
    use crate::platform::{MockPlatform, MockPresence};
    use crate::scan::LogReporter;
    use chrono::Duration as ChronoDuration;

    const ALICE: UserId = UserId(1);
    const BOT: UserId = UserId(2);
    const GUILD: GuildId = GuildId(10);
    const CHANNEL: ChannelId = ChannelId(11);

    async fn parrot_with(platform: MockPlatform) -> (Arc<Parrot>, Arc<MemoryStore>, Arc<MockPlatform>) {
        let store = Arc::new(MemoryStore::new());
        let platform = Arc::new(platform);
        let mut config = ParrotConfig::default();
        config.markov.seed = Some(21);

        store
            .set_channel_permission(CHANNEL, GUILD, Permission::CanLearnHere, true)
            .await
            .unwrap();

        let parrot = Arc::new(Parrot::new(
            config,
            store.clone(),
            platform.clone(),
            platform.clone(),
        ));
        (parrot, store, platform)
    }

    fn three_messages(platform: &MockPlatform, user: UserId) {
        platform.push_message(GUILD, CHANNEL, 1, user, "parrots are great birds");
        platform.push_message(GUILD, CHANNEL, 2, user, "birds are great at talking");
        platform.push_message(GUILD, CHANNEL, 3, user, "talking parrots are the best");
    }

    #[tokio::test]
    async fn test_scan_build_forget_end_to_end() {
        let platform = MockPlatform::new();
        three_messages(&platform, ALICE);
        let (parrot, _store, _platform) = parrot_with(platform).await;
        parrot.set_registered(ALICE, GUILD, true).await.unwrap();

        let summary = parrot
            .start_scan(ScanRequest::for_self(GUILD, ALICE), &LogReporter)
            .await
            .unwrap();
        assert_eq!(summary.collected, 3);

        let model = parrot.get_or_build_model(ALICE, GUILD, false).await.unwrap();
        let again = parrot.get_or_build_model(ALICE, GUILD, false).await.unwrap();
        assert!(Arc::ptr_eq(&model, &again));

        parrot.delete_membership(ALICE, GUILD).await.unwrap();

        let result = parrot.get_or_build_model(ALICE, GUILD, false).await;
        assert!(matches!(result, Err(Error::NotRegistered { .. })));

        // Registering again starts from nothing
        parrot.set_registered(ALICE, GUILD, true).await.unwrap();
        let result = parrot.get_or_build_model(ALICE, GUILD, false).await;
        assert!(matches!(result, Err(Error::NoData { .. })));
    }

    #[tokio::test]
    async fn test_unregistered_member_is_not_modeled() {
        let platform = MockPlatform::new();
        let (parrot, store, _platform) = parrot_with(platform).await;
        store
            .add_message(crate::db::Message {
                id: crate::db::MessageId(1),
                content: "hello".to_string(),
                author_id: ALICE,
                channel_id: CHANNEL,
                guild_id: GUILD,
            })
            .await
            .unwrap();

        let result = parrot.get_or_build_model(ALICE, GUILD, false).await;
        assert!(matches!(result, Err(Error::NotRegistered { .. })));
        assert!(parrot.cache().is_empty());
    }

    #[tokio::test]
    async fn test_bots_count_as_registered() {
        let platform = MockPlatform::new();
        three_messages(&platform, BOT);
        let (parrot, _store, _platform) = parrot_with(platform).await;

        let request = ScanRequest {
            requester: ALICE,
            requester_is_admin: true,
            target: BOT,
            target_is_bot: true,
            ..ScanRequest::for_self(GUILD, ALICE)
        };
        parrot.start_scan(request, &LogReporter).await.unwrap();

        assert!(parrot.get_or_build_model(BOT, GUILD, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_imitate_gibberish() {
        let (parrot, _store, _platform) = parrot_with(MockPlatform::new()).await;

        let text = "polly wants a cracker";
        let scrambled = parrot.imitate_gibberish(text).await.unwrap();
        assert!(!scrambled.is_empty());
        assert!(scrambled.chars().all(|c| text.contains(c)));

        let result = parrot.imitate_gibberish("").await;
        assert!(matches!(result, Err(Error::BuildFailure(_))));
    }

    #[tokio::test]
    async fn test_imitate_uses_guild_decoration() {
        let platform = MockPlatform::new();
        three_messages(&platform, ALICE);
        let (parrot, _store, _platform) = parrot_with(platform).await;
        parrot.set_registered(ALICE, GUILD, true).await.unwrap();
        parrot
            .start_scan(ScanRequest::for_self(GUILD, ALICE), &LogReporter)
            .await
            .unwrap();

        let imitation = parrot.imitate(ALICE, GUILD, false).await.unwrap();
        assert!(!imitation.text.is_empty());
        assert_eq!(imitation.display_name("alice"), "[i] alice");

        parrot
            .set_imitation_prefix(GUILD, Some("not".to_string()))
            .await
            .unwrap();
        parrot
            .set_imitation_suffix(GUILD, Some(" (bot)".to_string()))
            .await
            .unwrap();
        let imitation = parrot.imitate(ALICE, GUILD, false).await.unwrap();
        assert_eq!(imitation.display_name("alice"), "not alice (bot)");

        parrot.set_imitation_prefix(GUILD, None).await.unwrap();
        let imitation = parrot.imitate(ALICE, GUILD, false).await.unwrap();
        assert_eq!(imitation.display_name("alice"), "[i] alice (bot)");
    }

    #[tokio::test]
    async fn test_toggle_preference() {
        let (parrot, _store, _platform) = parrot_with(MockPlatform::new()).await;
        // New users start opted in
        assert!(!parrot.toggle_preference(ALICE).await.unwrap());
        assert!(parrot.toggle_preference(ALICE).await.unwrap());
    }

    #[tokio::test]
    async fn test_export_user_data() {
        let platform = MockPlatform::new();
        three_messages(&platform, ALICE);
        let (parrot, _store, _platform) = parrot_with(platform).await;
        parrot.set_registered(ALICE, GUILD, true).await.unwrap();
        parrot
            .start_scan(ScanRequest::for_self(GUILD, ALICE), &LogReporter)
            .await
            .unwrap();

        let export = parrot.export_user_data(ALICE).await.unwrap().unwrap();
        assert_eq!(export.memberships.len(), 1);
        assert_eq!(export.memberships[0].messages.len(), 3);
        assert!(serde_json::to_string(&export).is_ok());

        assert!(parrot.export_user_data(BOT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_departed_member_pruned_through_service() {
        let platform = MockPlatform::new();
        three_messages(&platform, ALICE);
        platform.set_presence(GUILD, ALICE, MockPresence::Absent);
        let (parrot, store, _platform) = parrot_with(platform).await;
        parrot.set_registered(ALICE, GUILD, true).await.unwrap();
        parrot
            .start_scan(ScanRequest::for_self(GUILD, ALICE), &LogReporter)
            .await
            .unwrap();
        parrot.get_or_build_model(ALICE, GUILD, false).await.unwrap();

        let now = Utc::now();
        parrot
            .handle_event(
                PlatformEvent::MemberRemoved {
                    guild: GUILD,
                    user: ALICE,
                },
                now - ChronoDuration::days(31),
            )
            .await
            .unwrap();
        let report = parrot.prune_expired_memberships(now).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert!(parrot.cache().is_empty());
        assert!(!store.user_exists(ALICE).await.unwrap());
    }

    #[tokio::test]
    async fn test_maintenance_flushes_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parrot.json");
        let store = Arc::new(MemoryStore::open(&path).await.unwrap());
        let platform = Arc::new(MockPlatform::new());
        let parrot = Arc::new(Parrot::new(
            ParrotConfig::default(),
            store.clone(),
            platform.clone(),
            platform,
        ));
        parrot.set_registered(ALICE, GUILD, true).await.unwrap();

        let token = CancellationToken::new();
        let handle = parrot.clone().spawn_maintenance(token.clone());
        token.cancel();
        handle.await.unwrap();

        assert!(path.exists());
        let reopened = MemoryStore::open(&path).await.unwrap();
        assert!(reopened.get_membership(ALICE, GUILD).await.unwrap().is_some());
    }
}
