//! History scans
//!
//! A scan reads a guild's learnable channels back in time and stores every
//! message the target user wrote, so they can be imitated right away instead
//! of waiting for new messages. At most one scan runs per (guild, user).

mod crawler;

pub use crawler::{CrawlHandle, Crawler};

use crate::config::ScanConfig;
use crate::db::{GuildId, Permission, Store, UserId};
use crate::error::{Error, Result};
use crate::platform::{HistoryMessage, Platform};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// (guild, user) pair a scan runs for
pub type ScanKey = (GuildId, UserId);

/// Who asked for a scan, and on whose behalf
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub guild: GuildId,
    pub requester: UserId,
    pub requester_is_admin: bool,
    pub target: UserId,
    pub target_is_bot: bool,
    /// Only messages after this time are read. Looked up on the platform
    /// when unset.
    pub target_joined_at: Option<DateTime<Utc>>,
}

impl ScanRequest {
    /// A user scanning their own messages
    pub fn for_self(guild: GuildId, user: UserId) -> Self {
        Self {
            guild,
            requester: user,
            requester_is_admin: false,
            target: user,
            target_is_bot: false,
            target_joined_at: None,
        }
    }
}

/// Snapshot of a running scan
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub scan_id: Uuid,
    pub guild: GuildId,
    pub user: UserId,
    pub collected: u64,
}

impl ScanProgress {
    pub fn render(&self) -> String {
        format!(
            "**Scanning...**\nCollected {} new messages...\nScanning for <@{}>",
            self.collected, self.user
        )
    }
}

/// Outcome of a finished scan
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub scan_id: Uuid,
    pub guild: GuildId,
    pub user: UserId,
    pub collected: u64,
    /// Ended by `stop_scan` rather than by running out of history
    pub stopped: bool,
}

impl ScanSummary {
    pub fn render(&self) -> String {
        let mut text = if self.stopped {
            format!("**Scan stopped.**\nCollected {} new messages.", self.collected)
        } else {
            format!("**Scan complete.**\nCollected {} new messages.", self.collected)
        };
        if self.collected == 0 {
            text.push_str(&format!(
                "\nCouldn't find any messages from <@{}> in this server.",
                self.user
            ));
        }
        text
    }
}

/// Receives progress while a scan runs
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn update(&self, progress: &ScanProgress) -> Result<()>;

    async fn finish(&self, summary: &ScanSummary) -> Result<()>;
}

/// Reports progress to the log only
pub struct LogReporter;

#[async_trait]
impl ProgressReporter for LogReporter {
    async fn update(&self, progress: &ScanProgress) -> Result<()> {
        tracing::info!(
            scan_id = %progress.scan_id,
            guild = %progress.guild,
            user = %progress.user,
            collected = progress.collected,
            "Scan in progress"
        );
        Ok(())
    }

    async fn finish(&self, summary: &ScanSummary) -> Result<()> {
        tracing::info!(
            scan_id = %summary.scan_id,
            guild = %summary.guild,
            user = %summary.user,
            collected = summary.collected,
            stopped = summary.stopped,
            "Scan finished"
        );
        Ok(())
    }
}

/// Cancellation tokens of the running scans
#[derive(Clone, Default)]
struct ActiveScans(Arc<Mutex<HashMap<ScanKey, CancellationToken>>>);

impl ActiveScans {
    fn lock(&self) -> MutexGuard<'_, HashMap<ScanKey, CancellationToken>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes its key from the active set when dropped
struct Registration {
    active: ActiveScans,
    key: ScanKey,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.active.lock().remove(&self.key);
    }
}

/// Runs history scans, one at a time per (guild, user)
pub struct ScanCoordinator {
    store: Arc<dyn Store>,
    platform: Arc<dyn Platform>,
    config: ScanConfig,
    command_prefix: Arc<str>,
    active: ActiveScans,
}

impl ScanCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        platform: Arc<dyn Platform>,
        config: ScanConfig,
        command_prefix: &str,
    ) -> Self {
        Self {
            store,
            platform,
            config,
            command_prefix: Arc::from(command_prefix),
            active: ActiveScans::default(),
        }
    }

    pub fn is_scanning(&self, guild: GuildId, user: UserId) -> bool {
        self.active.lock().contains_key(&(guild, user))
    }

    pub fn active_scans(&self) -> Vec<ScanKey> {
        self.active.lock().keys().copied().collect()
    }

    /// Stop a running scan. Returns whether one was running.
    pub fn stop_scan(&self, guild: GuildId, user: UserId) -> bool {
        match self.active.lock().get(&(guild, user)) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Scan the guild's learnable channels for the target's messages and
    /// store them. Returns once the history is exhausted or the scan is
    /// stopped.
    pub async fn start_scan(
        &self,
        request: ScanRequest,
        reporter: &dyn ProgressReporter,
    ) -> Result<ScanSummary> {
        self.authorize(&request).await?;

        let token = CancellationToken::new();
        let _registration = self.register((request.guild, request.target), token.clone())?;

        let scan_id = Uuid::new_v4();
        tracing::info!(
            scan_id = %scan_id,
            guild = %request.guild,
            user = %request.target,
            requester = %request.requester,
            "Starting history scan"
        );

        let channels = self
            .store
            .channel_ids_with_permission(request.guild, Permission::CanLearnHere)
            .await?;

        let after = match request.target_joined_at {
            Some(at) => Some(at),
            None => self.join_time(request.guild, request.target).await,
        };

        let platform = self.platform.clone();
        let guild = request.guild;
        let limit = self.config.history_limit;
        let source = stream::iter(channels)
            .map(move |channel| platform.history(guild, channel, after, limit))
            .flatten()
            .boxed();

        let store = self.store.clone();
        let prefix = self.command_prefix.clone();
        let target = request.target;
        let action = move |message: HistoryMessage| {
            let store = store.clone();
            let learnable = message.author_id == target && !message.content.starts_with(&*prefix);
            async move {
                if !learnable {
                    return Ok(false);
                }
                store.add_message(message.into_message()).await
            }
        };

        let crawler = Crawler::with_token(source, action, token);
        let handle = crawler.handle();
        let progress = ScanProgress {
            scan_id,
            guild: request.guild,
            user: request.target,
            collected: 0,
        };

        let (result, ()) = tokio::join!(
            crawler.crawl(),
            self.report_progress(&handle, progress, reporter)
        );

        let collected = match result {
            Ok(collected) => collected,
            Err(e) => {
                tracing::warn!(
                    scan_id = %scan_id,
                    collected = handle.num_collected(),
                    error = %e,
                    "History scan failed"
                );
                return Err(e);
            }
        };

        let summary = ScanSummary {
            scan_id,
            guild: request.guild,
            user: request.target,
            collected,
            stopped: handle.was_stopped(),
        };
        if let Err(e) = reporter.finish(&summary).await {
            tracing::warn!(scan_id = %scan_id, error = %e, "Failed to report scan result");
        }

        tracing::info!(
            scan_id = %scan_id,
            collected,
            stopped = summary.stopped,
            "History scan finished"
        );
        Ok(summary)
    }

    async fn authorize(&self, request: &ScanRequest) -> Result<()> {
        if request.target != request.requester {
            if !request.requester_is_admin {
                return Err(Error::PermissionDenied(
                    "You can only scan your own messages".to_string(),
                ));
            }
            if !request.target_is_bot {
                return Err(Error::PermissionDenied(
                    "Scans on behalf of other users are limited to bots".to_string(),
                ));
            }
        }

        // Bots always count as registered
        if request.target_is_bot {
            return Ok(());
        }
        let registered = self
            .store
            .get_membership(request.target, request.guild)
            .await?
            .map(|m| m.is_registered)
            .unwrap_or(false);
        if !registered {
            return Err(Error::NotRegistered {
                guild: request.guild.0,
                user: request.target.0,
            });
        }
        Ok(())
    }

    /// When the target joined, so older history can be skipped. Without an
    /// answer the whole history is read.
    async fn join_time(&self, guild: GuildId, user: UserId) -> Option<DateTime<Utc>> {
        match self.platform.member_joined_at(guild, user).await {
            Ok(joined_at) => joined_at,
            Err(e) => {
                tracing::warn!(guild = %guild, user = %user, error = %e, "Join time lookup failed");
                None
            }
        }
    }

    fn register(&self, key: ScanKey, token: CancellationToken) -> Result<Registration> {
        let mut active = self.active.lock();
        if active.contains_key(&key) {
            return Err(Error::DuplicateScan {
                guild: key.0 .0,
                user: key.1 .0,
            });
        }
        active.insert(key, token);
        Ok(Registration {
            active: self.active.clone(),
            key,
        })
    }

    async fn report_progress(
        &self,
        handle: &CrawlHandle,
        mut progress: ScanProgress,
        reporter: &dyn ProgressReporter,
    ) {
        let interval = Duration::from_secs(self.config.progress_interval_secs);
        while handle.is_running() {
            progress.collected = handle.num_collected();
            if let Err(e) = reporter.update(&progress).await {
                tracing::warn!(scan_id = %progress.scan_id, error = %e, "Failed to report scan progress");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = handle.finished() => break,
            }
        }
    }
}
