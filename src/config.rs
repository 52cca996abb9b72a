//! Parrot configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Main Parrot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParrotConfig {
    /// Discord connection configuration
    #[serde(default)]
    pub discord: DiscordConfig,

    /// Data retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Message history scan configuration
    #[serde(default)]
    pub scan: ScanConfig,

    /// Markov model configuration
    #[serde(default)]
    pub markov: MarkovConfig,

    /// Imitation display defaults
    #[serde(default)]
    pub imitation: ImitationConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Periodic maintenance configuration
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl ParrotConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.markov.min_state_size == 0 {
            return Err(Error::Config("markov.min_state_size must be at least 1".to_string()));
        }
        if self.markov.min_state_size > self.markov.max_state_size {
            return Err(Error::Config(format!(
                "markov.min_state_size ({}) exceeds markov.max_state_size ({})",
                self.markov.min_state_size, self.markov.max_state_size
            )));
        }
        if self.scan.progress_interval_secs == 0 {
            return Err(Error::Config("scan.progress_interval_secs must be positive".to_string()));
        }
        Ok(())
    }
}

/// Discord configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Environment variable holding the bot token
    pub token_env: String,

    /// REST API base URL
    pub api_base: String,

    /// Channel where derived avatars are uploaded
    pub avatar_channel_id: Option<u64>,

    /// Users allowed to act on other users' data
    pub admin_user_ids: Vec<u64>,

    /// Command prefix; messages starting with it are never learned
    pub command_prefix: String,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token_env: "DISCORD_BOT_TOKEN".to_string(),
            api_base: "https://discord.com/api/v10".to_string(),
            avatar_channel_id: None,
            admin_user_ids: Vec::new(),
            command_prefix: "|".to_string(),
        }
    }
}

impl DiscordConfig {
    /// Read the bot token from the configured environment variable
    pub fn resolve_token(&self) -> Result<String> {
        std::env::var(&self.token_env)
            .map_err(|_| Error::Config(format!("environment variable {} is not set", self.token_env)))
    }

    /// Whether a user is an operator
    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_user_ids.contains(&user_id)
    }
}

/// Data retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// How long a departed member's data is kept, in seconds
    pub message_retention_period_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            // 30 days
            message_retention_period_secs: 30 * 24 * 60 * 60,
        }
    }
}

impl RetentionConfig {
    pub fn period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.message_retention_period_secs as i64)
    }
}

/// History scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Maximum messages read per channel
    pub history_limit: usize,

    /// Seconds between progress updates
    pub progress_interval_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            history_limit: 100_000,
            progress_interval_secs: 2,
        }
    }
}

/// Markov model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkovConfig {
    /// Smallest state size a build may pick
    pub min_state_size: usize,

    /// Largest state size a build may pick
    pub max_state_size: usize,

    /// Maximum words in a generated sentence
    pub max_words: usize,

    /// Attempts before generation gives up
    pub max_attempts: usize,

    /// Seed for the model RNG (None = seeded from entropy)
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for MarkovConfig {
    fn default() -> Self {
        Self {
            min_state_size: 1,
            max_state_size: 2,
            max_words: 80,
            max_attempts: 10,
            seed: None,
        }
    }
}

/// Imitation display defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImitationConfig {
    pub default_prefix: String,
    pub default_suffix: String,
}

impl Default for ImitationConfig {
    fn default() -> Self {
        Self {
            default_prefix: "[i]".to_string(),
            default_suffix: String::new(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for storage
    pub base_dir: PathBuf,

    /// Seconds between database snapshots
    pub autosave_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs_next::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parrot");

        Self {
            base_dir: base,
            autosave_interval_secs: 300,
        }
    }
}

impl StorageConfig {
    /// Path of the database snapshot file
    pub fn snapshot_path(&self) -> PathBuf {
        self.base_dir.join("parrot.json")
    }
}

/// Periodic maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between expired-membership sweeps
    pub prune_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            // daily
            prune_interval_secs: 24 * 60 * 60,
        }
    }
}
