//! Parrot - learn how Discord members write, imitate them, and forget them

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parrot::{
    config::ParrotConfig,
    db::{ChannelId, GuildId, MemoryStore, MessageId, UserId},
    platform::{DiscordClient, DiscordStatusMessage},
    scan::{LogReporter, ProgressReporter, ScanRequest},
    Parrot,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "parrot")]
#[command(author = "Parrot Developers")]
#[command(version)]
#[command(about = "Learn how Discord members write, imitate them, and forget them")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PARROT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the retention sweep and periodic snapshots until Ctrl+C
    Run,

    /// Forget memberships whose retention period ran out, once
    Prune,

    /// Scan a guild's history for a member's messages
    Scan {
        #[arg(long)]
        guild: u64,

        #[arg(long)]
        user: u64,

        /// The member is a bot (bots need no registration)
        #[arg(long)]
        bot: bool,

        /// Channel of a message to edit with progress
        #[arg(long, requires = "status_message")]
        status_channel: Option<u64>,

        /// Message to edit with progress
        #[arg(long, requires = "status_channel")]
        status_message: Option<u64>,
    },

    /// Delete everything stored about a member, or about one membership
    Forget {
        #[arg(long)]
        user: u64,

        /// Only forget the member in this guild
        #[arg(long)]
        guild: Option<u64>,
    },

    /// Print everything stored about a member as JSON
    Export {
        #[arg(long)]
        user: u64,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("parrot={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match &cli.config {
        Some(path) => ParrotConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ParrotConfig::default(),
    };

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Prune => prune(config).await?,
        Commands::Scan {
            guild,
            user,
            bot,
            status_channel,
            status_message,
        } => {
            let status = status_channel.zip(status_message);
            scan(config, GuildId(guild), UserId(user), bot, status).await?;
        }
        Commands::Forget { user, guild } => {
            forget(config, UserId(user), guild.map(GuildId)).await?;
        }
        Commands::Export { user } => export(config, UserId(user)).await?,
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

/// Open the snapshot store and connect to Discord
async fn connect(config: ParrotConfig) -> Result<(Arc<Parrot>, DiscordClient)> {
    let path = config.storage.snapshot_path();
    let store = Arc::new(
        MemoryStore::open(&path)
            .await
            .with_context(|| format!("opening database {}", path.display()))?,
    );
    let client = DiscordClient::from_config(&config.discord)?;
    let platform = Arc::new(client.clone());

    let parrot = Arc::new(Parrot::new(config, store, platform.clone(), platform));
    Ok((parrot, client))
}

async fn run(config: ParrotConfig) -> Result<()> {
    tracing::info!("Starting Parrot");

    let (parrot, _client) = connect(config).await?;
    let token = CancellationToken::new();
    let maintenance = parrot.clone().spawn_maintenance(token.clone());

    tracing::info!("Parrot is running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    token.cancel();
    maintenance.await?;

    Ok(())
}

async fn prune(config: ParrotConfig) -> Result<()> {
    let (parrot, _client) = connect(config).await?;

    let report = parrot.prune_expired_memberships(chrono::Utc::now()).await?;
    parrot.flush().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn scan(
    config: ParrotConfig,
    guild: GuildId,
    user: UserId,
    bot: bool,
    status: Option<(u64, u64)>,
) -> Result<()> {
    let (parrot, client) = connect(config).await?;

    let reporter: Box<dyn ProgressReporter> = match status {
        Some((channel, message)) => Box::new(DiscordStatusMessage::new(
            client,
            ChannelId(channel),
            MessageId(message),
        )),
        None => Box::new(LogReporter),
    };
    let request = ScanRequest {
        target_is_bot: bot,
        ..ScanRequest::for_self(guild, user)
    };

    let scan = parrot.start_scan(request, reporter.as_ref());
    tokio::pin!(scan);
    let summary = tokio::select! {
        result = &mut scan => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Stopping scan...");
            parrot.stop_scan(guild, user);
            scan.await?
        }
    };
    parrot.flush().await?;

    println!("{}", summary.render());
    Ok(())
}

async fn forget(config: ParrotConfig, user: UserId, guild: Option<GuildId>) -> Result<()> {
    let (parrot, _client) = connect(config).await?;

    let result = match guild {
        Some(guild) => parrot.delete_membership(user, guild).await,
        None => parrot.delete_member(user).await,
    };
    // Whatever was deleted stays deleted
    parrot.flush().await?;
    result?;

    println!("Forgot user {}", user);
    Ok(())
}

async fn export(config: ParrotConfig, user: UserId) -> Result<()> {
    let path = config.storage.snapshot_path();
    let store = MemoryStore::open(&path)
        .await
        .with_context(|| format!("opening database {}", path.display()))?;

    match parrot::db::Store::export_user(&store, user).await? {
        Some(export) => println!("{}", serde_json::to_string_pretty(&export)?),
        None => println!("Nothing stored for user {}", user),
    }
    Ok(())
}

fn show_config(config: Option<&ParrotConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
