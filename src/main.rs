//! Partyline - Distributed Connection & Session State Manager
//!
//! Runs a manager instance against the shared store and offers a few
//! inspection commands for operators.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use partyline::config::PartylineConfig;
use partyline::state::DistributedStateManager;
use partyline::store::{MemoryStore, RedisStore, SharedStore};

/// Partyline - Distributed Connection & Session State Manager
#[derive(Parser)]
#[command(name = "partyline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "partyline.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a manager instance until interrupted
    Run {
        /// Use an in-process store instead of Redis (single instance only)
        #[arg(long)]
        memory: bool,

        /// Override the configured instance id
        #[arg(long)]
        instance_id: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "partyline.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show effective configuration
    Info,

    /// Print a session's members and leader as JSON
    Session {
        /// Session id
        id: String,
    },

    /// Print a connection record as JSON
    Connection {
        /// Connection id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.command {
        Commands::Init { .. } | Commands::Validate => PartylineConfig::default(),
        _ => load_config(&cli.config)?,
    };

    // Initialize logging
    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    match cli.command {
        Commands::Run { memory, instance_id } => run_instance(config, memory, instance_id).await,
        Commands::Init { output } => run_init(&output),
        Commands::Validate => run_validate(&cli.config),
        Commands::Info => run_info(&config),
        Commands::Session { id } => run_session(&config, &id).await,
        Commands::Connection { id } => run_connection(&config, &id).await,
    }
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> anyhow::Result<PartylineConfig> {
    if !path.exists() {
        eprintln!("Config file {} not found, using defaults", path.display());
        return Ok(PartylineConfig::default());
    }
    PartylineConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect_store(config: &PartylineConfig) -> anyhow::Result<Arc<dyn SharedStore>> {
    let store = RedisStore::connect(&config.store.url, config.command_timeout())
        .await
        .context("Failed to connect to the shared store")?;
    Ok(Arc::new(store))
}

/// Run one manager instance until Ctrl-C
async fn run_instance(
    config: PartylineConfig,
    memory: bool,
    instance_id: Option<String>,
) -> anyhow::Result<()> {
    let store: Arc<dyn SharedStore> = if memory {
        tracing::warn!("Using in-process store; state is not shared with other instances");
        Arc::new(MemoryStore::new())
    } else {
        connect_store(&config).await?
    };

    let instance_id = instance_id.or_else(|| config.instance.id.clone());
    let manager = DistributedStateManager::new(store, instance_id.as_deref(), config.state_config())?;
    manager.start()?;

    tracing::info!("Partyline instance {} running", manager.instance_id());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    if let Err(e) = manager.stop().await {
        tracing::error!("Cleanup on shutdown failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

/// Write a default configuration file
fn run_init(output: &Path) -> anyhow::Result<()> {
    let content = format!(
        "# Partyline Configuration\n# Generated configuration file\n\n{}",
        PartylineConfig::default().to_toml()?
    );

    std::fs::write(output, content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: partyline --config {} run", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    match PartylineConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Store:      {}", config.store.url);
            println!("  Key prefix: {}", config.store.key_prefix);
            println!("  Instance:   {}", config.instance.id.as_deref().unwrap_or("(generated)"));
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show effective configuration
fn run_info(config: &PartylineConfig) -> anyhow::Result<()> {
    println!("Partyline Configuration");
    println!("=======================");
    println!();
    println!("Store:");
    println!("  URL:            {}", config.store.url);
    println!("  Key Prefix:     {}", config.store.key_prefix);
    println!("  Call Timeout:   {} ms", config.store.command_timeout_ms);
    println!();
    println!("Instance ID:      {}", config.instance.id.as_deref().unwrap_or("(generated per start)"));
    println!();
    println!("Expiry:");
    println!("  Connection:     {} s", config.ttl.connection_secs);
    println!("  Session:        {} s", config.ttl.session_secs);
    println!("  Heartbeat:      {} s (every {} s)", config.ttl.heartbeat_secs, config.ttl.heartbeat_interval_secs);
    Ok(())
}

/// Print session members and leader
async fn run_session(config: &PartylineConfig, session_id: &str) -> anyhow::Result<()> {
    let manager = DistributedStateManager::new(connect_store(config).await?, None, config.state_config())?;

    let members = manager.get_session_members(session_id).await?;
    let leader = manager.get_session_leader(session_id).await?;

    let report = serde_json::json!({
        "sessionId": session_id,
        "leader": leader,
        "memberCount": members.len(),
        "members": members,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Print one connection record
async fn run_connection(config: &PartylineConfig, connection_id: &str) -> anyhow::Result<()> {
    let manager = DistributedStateManager::new(connect_store(config).await?, None, config.state_config())?;

    match manager.get_connection(connection_id).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("null"),
    }
    Ok(())
}
