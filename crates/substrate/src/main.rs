//! Substrate daemon - background compaction over a shared memory substrate

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use substrate::compaction::AutoCompactionDaemon;
use substrate::config::Config;
use substrate::error::{Result, SubstrateError};
use substrate::routing::PheromoneField;
use substrate::substrate::SharedSubstrate;

/// Substrate - shared memory substrate with automatic compaction
#[derive(Parser)]
#[command(name = "substrate")]
#[command(about = "Shared memory substrate with automatic compaction")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the compaction daemon until interrupted (default command)
    #[command(name = "serve")]
    Serve,

    /// Validate the config and print the effective settings as JSON
    #[command(name = "check")]
    Check,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
        Some(Command::Check) => check(cli.config).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,substrate=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn read_config(path: &Path) -> Result<Config> {
    tracing::info!("Loading config from: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| {
        SubstrateError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    Config::from_toml_str(&content)
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        return read_config(&path);
    }

    let default_paths = [
        dirs::home_dir().map(|h| h.join(".substrate").join("config.toml")),
        dirs::config_dir().map(|c| c.join("substrate").join("config.toml")),
        Some(PathBuf::from("config.toml")),
    ];

    for path in default_paths.iter().flatten() {
        if path.exists() {
            return read_config(path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting substrate daemon");

    let config = load_config(config_path)?;
    tracing::debug!("Config loaded: {:?}", config);

    let substrate = Arc::new(SharedSubstrate::from_config(&config)?);
    let field = Arc::new(PheromoneField::from_config(&config.pheromone));

    let daemon = AutoCompactionDaemon::new(
        Arc::clone(&substrate),
        Duration::from_secs(config.compaction.scan_interval_secs),
    )
    .with_field(field);

    daemon.start();
    tracing::info!(
        interval_secs = daemon.interval().as_secs_f64(),
        "Compaction daemon running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    daemon.shutdown().await;

    let stats = substrate.stats().await;
    tracing::info!(
        shared = stats.shared_allocations,
        dedicated = stats.dedicated_crystals,
        "Substrate daemon stopped"
    );
    Ok(())
}

async fn check(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let substrate = SharedSubstrate::from_config(&config)?;
    let field = PheromoneField::from_config(&config.pheromone);
    let compactor = substrate.compactor();
    let compaction = compactor.policy();
    let promotion = substrate.promotion_policy();

    let settings = serde_json::json!({
        "dimension": substrate.dimension(),
        "default_max_patterns": substrate.default_quota().max_patterns,
        "default_ttl_secs": config.substrate.default_ttl_secs,
        "compaction": {
            "pressure_threshold": compaction.pressure_threshold,
            "max_compactions_per_hour": compaction.max_compactions_per_hour,
            "merge_similarity": compaction.merge_similarity,
            "target_ratio": compaction.target_ratio,
            "target_count": compactor.target_count(substrate.default_quota().max_patterns),
            "strategy": compaction.strategy,
            "scan_interval_secs": config.compaction.scan_interval_secs,
        },
        "promotion": {
            "access_frequency_threshold": promotion.access_frequency_threshold,
            "min_age_secs": promotion.min_age.as_secs(),
        },
        "pheromone": {
            "half_life_secs": field.half_life().as_secs_f64(),
            "min_intensity": field.min_intensity(),
        },
        "router": {
            "exploration_rate": config.router.exploration_rate,
            "default_agent": config.router.default_agent,
        },
    });
    let json = serde_json::to_string_pretty(&settings)
        .map_err(|e| SubstrateError::Serialization(e.to_string()))?;
    println!("{json}");
    Ok(())
}
