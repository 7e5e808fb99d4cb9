//! Forker service binary.
//!
//! Usage:
//!     forker --config /etc/forker/forker.toml
//!     forker --source /data/incoming --target-a /mnt/a --target-b /mnt/b

use clap::Parser;
use forker::Service;
use forker_protocol::ForkerConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "forker", about = "Crash-safe dual-target file replication")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, env = "FORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Source directory override
    #[arg(long)]
    source: Option<PathBuf>,

    /// TargetA directory override
    #[arg(long)]
    target_a: Option<PathBuf>,

    /// TargetB directory override
    #[arg(long)]
    target_b: Option<PathBuf>,

    /// Quarantine directory override
    #[arg(long)]
    quarantine: Option<PathBuf>,

    /// Database path override
    #[arg(long)]
    database: Option<PathBuf>,

    /// Verbose console logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    forker_logging::init_logging(forker_logging::LogConfig {
        app_name: "forker",
        verbose: args.verbose,
    })?;

    let mut config = match &args.config {
        Some(path) => ForkerConfig::load(path)?,
        None => ForkerConfig::default(),
    };
    apply_overrides(&mut config, &args);

    tracing::info!("Starting Forker");
    tracing::info!("  Source: {}", config.directories.source.display());
    for target in &config.targets {
        tracing::info!("  {}: {}", target.id, target.path.display());
    }
    tracing::info!("  Database: {}", config.database.path.display());

    let service = Service::start(config).await?;
    service.run_until_shutdown().await
}

fn apply_overrides(config: &mut ForkerConfig, args: &Args) {
    if let Some(source) = &args.source {
        config.directories.source = source.clone();
    }
    if let Some(quarantine) = &args.quarantine {
        config.directories.quarantine = quarantine.clone();
    }
    if let Some(database) = &args.database {
        config.database.path = database.clone();
    }

    // Directory overrides can stand up the canonical pair without a file.
    if config.targets.is_empty() {
        if let (Some(a), Some(b)) = (&args.target_a, &args.target_b) {
            let seeded = ForkerConfig::with_default_targets(
                config.directories.source.clone(),
                a.clone(),
                b.clone(),
                config.directories.quarantine.clone(),
            );
            config.targets = seeded.targets;
            return;
        }
    }
    if let Some(a) = &args.target_a {
        if let Some(target) = config.targets.get_mut(0) {
            target.path = a.clone();
        }
    }
    if let Some(b) = &args.target_b {
        if let Some(target) = config.targets.get_mut(1) {
            target.path = b.clone();
        }
    }
}
