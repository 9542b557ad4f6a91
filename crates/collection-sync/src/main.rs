use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collection_sync_core::SyncConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod render;
mod script;

#[derive(Parser)]
#[command(author, version, about = "Replay collection snapshots through the tree synchronizer")]
struct Opts {
    #[command(subcommand)]
    command: Commands,

    /// Synchronizer settings (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Attach item counts to every collection in the tree.
    #[arg(long, global = true, env = "COLLECTION_SYNC_ITEM_COUNTS")]
    item_counts: bool,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a JSON script of row snapshots and collapse commands through a
    /// synchronizer and print the resulting tree.
    Replay {
        script: PathBuf,

        /// Print the tree as JSON instead of an outline.
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>, item_counts: bool) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if item_counts {
        config.include_item_counts = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(&opts.log_level);

    let config = load_config(opts.config.as_deref(), opts.item_counts)?;
    tracing::debug!("Using config: {:?}", config);

    match opts.command {
        Commands::Replay { script, json } => {
            let loaded = script::Script::load(&script)?;
            let outcome = script::replay(config, loaded)
                .await
                .with_context(|| format!("replaying {}", script.display()))?;
            if json {
                println!("{}", render::json(&outcome)?);
            } else {
                let mut out = String::new();
                render::outline(&outcome, &mut out)?;
                print!("{}", out);
            }
        }
    }

    Ok(())
}
