use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

/// Rebuild the footprint cache from the event store and leave a compacted
/// mutation log behind for servers booting with FOOTPRINTS_RECOVERY=replay.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// SQLite event store, overrides FOOTPRINTS_DATABASE
    #[arg(long)]
    database: Option<PathBuf>,

    /// Redis endpoint, overrides REDIS_URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Mutation log to write, overrides FOOTPRINTS_JOURNAL
    #[arg(long)]
    journal: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();

    seed::load_footprints(seed::Overrides {
        database: args.database,
        redis_url: args.redis_url,
        journal: args.journal,
    })
    .await
}
