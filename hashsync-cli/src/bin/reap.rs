use std::path::PathBuf;

use clap::Parser;
use log::info;

use hashsync_cli::{connect_store, init_logging, now_unix, Verbosity, OBJECTLIST_CACHE_FILENAME};
use hashsync_reap::{default_cutoff, reap, ReapConfig};

/// Scan every object version in the store, delete what's purgeable, and
/// rewrite the known-blobs snapshot.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Remote store region.
    region: String,

    /// Remote bucket name.
    bucket_name: String,

    /// Versions older than this (unix seconds) are eligible for purge.
    /// Defaults to 7 days ago.
    cutoff: Option<i64>,

    #[command(flatten)]
    verbosity: Verbosity,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbosity);

    let store = connect_store(&args.region, &args.bucket_name).await;
    let now = now_unix();
    let cutoff = args.cutoff.unwrap_or_else(|| default_cutoff(now));
    let config = ReapConfig::new(cutoff);

    let cache_path = PathBuf::from(OBJECTLIST_CACHE_FILENAME);
    let stats = reap(store, &cache_path, &config, now).await?;
    info!(
        "live={} deleted_old={} deleted_duplicate={} failed_batches={}",
        stats.live_digests, stats.deleted_old, stats.deleted_duplicate, stats.failed_batches
    );
    Ok(())
}
