use std::path::PathBuf;

use clap::Parser;
use log::info;

use hashsync_cli::{connect_store, init_logging, Verbosity};
use hashsync_download::{download_directory, DownloadConfig};

/// Materialize a directory tree from a manifest, fetching blobs through a
/// local content-addressed cache.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Remote store region.
    region: String,

    /// Remote bucket name.
    bucket_name: String,

    /// Manifest file to read.
    manifest: PathBuf,

    /// Directory to materialize into.
    destdir: PathBuf,

    /// Local content-addressed blob cache directory.
    #[arg(long)]
    cache_dir: PathBuf,

    /// Number of concurrent download workers.
    #[arg(short = 'j', long, default_value_t = 8)]
    jobs: usize,

    #[command(flatten)]
    verbosity: Verbosity,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbosity);

    let store = connect_store(&args.region, &args.bucket_name).await;
    let config = DownloadConfig {
        jobs: args.jobs,
        ..DownloadConfig::default()
    };

    let stats = download_directory(store, &args.manifest, &args.destdir, &args.cache_dir, &config).await?;
    info!(
        "added={} deleted={} unchanged={}",
        stats.added, stats.deleted, stats.unchanged
    );
    Ok(())
}
