//! Shared plumbing for the three `hashsync-*` binaries: logging setup and
//! remote store construction.

use std::sync::Arc;

use hashsync_store::{RemoteStore, S3Store};
use log::LevelFilter;

/// Local filename the known-blobs cache is kept under, in the current
/// working directory.
pub const OBJECTLIST_CACHE_FILENAME: &str = ".objectlist";

#[derive(Debug, Clone, Copy, clap::Args)]
pub struct Verbosity {
    /// Only log warnings and errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log debug output in addition to info.
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn init_logging(verbosity: Verbosity) {
    let level = if verbosity.quiet {
        LevelFilter::Warn
    } else if verbosity.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

pub async fn connect_store(region: &str, bucket: &str) -> Arc<dyn RemoteStore> {
    Arc::new(S3Store::connect(region.to_owned(), bucket.to_owned()).await)
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}
