use std::path::PathBuf;

use clap::Parser;
use log::info;

use hashsync_cli::{connect_store, init_logging, now_unix, Verbosity, OBJECTLIST_CACHE_FILENAME};
use hashsync_upload::{dupes_report, upload_directory, UploadConfig};

/// Walk a directory, upload its content-addressed blobs, and write a manifest.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Remote store region.
    region: String,

    /// Remote bucket name.
    bucket_name: String,

    /// Directory to walk and upload.
    dirname: PathBuf,

    /// Number of concurrent upload workers.
    #[arg(short = 'j', long, default_value_t = 8)]
    jobs: usize,

    /// Manifest output path, or "-" for stdout.
    #[arg(short, long, default_value = "manifest.gz")]
    output: String,

    /// Force gzip-compressing the manifest even when writing to stdout.
    #[arg(short = 'z', long)]
    compress_manifest: bool,

    /// Walk and plan but never write to the remote store.
    #[arg(long)]
    no_upload: bool,

    /// Print groups of files sharing identical content.
    #[arg(long)]
    report_dupes: bool,

    #[command(flatten)]
    verbosity: Verbosity,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbosity);

    let store = connect_store(&args.region, &args.bucket_name).await;
    let now = now_unix();

    let config = UploadConfig {
        jobs: args.jobs,
        dryrun: args.no_upload,
        ..UploadConfig::default()
    };

    let cache_path = PathBuf::from(OBJECTLIST_CACHE_FILENAME);
    let result = upload_directory(store, &args.dirname, &cache_path, &config, now).await?;

    info!(
        "uploaded {} entries: {:?}",
        result.manifest.entries.len(),
        result.stats.counts
    );

    if args.report_dupes {
        let groups = dupes_report(&result.manifest, &result.sizes);
        for group in &groups {
            println!(
                "duplicate digest {} ({} bytes wasted across {} copies): {}",
                group.digest,
                group.size * (group.relpaths.len() as u64 - 1),
                group.relpaths.len(),
                group.relpaths.join(", ")
            );
        }
    }

    if args.output == "-" {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        result.manifest.save(&mut lock, args.compress_manifest)?;
    } else {
        let mut f = std::fs::File::create(&args.output)?;
        result.manifest.save(&mut f, true)?;
    }

    Ok(())
}
