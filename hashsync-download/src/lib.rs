//! Download planner: diffs a manifest against the local tree and a local
//! blob cache, schedules per-blob downloads with fan-out to every
//! destination sharing a digest, and materializes the target tree.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hashsync_blobcache::BlobCache;
use hashsync_digest::{self as digest, EMPTY_DIGEST};
use hashsync_manifest::{Manifest, ManifestEntry};
use hashsync_store::RemoteStore;
use log::{debug, info};
use tokio::sync::Semaphore;

/// Deadline for a single blob's download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(86_400);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("manifest error: {0}")]
    Manifest(#[from] hashsync_manifest::Error),
    #[error("digest error: {0}")]
    Digest(#[from] digest::Error),
    #[error("blobcache error: {0}")]
    Blobcache(#[from] hashsync_blobcache::Error),
    #[error("transfer error: {0}")]
    Transfer(#[from] hashsync_transfer::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download of {0} timed out")]
    Timeout(String),
    #[error("download task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub jobs: usize,
    pub timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            jobs: 8,
            timeout: DOWNLOAD_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadStats {
    pub added: u64,
    pub deleted: u64,
    pub unchanged: u64,
}

fn set_perms(path: &Path, perms: u16) -> Result<(), Error> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(perms as u32))?;
    Ok(())
}

pub async fn download_directory(
    store: Arc<dyn RemoteStore>,
    manifest_path: &Path,
    destdir: &Path,
    cache_dir: &Path,
    config: &DownloadConfig,
) -> Result<DownloadStats, Error> {
    let manifest = {
        let mut f = std::fs::File::open(manifest_path)?;
        Manifest::load(&mut f)?
    };

    let target: HashMap<(String, String), &ManifestEntry> = manifest
        .entries
        .iter()
        .map(|e| ((e.digest.clone(), e.relpath.clone()), e))
        .collect();

    let mut stats = DownloadStats::default();
    let cache = BlobCache::new(cache_dir);

    // diff against whatever's already on disk
    let mut local: HashMap<(String, String), PathBuf> = HashMap::new();
    if destdir.exists() {
        for (abs_path, file_digest) in digest::walk_tree(destdir)? {
            let relpath = digest::strip_prefix(destdir, &abs_path);
            local.insert((file_digest, relpath), abs_path);
        }
    }

    for ((file_digest, relpath), abs_path) in &local {
        if !target.contains_key(&(file_digest.clone(), relpath.clone())) {
            debug!("removing stale {}", relpath);
            std::fs::remove_file(abs_path)?;
            stats.deleted += 1;
        }
    }

    let mut to_add: Vec<&ManifestEntry> = Vec::new();
    for entry in &manifest.entries {
        if local.contains_key(&(entry.digest.clone(), entry.relpath.clone())) {
            stats.unchanged += 1;
        } else {
            to_add.push(entry);
        }
    }

    // group add-list by digest: first occurrence schedules the fetch,
    // all occurrences (including the first) are fan-out destinations
    let mut destinations: HashMap<String, Vec<&ManifestEntry>> = HashMap::new();
    for entry in &to_add {
        destinations.entry(entry.digest.clone()).or_default().push(entry);
    }

    let mut to_fetch: Vec<String> = Vec::new();
    for d in destinations.keys() {
        if *d == EMPTY_DIGEST {
            continue;
        }
        if !cache.contains(d) {
            to_fetch.push(d.clone());
        }
    }

    if !to_fetch.is_empty() {
        let semaphore = Arc::new(Semaphore::new(config.jobs.max(1)));
        let mut set = tokio::task::JoinSet::new();
        for d in to_fetch {
            let semaphore = semaphore.clone();
            let store = store.clone();
            let cache = BlobCache::new(cache_dir);
            let timeout = config.timeout;
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let key = format!("objects/{}", d);
                let tmp_path = std::env::temp_dir().join(format!("hashsync-dl-{}", d));
                let result = tokio::time::timeout(
                    timeout,
                    hashsync_transfer::download_blob(store.as_ref(), &key, &tmp_path),
                )
                .await;

                match result {
                    Ok(Ok(())) => {
                        let outcome = (|| -> Result<(), Error> {
                            let mut writer = cache.create_writer(&d)?;
                            let mut src = std::fs::File::open(&tmp_path)?;
                            std::io::copy(&mut src, writer.file_mut())?;
                            writer.persist()?;
                            Ok(())
                        })();
                        let _ = std::fs::remove_file(&tmp_path);
                        outcome.map(|()| d)
                    }
                    Ok(Err(e)) => Err(Error::from(e)),
                    Err(_) => Err(Error::Timeout(key)),
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            joined??;
        }
    }

    for (d, entries) in &destinations {
        for entry in entries {
            let dest = destdir.join(&entry.relpath);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if *d == EMPTY_DIGEST {
                std::fs::File::create(&dest)?;
            } else {
                cache.materialize(d, &dest)?;
            }
            set_perms(&dest, entry.perms)?;
            stats.added += 1;
        }
    }

    info!(
        "download stats: added={} deleted={} unchanged={}",
        stats.added, stats.deleted, stats.unchanged
    );
    Ok(stats)
}
