//! Upload planner: walks a directory tree, diffs file digests against the
//! known-blobs set, schedules per-blob uploads with dedup and bounded
//! concurrency, and assembles the resulting manifest.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hashsync_digest::{self as digest, EMPTY_DIGEST};
use hashsync_manifest::Manifest;
use hashsync_objectlist::ObjectList;
use hashsync_store::RemoteStore;
use hashsync_transfer::{Outcome, TransferConfig};
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::Semaphore;

/// One out of every N already-known objects is refreshed anyway, so a whole
/// fleet of blobs doesn't all expire on the same day a year from now.
pub const REFRESH_EVERY_NTH_OBJECTS: u64 = 10_000;

/// How long a single blob's upload may run before the whole pass fails.
pub const MAX_UPLOAD_TIME: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("digest error: {0}")]
    Digest(#[from] digest::Error),
    #[error("objectlist error: {0}")]
    Objectlist(#[from] hashsync_objectlist::Error),
    #[error("transfer error: {0}")]
    Transfer(#[from] hashsync_transfer::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload of {0} timed out")]
    Timeout(String),
    #[error("upload task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub jobs: usize,
    pub dryrun: bool,
    pub max_upload_time: Duration,
    pub refresh_every_nth: u64,
    pub transfer: TransferConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            jobs: 8,
            dryrun: false,
            max_upload_time: MAX_UPLOAD_TIME,
            refresh_every_nth: REFRESH_EVERY_NTH_OBJECTS,
            transfer: TransferConfig::default(),
        }
    }
}

/// What happened to a given file's blob, for reporting. `Inlined` and
/// `SkippedKnown` never touch the network; the rest mirror
/// `hashsync_transfer::Outcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOutcome {
    Inlined,
    SkippedKnown,
    Uploaded,
    Refreshed,
    Skipped,
}

impl From<Outcome> for FileOutcome {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Uploaded => FileOutcome::Uploaded,
            Outcome::Refreshed => FileOutcome::Refreshed,
            Outcome::Skipped => FileOutcome::Skipped,
            Outcome::Inlined => FileOutcome::Inlined,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadStats {
    pub counts: HashMap<FileOutcome, u64>,
    pub bytes_by_outcome: HashMap<FileOutcome, u64>,
}

impl UploadStats {
    fn record(&mut self, outcome: FileOutcome, size: u64) {
        *self.counts.entry(outcome).or_default() += 1;
        *self.bytes_by_outcome.entry(outcome).or_default() += size;
    }
}

pub struct UploadResult {
    pub manifest: Manifest,
    pub stats: UploadStats,
    pub sizes: HashMap<String, u64>,
}

/// One group of manifest entries sharing `(size, digest)`.
pub struct DupeGroup {
    pub digest: String,
    pub size: u64,
    pub relpaths: Vec<String>,
}

/// Groups manifest entries by identical content and reports groups with
/// two or more members, for the `--report-dupes` CLI flag.
pub fn dupes_report(manifest: &Manifest, sizes: &HashMap<String, u64>) -> Vec<DupeGroup> {
    let mut by_key: HashMap<(u64, &str), Vec<&str>> = HashMap::new();
    for entry in &manifest.entries {
        let size = sizes.get(&entry.digest).copied().unwrap_or(0);
        by_key
            .entry((size, entry.digest.as_str()))
            .or_default()
            .push(entry.relpath.as_str());
    }

    let mut groups: Vec<DupeGroup> = by_key
        .into_iter()
        .filter(|(_, paths)| paths.len() >= 2)
        .map(|((size, digest), paths)| DupeGroup {
            digest: digest.to_owned(),
            size,
            relpaths: paths.into_iter().map(str::to_owned).collect(),
        })
        .collect();
    groups.sort_by(|a, b| a.digest.cmp(&b.digest));
    groups
}

struct FileEntry {
    abs_path: PathBuf,
    digest: String,
    relpath: String,
    perms: u16,
    size: u64,
}

pub async fn upload_directory(
    store: Arc<dyn RemoteStore>,
    dirname: &Path,
    cache_path: &Path,
    config: &UploadConfig,
    now: i64,
) -> Result<UploadResult, Error> {
    let mut known = if config.dryrun {
        ObjectList::new()
    } else {
        hashsync_objectlist::load(store.as_ref(), cache_path).await?
    };

    let walked = digest::walk_tree(dirname)?;
    let mut files = Vec::with_capacity(walked.len());
    for (abs_path, file_digest) in walked {
        let relpath = digest::strip_prefix(dirname, &abs_path);
        let meta = match std::fs::metadata(&abs_path) {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping unreadable file {}: {}", abs_path.display(), e);
                continue;
            }
        };
        files.push(FileEntry {
            abs_path,
            digest: file_digest,
            relpath,
            perms: (meta.permissions().mode() & 0o777) as u16,
            size: meta.len(),
        });
    }

    // digest -> task scheduled this run, for dedup across repeated content
    let mut enqueued: HashSet<String> = HashSet::new();
    let mut to_spawn: Vec<(String, PathBuf, String)> = Vec::new();

    for f in &files {
        if f.digest == EMPTY_DIGEST {
            continue;
        }

        let already_known = known.contains(&f.digest);
        let r: u64 = rand::rng().random_range(0..config.refresh_every_nth.max(1));

        if already_known && r != 0 {
            debug!("{} already known, skipping", f.relpath);
            continue;
        }

        if enqueued.insert(f.digest.clone()) {
            known.add(f.digest.clone());
            if !config.dryrun {
                to_spawn.push((f.digest.clone(), f.abs_path.clone(), format!("objects/{}", f.digest)));
            }
        }
    }

    let mut outcome_by_digest: HashMap<String, FileOutcome> = HashMap::new();

    if !to_spawn.is_empty() {
        let semaphore = Arc::new(Semaphore::new(config.jobs.max(1)));
        let mut set = tokio::task::JoinSet::new();
        for (d, path, key) in to_spawn {
            let semaphore = semaphore.clone();
            let store = store.clone();
            let transfer_config = config.transfer.clone();
            let max_upload_time = config.max_upload_time;
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let result = tokio::time::timeout(
                    max_upload_time,
                    hashsync_transfer::upload_blob(store.as_ref(), &path, &key, now, &transfer_config),
                )
                .await;

                match result {
                    Ok(Ok(outcome)) => Ok((d, FileOutcome::from(outcome))),
                    Ok(Err(e)) => Err(Error::from(e)),
                    Err(_) => Err(Error::Timeout(key)),
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            let (d, outcome) = joined??;
            outcome_by_digest.insert(d, outcome);
        }
    }

    if !config.dryrun {
        hashsync_objectlist::save(store.as_ref(), &known).await?;
    }

    let mut manifest = Manifest::new();
    let mut stats = UploadStats::default();
    let mut sizes: HashMap<String, u64> = HashMap::new();

    for f in &files {
        manifest.add(f.digest.clone(), f.relpath.clone(), f.perms);
        sizes.insert(f.digest.clone(), f.size);

        let outcome = if f.digest == EMPTY_DIGEST {
            FileOutcome::Inlined
        } else if let Some(o) = outcome_by_digest.get(&f.digest) {
            *o
        } else {
            FileOutcome::SkippedKnown
        };
        stats.record(outcome, f.size);
    }

    info!("upload stats: {:?}", stats.counts);
    Ok(UploadResult { manifest, stats, sizes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashsync_store::InMemoryStore;

    fn write_tree(dir: &Path) {
        std::fs::write(dir.join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.join("dir")).unwrap();
        std::fs::write(dir.join("dir/snow.txt"), "\u{2603}".as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn two_files_upload_two_blobs() {
        let store: Arc<dyn RemoteStore> = Arc::new(InMemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let cache = tempfile::tempdir().unwrap();

        let result = upload_directory(
            store.clone(),
            dir.path(),
            &cache.path().join(".objectlist"),
            &UploadConfig::default(),
            0,
        )
        .await
        .unwrap();

        assert_eq!(result.manifest.entries.len(), 2);
        let digests: HashSet<_> = result.manifest.entries.iter().map(|e| e.digest.clone()).collect();
        assert!(digests.contains("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"));
        assert_eq!(*result.stats.counts.get(&FileOutcome::Uploaded).unwrap(), 2);
    }

    #[tokio::test]
    async fn reupload_of_unchanged_tree_does_no_puts() {
        let store: Arc<dyn RemoteStore> = Arc::new(InMemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let cache = tempfile::tempdir().unwrap();
        let cache_path = cache.path().join(".objectlist");

        let first = upload_directory(store.clone(), dir.path(), &cache_path, &UploadConfig::default(), 0)
            .await
            .unwrap();
        assert_eq!(*first.stats.counts.get(&FileOutcome::Uploaded).unwrap(), 2);

        // force deterministic "not the lottery winner" by using a huge N
        let config = UploadConfig {
            refresh_every_nth: u64::MAX,
            ..UploadConfig::default()
        };

        let second = upload_directory(store.clone(), dir.path(), &cache_path, &config, 0)
            .await
            .unwrap();
        assert!(second.stats.counts.get(&FileOutcome::Uploaded).is_none());
    }

    #[tokio::test]
    async fn duplicate_digests_produce_one_task_and_two_manifest_entries() {
        let store: Arc<dyn RemoteStore> = Arc::new(InMemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"same bytes").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"same bytes").unwrap();
        let cache = tempfile::tempdir().unwrap();

        let result = upload_directory(
            store,
            dir.path(),
            &cache.path().join(".objectlist"),
            &UploadConfig::default(),
            0,
        )
        .await
        .unwrap();

        assert_eq!(result.manifest.entries.len(), 2);
        assert_eq!(*result.stats.counts.get(&FileOutcome::Uploaded).unwrap(), 2);
    }

    #[tokio::test]
    async fn zero_byte_file_is_inlined_and_never_enqueued() {
        let store = Arc::new(InMemoryStore::new());
        let dyn_store: Arc<dyn RemoteStore> = store.clone();
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("empty")).unwrap();
        let cache = tempfile::tempdir().unwrap();

        let result = upload_directory(
            dyn_store,
            dir.path(),
            &cache.path().join(".objectlist"),
            &UploadConfig::default(),
            0,
        )
        .await
        .unwrap();

        assert_eq!(result.manifest.entries[0].digest, EMPTY_DIGEST);
        assert_eq!(*result.stats.counts.get(&FileOutcome::Inlined).unwrap(), 1);
        assert_eq!(store.version_count(&format!("objects/{}", EMPTY_DIGEST)), 0);
    }

    #[test]
    fn dupes_report_finds_duplicate_content() {
        let mut m = Manifest::new();
        m.add("h1", "a.txt", 0o644);
        m.add("h1", "b.txt", 0o644);
        m.add("h2", "c.txt", 0o644);
        let mut sizes = HashMap::new();
        sizes.insert("h1".to_owned(), 100);
        sizes.insert("h2".to_owned(), 50);

        let groups = dupes_report(&m, &sizes);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].digest, "h1");
        assert_eq!(groups[0].relpaths.len(), 2);
    }
}
