//! Reaper: scans every object version in the store, classifies each into
//! live / old-and-unknown / superseded-duplicate, batch-deletes what's
//! purgeable, and rewrites the known-blobs snapshot from the survivors.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hashsync_objectlist::ObjectList;
use hashsync_store::{RemoteStore, VersionEntry};
use log::{info, warn};
use tokio::sync::Semaphore;

/// How long a surviving-but-unreferenced blob is kept before it becomes
/// eligible for the "old" deletion path.
pub const PURGE_TIME: i64 = 30 * 86_400;

const OBJECTS_PREFIX: &str = "objects/";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] hashsync_store::Error),
    #[error("objectlist error: {0}")]
    Objectlist(#[from] hashsync_objectlist::Error),
}

#[derive(Debug, Clone)]
pub struct ReapConfig {
    pub cutoff: i64,
    pub purge_time: i64,
    pub batch_size: usize,
    pub pool_size: usize,
    pub delete_sleep: Duration,
}

impl ReapConfig {
    pub fn new(cutoff: i64) -> Self {
        ReapConfig {
            cutoff,
            purge_time: PURGE_TIME,
            batch_size: 1000,
            pool_size: 8,
            delete_sleep: Duration::from_secs(5),
        }
    }
}

/// Default cutoff used by the CLI when none is given: `now - 7 days`.
pub fn default_cutoff(now: i64) -> i64 {
    now - 7 * 86_400
}

#[derive(Debug, Clone, Default)]
pub struct ReapStats {
    pub live_digests: u64,
    pub deleted_old: u64,
    pub deleted_duplicate: u64,
    pub failed_batches: u64,
}

fn digest_of_key(key: &str) -> &str {
    key.strip_prefix(OBJECTS_PREFIX).unwrap_or(key)
}

pub async fn reap(
    store: Arc<dyn RemoteStore>,
    cache_path: &Path,
    config: &ReapConfig,
    now: i64,
) -> Result<ReapStats, Error> {
    let known_old = hashsync_objectlist::load(store.as_ref(), cache_path).await?;
    let versions = store.list_versions().await?;

    let mut by_key: HashMap<&str, Vec<&VersionEntry>> = HashMap::new();
    for v in &versions {
        by_key.entry(v.key.as_str()).or_default().push(v);
    }

    let mut known_new = ObjectList::new();
    let mut to_delete: HashSet<(String, String)> = HashSet::new();
    let mut stats = ReapStats::default();

    for (key, mut entries) in by_key {
        let digest = digest_of_key(key);

        for v in &entries {
            if v.last_modified >= config.cutoff {
                known_new.add(digest.to_owned());
            } else if !known_old.contains(digest) && v.last_modified <= now - config.purge_time {
                if to_delete.insert((key.to_owned(), v.version_id.clone())) {
                    stats.deleted_old += 1;
                }
            }
        }

        // duplicate-version cleanup: every version but the newest is
        // purgeable, independent of age. ties broken by version_id for
        // a deterministic "newest".
        entries.sort_by_key(|v| (v.last_modified, v.version_id.clone()));
        for v in &entries[..entries.len().saturating_sub(1)] {
            if to_delete.insert((key.to_owned(), v.version_id.clone())) {
                stats.deleted_duplicate += 1;
            }
        }
    }
    stats.live_digests = known_new.len() as u64;

    let batches: Vec<Vec<(String, String)>> = to_delete
        .into_iter()
        .collect::<Vec<_>>()
        .chunks(config.batch_size.max(1))
        .map(|c| c.to_vec())
        .collect();

    if !batches.is_empty() {
        let semaphore = Arc::new(Semaphore::new(config.pool_size.max(1)));
        let mut set = tokio::task::JoinSet::new();
        for batch in batches {
            let semaphore = semaphore.clone();
            let store = store.clone();
            let sleep_for = config.delete_sleep;
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                tokio::time::sleep(sleep_for).await;
                store.delete_batch(&batch).await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("delete batch failed: {}", e);
                    stats.failed_batches += 1;
                }
                Err(e) => {
                    warn!("delete batch task panicked: {}", e);
                    stats.failed_batches += 1;
                }
            }
        }
    }

    // the known-blobs snapshot reflects the survivors computed before
    // deletion, so it stays valid even if some batches above failed
    hashsync_objectlist::save(store.as_ref(), &known_new).await?;

    info!(
        "reap stats: live={} deleted_old={} deleted_duplicate={}",
        stats.live_digests, stats.deleted_old, stats.deleted_duplicate
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashsync_store::InMemoryStore;

    #[tokio::test]
    async fn live_version_is_kept_and_recorded() {
        let store = InMemoryStore::new();
        store.seed("objects/aaaa", 1_000, b"data");
        let store: Arc<dyn RemoteStore> = Arc::new(store);

        let cache = tempfile::tempdir().unwrap();
        let config = ReapConfig {
            cutoff: 500,
            purge_time: PURGE_TIME,
            batch_size: 1000,
            pool_size: 8,
            delete_sleep: Duration::from_millis(0),
        };

        let stats = reap(store.clone(), &cache.path().join(".objectlist"), &config, 2_000)
            .await
            .unwrap();

        assert_eq!(stats.live_digests, 1);
        assert_eq!(stats.deleted_old, 0);
    }

    #[tokio::test]
    async fn old_unknown_version_past_purge_window_is_deleted() {
        let store = InMemoryStore::new();
        store.seed("objects/bbbb", 0, b"data");
        let inner = Arc::new(store);
        let store: Arc<dyn RemoteStore> = inner.clone();

        let cache = tempfile::tempdir().unwrap();
        let config = ReapConfig {
            cutoff: 1_000_000,
            purge_time: 100,
            batch_size: 1000,
            pool_size: 8,
            delete_sleep: Duration::from_millis(0),
        };

        let now = 1_000_000_000;
        let stats = reap(store, &cache.path().join(".objectlist"), &config, now)
            .await
            .unwrap();

        assert_eq!(stats.deleted_old, 1);
        assert_eq!(inner.version_count("objects/bbbb"), 0);
    }

    #[tokio::test]
    async fn known_old_digest_is_not_purged_even_if_stale() {
        let store = InMemoryStore::new();
        store.seed("objects/cccc", 0, b"data");
        let inner = Arc::new(store);

        let cache_dir = tempfile::tempdir().unwrap();
        let cache_path = cache_dir.path().join(".objectlist");

        let mut known = ObjectList::new();
        known.add("cccc");
        hashsync_objectlist::save(inner.as_ref(), &known).await.unwrap();

        let store: Arc<dyn RemoteStore> = inner.clone();
        let config = ReapConfig {
            cutoff: 1_000_000_000,
            purge_time: 100,
            batch_size: 1000,
            pool_size: 8,
            delete_sleep: Duration::from_millis(0),
        };

        let stats = reap(store, &cache_path, &config, 1_000_000_000).await.unwrap();
        assert_eq!(stats.deleted_old, 0);
        assert_eq!(inner.version_count("objects/cccc"), 1);
    }

    #[tokio::test]
    async fn only_newest_of_duplicate_versions_survives() {
        let store = InMemoryStore::new();
        store.seed("objects/dddd", 100, b"v1");
        store.seed("objects/dddd", 200, b"v2");
        store.seed("objects/dddd", 300, b"v3");
        let inner = Arc::new(store);
        let store: Arc<dyn RemoteStore> = inner.clone();

        let cache = tempfile::tempdir().unwrap();
        let config = ReapConfig {
            cutoff: 250,
            purge_time: PURGE_TIME,
            batch_size: 1000,
            pool_size: 8,
            delete_sleep: Duration::from_millis(0),
        };

        let stats = reap(store, &cache.path().join(".objectlist"), &config, 1_000).await.unwrap();
        assert_eq!(stats.deleted_duplicate, 2);
        assert_eq!(inner.version_count("objects/dddd"), 1);
    }
}
