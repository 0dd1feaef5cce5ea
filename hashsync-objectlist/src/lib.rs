use std::collections::HashSet;
use std::path::Path;

use hashsync_compress as compress;
use hashsync_store::{Acl, PutOptions, RemoteStore, StorageClass};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

pub const OBJECTLIST_KEY: &str = "objectlist";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("remote store error: {0}")]
    Store(#[from] hashsync_store::Error),
    #[error("compression error: {0}")]
    Compress(#[from] compress::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Set of digests known to exist in the remote store as of the last
/// curator run.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    objects: HashSet<String>,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    etag: String,
    objects: Vec<String>,
}

impl ObjectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.objects.contains(digest)
    }

    pub fn add(&mut self, digest: impl Into<String>) {
        self.objects.insert(digest.into());
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.objects.iter()
    }
}

/// Corruption or absence of the local `.objectlist` cache file is a soft
/// miss, never an error.
fn try_load_cache(path: &Path, etag: &str) -> Option<ObjectList> {
    let data = std::fs::read(path).ok()?;
    let cached: CacheFile = serde_json::from_slice(&data).ok()?;
    if cached.etag != etag {
        return None;
    }
    info!("loaded {} objects from local cache", cached.objects.len());
    Some(ObjectList {
        objects: cached.objects.into_iter().collect(),
    })
}

fn save_cache(path: &Path, etag: &str, objects: &ObjectList) {
    let cache = CacheFile {
        etag: etag.to_owned(),
        objects: objects.objects.iter().cloned().collect(),
    };
    if let Ok(data) = serde_json::to_vec(&cache) {
        let _ = std::fs::write(path, data);
    }
}

/// Loads the known-blobs set, preferring the etag-keyed local cache over a
/// remote fetch.
pub async fn load(store: &dyn RemoteStore, cache_path: &Path) -> Result<ObjectList, Error> {
    let head = match store.head(OBJECTLIST_KEY).await? {
        Some(head) => head,
        None => return Ok(ObjectList::new()),
    };

    if let Some(cached) = try_load_cache(cache_path, &head.etag) {
        return Ok(cached);
    }

    let mut got = store.get(OBJECTLIST_KEY).await?;
    let mut raw = Vec::new();
    got.body.read_to_end(&mut raw).await?;

    let is_gzip_encoded =
        got.content_encoding.as_deref() == Some("gzip") || compress::is_gzip(&raw);
    let data = if is_gzip_encoded {
        compress::decode_from_blob(&raw)?
    } else {
        raw
    };

    let text = String::from_utf8_lossy(&data);
    let objects: HashSet<String> = text
        .split('\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    info!(
        "loaded {} objects from {}/{}",
        objects.len(),
        "remote",
        OBJECTLIST_KEY
    );

    let list = ObjectList { objects };
    save_cache(cache_path, &head.etag, &list);
    Ok(list)
}

/// Serializes as sorted, newline-joined ASCII, gzip-encodes, and writes
/// back to the remote store under `objectlist`.
pub async fn save(store: &dyn RemoteStore, list: &ObjectList) -> Result<(), Error> {
    let mut sorted: Vec<&String> = list.objects.iter().collect();
    sorted.sort();
    let joined = sorted
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let compressed = compress::encode_to_blob(joined.as_bytes())?;

    store
        .put(
            OBJECTLIST_KEY,
            Box::new(std::io::Cursor::new(compressed)),
            PutOptions {
                content_encoding: Some("gzip".to_owned()),
                storage_class: StorageClass::Standard,
                acl: Acl::Private,
            },
        )
        .await?;
    info!("wrote {} objects to {}", list.len(), OBJECTLIST_KEY);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashsync_store::InMemoryStore;

    #[tokio::test]
    async fn round_trips_through_remote() {
        let store = InMemoryStore::new();
        let mut list = ObjectList::new();
        list.add("digest1");
        list.add("digest2");

        save(&store, &list).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".objectlist");
        let loaded = load(&store, &cache_path).await.unwrap();
        assert!(loaded.contains("digest1"));
        assert!(loaded.contains("digest2"));
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn missing_remote_object_yields_empty_set() {
        let store = InMemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".objectlist");
        let loaded = load(&store, &cache_path).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn corrupt_cache_file_is_a_soft_miss() {
        let store = InMemoryStore::new();
        let mut list = ObjectList::new();
        list.add("digest1");
        save(&store, &list).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".objectlist");
        std::fs::write(&cache_path, b"not json").unwrap();

        // should fall through to a remote fetch rather than erroring
        let loaded = load(&store, &cache_path).await.unwrap();
        assert!(loaded.contains("digest1"));
    }

    #[tokio::test]
    async fn stale_etag_triggers_remote_refetch() {
        let store = InMemoryStore::new();
        let mut list = ObjectList::new();
        list.add("digest1");
        save(&store, &list).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".objectlist");
        let stale = CacheFile {
            etag: "not-the-real-etag".to_owned(),
            objects: vec!["stale-digest".to_owned()],
        };
        std::fs::write(&cache_path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let loaded = load(&store, &cache_path).await.unwrap();
        assert!(loaded.contains("digest1"));
        assert!(!loaded.contains("stale-digest"));
    }
}
