//! Upload-one-blob / download-one-blob primitives: digest-as-key,
//! existence-by-age refresh protocol, gzip-if-it-helps encoding.

use std::path::Path;

use hashsync_compress as compress;
use hashsync_store::{Acl, PutOptions, RemoteStore, StorageClass};
use log::{debug, info};
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("remote store error: {0}")]
    Store(#[from] hashsync_store::Error),
    #[error("compression error: {0}")]
    Compress(#[from] compress::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object not found: {0}")]
    NotFound(String),
}

/// Minimum time an object must sit before it's eligible for a refresh copy
/// (hashsync.config.REFRESH_MINTIME).
pub const REFRESH_MINTIME: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub refresh_mintime: i64,
    pub compress_minsize: u64,
    pub storage_class: StorageClass,
    pub acl: Acl,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            refresh_mintime: REFRESH_MINTIME,
            compress_minsize: compress::COMPRESS_MINSIZE,
            storage_class: StorageClass::ReducedRedundancy,
            acl: Acl::PublicRead,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Uploaded,
    Refreshed,
    Skipped,
    Inlined,
}

/// Uploads (or refreshes, or skips) the blob at `local_path` under
/// `object_key`. `now` is unix seconds, threaded through explicitly so
/// callers (and tests) control the refresh-eligibility clock rather than
/// this function reading it from the OS.
pub async fn upload_blob(
    store: &dyn RemoteStore,
    local_path: &Path,
    object_key: &str,
    now: i64,
    config: &TransferConfig,
) -> Result<Outcome, Error> {
    let metadata = tokio::fs::metadata(local_path).await?;
    if metadata.len() == 0 {
        debug!("{} is 0 bytes, inlining instead of uploading", object_key);
        return Ok(Outcome::Inlined);
    }

    if let Some(head) = store.head(object_key).await? {
        if head.last_modified > now - config.refresh_mintime {
            debug!(
                "{} was uploaded recently ({}), skipping",
                object_key, head.last_modified
            );
            return Ok(Outcome::Skipped);
        }

        info!("refreshing {} (last modified {})", object_key, head.last_modified);
        match store.copy(object_key, config.storage_class).await {
            Ok(()) => return Ok(Outcome::Refreshed),
            // a concurrent reaper may have deleted the key between head and
            // copy; fall through to a full upload
            Err(hashsync_store::Error::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let (mut source, compressed) =
        compress::maybe_compress(local_path, config.compress_minsize)?;
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut source, &mut buf)?;

    let opts = PutOptions {
        content_encoding: compressed.then(|| "gzip".to_owned()),
        storage_class: config.storage_class,
        acl: config.acl,
    };
    store
        .put(object_key, Box::new(std::io::Cursor::new(buf)), opts)
        .await?;
    info!("uploaded {} ({})", local_path.display(), object_key);
    Ok(Outcome::Uploaded)
}

/// Downloads `object_key` into `local_path`, decoding gzip content-encoding
/// if present. Fails with `Error::NotFound` if the object no longer exists;
/// no automatic retry.
pub async fn download_blob(
    store: &dyn RemoteStore,
    object_key: &str,
    local_path: &Path,
) -> Result<(), Error> {
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut got = store
        .get(object_key)
        .await
        .map_err(|e| match e {
            hashsync_store::Error::NotFound(k) => Error::NotFound(k),
            other => Error::Store(other),
        })?;

    let mut raw = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut got.body, &mut raw).await?;

    let data = if got.content_encoding.as_deref() == Some("gzip") {
        compress::decode_from_blob(&raw)?
    } else {
        raw
    };

    let mut f = tokio::fs::File::create(local_path).await?;
    f.write_all(&data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashsync_store::InMemoryStore;

    #[tokio::test]
    async fn zero_byte_file_is_inlined_without_a_put() {
        let store = InMemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::File::create(&path).unwrap();

        let outcome = upload_blob(&store, &path, "objects/empty", 0, &TransferConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Inlined);
        assert!(store.head("objects/empty").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_upload_then_skip_within_refresh_window() {
        let store = InMemoryStore::new();
        store.set_clock(1_000);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let outcome = upload_blob(&store, &path, "objects/abc", 1_000, &TransferConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Uploaded);

        let outcome = upload_blob(&store, &path, "objects/abc", 1_500, &TransferConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped);
    }

    #[tokio::test]
    async fn stale_upload_is_refreshed_not_reuploaded() {
        let store = InMemoryStore::new();
        store.set_clock(0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello world").unwrap();

        upload_blob(&store, &path, "objects/abc", 0, &TransferConfig::default())
            .await
            .unwrap();

        let config = TransferConfig::default();
        let later = config.refresh_mintime + 10;
        store.set_clock(later);
        let outcome = upload_blob(&store, &path, "objects/abc", later, &config)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Refreshed);
        assert_eq!(store.version_count("objects/abc"), 2);
    }

    #[tokio::test]
    async fn download_round_trips_bytes() {
        let store = InMemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello world").unwrap();

        upload_blob(&store, &path, "objects/abc", 0, &TransferConfig::default())
            .await
            .unwrap();

        let destdir = tempfile::tempdir().unwrap();
        let dest = destdir.path().join("nested/out.txt");
        download_blob(&store, "objects/abc", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn download_missing_object_is_not_found() {
        let store = InMemoryStore::new();
        let destdir = tempfile::tempdir().unwrap();
        let dest = destdir.path().join("out.txt");
        let err = download_blob(&store, "objects/missing", &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
