//! A fake `RemoteStore` backed by an in-process map, used by this crate's
//! tests and by the transfer/upload/download/reap crates' test suites so
//! they don't need live AWS credentials.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, GetObject, HeadObject, PutOptions, RemoteStore, StorageClass, VersionEntry};

#[derive(Clone)]
struct StoredVersion {
    version_id: String,
    last_modified: i64,
    content_encoding: Option<String>,
    data: Vec<u8>,
}

pub struct InMemoryStore {
    // key -> versions, newest last
    objects: Mutex<HashMap<String, Vec<StoredVersion>>>,
    clock: Mutex<i64>,
    next_version: Mutex<u64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            objects: Mutex::new(HashMap::new()),
            clock: Mutex::new(0),
            next_version: Mutex::new(0),
        }
    }

    /// Lets tests control `last_modified` without relying on wall-clock time.
    pub fn set_clock(&self, now: i64) {
        *self.clock.lock().unwrap() = now;
    }

    pub fn advance_clock(&self, delta: i64) {
        *self.clock.lock().unwrap() += delta;
    }

    fn now(&self) -> i64 {
        *self.clock.lock().unwrap()
    }

    fn next_version_id(&self) -> String {
        let mut n = self.next_version.lock().unwrap();
        *n += 1;
        format!("v{}", n)
    }

    /// Directly seeds an object version, for reaper tests that need
    /// specific `(key, last_modified)` fixtures.
    pub fn seed(&self, key: &str, last_modified: i64, data: &[u8]) -> String {
        let version_id = self.next_version_id();
        self.objects
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_default()
            .push(StoredVersion {
                version_id: version_id.clone(),
                last_modified,
                content_encoding: None,
                data: data.to_vec(),
            });
        version_id
    }

    pub fn version_count(&self, key: &str) -> usize {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl RemoteStore for InMemoryStore {
    async fn head(&self, key: &str) -> Result<Option<HeadObject>, Error> {
        let objects = self.objects.lock().unwrap();
        Ok(objects.get(key).and_then(|versions| versions.last()).map(|v| HeadObject {
            last_modified: v.last_modified,
            content_encoding: v.content_encoding.clone(),
            etag: v.version_id.clone(),
        }))
    }

    async fn get(&self, key: &str) -> Result<GetObject, Error> {
        let objects = self.objects.lock().unwrap();
        let version = objects
            .get(key)
            .and_then(|versions| versions.last())
            .ok_or_else(|| Error::NotFound(key.to_owned()))?;
        Ok(GetObject {
            content_encoding: version.content_encoding.clone(),
            body: crate::bytes_to_async_read(bytes::Bytes::from(version.data.clone())),
        })
    }

    async fn put(
        &self,
        key: &str,
        mut body: Box<dyn AsyncRead + Unpin + Send>,
        opts: PutOptions,
    ) -> Result<(), Error> {
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        let version_id = self.next_version_id();
        let now = self.now();
        self.objects
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_default()
            .push(StoredVersion {
                version_id,
                last_modified: now,
                content_encoding: opts.content_encoding,
                data,
            });
        Ok(())
    }

    async fn copy(&self, key: &str, _storage_class: StorageClass) -> Result<(), Error> {
        let mut objects = self.objects.lock().unwrap();
        let versions = objects
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_owned()))?;
        let latest = versions
            .last()
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_owned()))?;
        let version_id = self.next_version_id();
        let now = *self.clock.lock().unwrap();
        versions.push(StoredVersion {
            version_id,
            last_modified: now,
            content_encoding: latest.content_encoding,
            data: latest.data,
        });
        Ok(())
    }

    async fn list_versions(&self) -> Result<Vec<VersionEntry>, Error> {
        let objects = self.objects.lock().unwrap();
        let mut out = Vec::new();
        for (key, versions) in objects.iter() {
            if key.starts_with("objectlist") {
                continue;
            }
            for v in versions {
                out.push(VersionEntry {
                    key: key.clone(),
                    version_id: v.version_id.clone(),
                    last_modified: v.last_modified,
                });
            }
        }
        Ok(out)
    }

    async fn delete(&self, key: &str, version_id: &str) -> Result<(), Error> {
        let mut objects = self.objects.lock().unwrap();
        if let Some(versions) = objects.get_mut(key) {
            versions.retain(|v| v.version_id != version_id);
            if versions.is_empty() {
                objects.remove(key);
            }
        }
        Ok(())
    }

    async fn delete_batch(&self, items: &[(String, String)]) -> Result<(), Error> {
        for (key, version_id) in items {
            self.delete(key, version_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryStore::new();
        store
            .put(
                "objects/abc",
                Box::new(std::io::Cursor::new(b"hello".to_vec())),
                PutOptions::default(),
            )
            .await
            .unwrap();

        let head = store.head("objects/abc").await.unwrap().unwrap();
        assert_eq!(head.content_encoding, None);

        let mut got = store.get("objects/abc").await.unwrap();
        let mut buf = Vec::new();
        got.body.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn copy_bumps_last_modified_without_changing_bytes() {
        let store = InMemoryStore::new();
        store.set_clock(100);
        store
            .put(
                "objects/abc",
                Box::new(std::io::Cursor::new(b"hello".to_vec())),
                PutOptions::default(),
            )
            .await
            .unwrap();

        store.set_clock(200);
        store.copy("objects/abc", StorageClass::ReducedRedundancy).await.unwrap();

        let head = store.head("objects/abc").await.unwrap().unwrap();
        assert_eq!(head.last_modified, 200);
        assert_eq!(store.version_count("objects/abc"), 2);
    }
}
