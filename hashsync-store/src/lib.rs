//! `RemoteStore` is the external collaborator trait: a
//! versioned object store exposing head/get/put/copy/list-versions/delete.
//! `S3Store` is the concrete implementation against AWS S3; `InMemoryStore`
//! (feature `testing`) is a fake used by this crate's tests and by the
//! transfer/planner/reaper crates built on top of this trait.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("s3 error: {0}")]
    S3(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Standard,
    ReducedRedundancy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acl {
    Private,
    PublicRead,
}

/// Result of `head`: metadata probe for an existing object.
#[derive(Debug, Clone)]
pub struct HeadObject {
    pub last_modified: i64,
    pub content_encoding: Option<String>,
    pub etag: String,
}

/// Result of `get`: a readable body plus the encoding metadata needed to
/// decide whether to run it through `decode_stream`.
pub struct GetObject {
    pub content_encoding: Option<String>,
    pub body: Box<dyn AsyncRead + Unpin + Send>,
}

#[derive(Debug, Clone)]
pub struct PutOptions {
    pub content_encoding: Option<String>,
    pub storage_class: StorageClass,
    pub acl: Acl,
}

impl Default for PutOptions {
    fn default() -> Self {
        PutOptions {
            content_encoding: None,
            storage_class: StorageClass::ReducedRedundancy,
            acl: Acl::PublicRead,
        }
    }
}

/// One object version as returned by `list_versions`. Delete markers are
/// filtered out by implementations rather than surfaced.
#[derive(Debug, Clone)]
pub struct VersionEntry {
    pub key: String,
    pub version_id: String,
    pub last_modified: i64,
}

/// The minimum set of remote object store operations consumed by the
/// transfer layer and the reaper.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn head(&self, key: &str) -> Result<Option<HeadObject>, Error>;

    async fn get(&self, key: &str) -> Result<GetObject, Error>;

    async fn put(
        &self,
        key: &str,
        body: Box<dyn AsyncRead + Unpin + Send>,
        opts: PutOptions,
    ) -> Result<(), Error>;

    /// Server-side self-copy of `key` onto itself, bumping `last_modified`
    /// without re-uploading bytes.
    async fn copy(&self, key: &str, storage_class: StorageClass) -> Result<(), Error>;

    /// Total scan of every live version of every object, excluding delete
    /// markers.
    async fn list_versions(&self) -> Result<Vec<VersionEntry>, Error>;

    async fn delete(&self, key: &str, version_id: &str) -> Result<(), Error>;

    async fn delete_batch(&self, items: &[(String, String)]) -> Result<(), Error>;
}

pub mod s3;
pub use s3::S3Store;

#[cfg(feature = "testing")]
pub mod testing;
#[cfg(feature = "testing")]
pub use testing::InMemoryStore;

pub(crate) fn bytes_to_async_read(bytes: Bytes) -> Box<dyn AsyncRead + Unpin + Send> {
    Box::new(io::Cursor::new(bytes.to_vec()))
}
