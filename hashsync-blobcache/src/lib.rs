//! Content-addressed local blob cache: two-level fan-out on the
//! first two hex chars of the digest, membership by filesystem existence,
//! no eviction. Writes go to a tmp file first and get renamed into place
//! via `tempfile::NamedTempFile`, so a writer that dies midway never leaves
//! a partial blob visible under its digest.

use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("digest {0:?} is too short for fan-out")]
    DigestTooShort(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("persist error: {0}")]
    Persist(#[from] tempfile::PersistError),
}

pub struct BlobCache {
    root: PathBuf,
}

/// An in-progress write into the cache. Drop without calling `persist`
/// unlinks the temp file (`tempfile::NamedTempFile`'s own drop behavior).
pub struct CacheWriter {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl CacheWriter {
    pub fn file_mut(&mut self) -> &mut std::fs::File {
        self.tmp.as_file_mut()
    }

    pub fn persist(self) -> Result<(), Error> {
        self.tmp.persist(&self.target)?;
        Ok(())
    }
}

fn fan_out(digest: &str) -> Result<(&str, &str), Error> {
    if digest.len() < 2 {
        return Err(Error::DigestTooShort(digest.to_owned()));
    }
    Ok((&digest[0..1], &digest[1..2]))
}

impl BlobCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BlobCache { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, digest: &str) -> Result<PathBuf, Error> {
        let (a, b) = fan_out(digest)?;
        Ok(self.root.join(a).join(b).join(digest))
    }

    pub fn contains(&self, digest: &str) -> bool {
        match self.path_for(digest) {
            Ok(path) => path.exists(),
            Err(_) => false,
        }
    }

    /// Creates parent directories of `dest` and copies the cached blob to it.
    /// Does not chmod; permission application is the download planner's job.
    pub fn materialize(&self, digest: &str, dest: &Path) -> Result<(), Error> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(self.path_for(digest)?, dest)?;
        Ok(())
    }

    /// Opens a write handle for a not-yet-cached blob. The caller writes
    /// into `file_mut()` then calls `persist()` to atomically install it;
    /// dropping without persisting leaves no trace in the cache.
    pub fn create_writer(&self, digest: &str) -> Result<CacheWriter, Error> {
        let target = self.path_for(digest)?;
        let dir = target.parent().expect("path_for always has a parent");
        std::fs::create_dir_all(dir)?;
        let tmp = NamedTempFile::new_in(dir)?;
        Ok(CacheWriter { tmp, target })
    }
}
