use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeZone, Utc};
use log::warn;
use sha1::{Digest, Sha1};

/// sha1 of zero bytes. Never uploaded or fetched as a remote blob.
pub const EMPTY_DIGEST: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

const BLOCK_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse date {0:?}")]
    BadDate(String),
}

/// Streams `path` through sha1 in 1 MiB blocks, returns lowercase hex.
pub fn digest_file(path: &Path) -> Result<String, Error> {
    let mut f = File::open(path).map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = f.read(&mut buf).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One entry from a tree walk: absolute path and its digest.
pub type WalkEntry = (PathBuf, String);

/// In-order walk of `root`: directories and files sorted lexicographically
/// before descending, matching `os.walk` + `dirs.sort()` + `sorted(files)`
/// in the original `traverse_directory`. Symlinks and special files are
/// skipped with a warning.
pub fn walk_tree(root: &Path) -> Result<Vec<WalkEntry>, Error> {
    let mut out = Vec::new();
    walk_tree_into(root, &mut out)?;
    Ok(out)
}

fn walk_tree_into(dir: &Path, out: &mut Vec<WalkEntry>) -> Result<(), Error> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|source| Error::Io {
            path: dir.to_owned(),
            source,
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| Error::Io {
            path: dir.to_owned(),
            source,
        })?;
    entries.sort_by_key(|e| e.file_name());

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(source) => {
                return Err(Error::Io { path, source });
            }
        };
        if file_type.is_symlink() {
            warn!("skipping symlink {}", path.display());
            continue;
        } else if file_type.is_dir() {
            dirs.push(path);
        } else if file_type.is_file() {
            files.push(path);
        } else {
            warn!("skipping special file {}", path.display());
        }
    }

    for path in files {
        match digest_file(&path) {
            Ok(digest) => out.push((path, digest)),
            Err(e) => warn!("skipping unreadable file {}: {}", path.display(), e),
        }
    }
    for path in dirs {
        walk_tree_into(&path, out)?;
    }
    Ok(())
}

/// Strips `root` plus a separator from `abs`, yielding a forward-slash relpath.
pub fn strip_prefix(root: &Path, abs: &Path) -> String {
    let root_s = root.to_string_lossy();
    let abs_s = abs.to_string_lossy();
    let n = if root_s.ends_with('/') {
        root_s.len()
    } else {
        root_s.len() + 1
    };
    abs_s[n.min(abs_s.len())..].replace('\\', "/")
}

/// Parses either an ISO-8601 `YYYY-MM-DDTHH:MM:SS` prefix or an RFC-2822
/// timestamp, returning unix seconds.
pub fn parse_http_date(s: &str) -> Result<i64, Error> {
    let head: String = s.chars().take(19).collect();
    if let Ok(naive) = NaiveDateTime::parse_from_str(&head, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive).timestamp());
    }
    chrono::DateTime::parse_from_rfc2822(s)
        .map(|dt| dt.timestamp())
        .map_err(|_| Error::BadDate(s.to_owned()))
}
