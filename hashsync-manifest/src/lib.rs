use std::io::{Read, Write};

use hashsync_compress as compress;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("compression error: {0}")]
    Compress(#[from] compress::Error),
    #[error("invalid manifest json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One `(digest, relpath, perms)` triple. `perms` is the low 9 bits of the
/// POSIX mode. Serialized as a 3-element JSON array, not an object, to
/// match the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawEntry", into = "RawEntry")]
pub struct ManifestEntry {
    pub digest: String,
    pub relpath: String,
    pub perms: u16,
}

#[derive(Serialize, Deserialize)]
struct RawEntry(String, String, u16);

impl From<RawEntry> for ManifestEntry {
    fn from(raw: RawEntry) -> Self {
        ManifestEntry {
            digest: raw.0,
            relpath: raw.1,
            perms: raw.2 & 0o777,
        }
    }
}

impl From<ManifestEntry> for RawEntry {
    fn from(entry: ManifestEntry) -> Self {
        RawEntry(entry.digest, entry.relpath, entry.perms & 0o777)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, digest: impl Into<String>, relpath: impl Into<String>, perms: u16) {
        self.entries.push(ManifestEntry {
            digest: digest.into(),
            relpath: relpath.into(),
            perms: perms & 0o777,
        });
    }

    /// Serializes as a JSON array of 3-tuples, optionally gzip-wrapped.
    pub fn save(&self, writer: &mut impl Write, gzip: bool) -> Result<(), Error> {
        let json = serde_json::to_vec(&self.entries)?;
        if gzip {
            compress::encode_stream(&mut std::io::Cursor::new(json), writer)?;
        } else {
            writer.write_all(&json)?;
        }
        Ok(())
    }

    /// Reads all bytes from `reader`, auto-detects a gzip envelope via the
    /// magic-byte probe, and parses the JSON array.
    pub fn load(reader: &mut impl Read) -> Result<Manifest, Error> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;

        let json = if compress::is_gzip(&raw) {
            compress::decode_from_blob(&raw)?
        } else {
            raw
        };

        let entries: Vec<ManifestEntry> = serde_json::from_slice(&json)?;
        Ok(Manifest { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_preserves_entries() {
        let mut m = Manifest::new();
        m.add("hash1", "dirname/\u{2603}", 0o644);
        m.add("hash2", "dirname/file with space.txt", 0o755);

        let mut buf = Vec::new();
        m.save(&mut buf, false).unwrap();

        let loaded = Manifest::load(&mut Cursor::new(buf)).unwrap();
        assert_eq!(loaded, m);
    }

    #[test]
    fn save_emits_plain_3_tuple_json() {
        let mut m = Manifest::new();
        m.add("hash1", "dirname/foo", 420);
        let mut buf = Vec::new();
        m.save(&mut buf, false).unwrap();
        assert_eq!(buf, br#"[["hash1","dirname/foo",420]]"#);
    }

    #[test]
    fn load_accepts_plain_json() {
        let data = br#"[["hash1","dirname/foo",420],["hash2","dirname/bar",493]]"#;
        let m = Manifest::load(&mut Cursor::new(data.to_vec())).unwrap();
        assert_eq!(m.entries[0].perms, 0o644);
        assert_eq!(m.entries[1].perms, 0o755);
    }

    #[test]
    fn load_accepts_gzip_wrapped_json() {
        let mut m = Manifest::new();
        m.add("hash1", "dirname/foo", 0o644);
        let mut buf = Vec::new();
        m.save(&mut buf, true).unwrap();
        assert!(compress::is_gzip(&buf));

        let loaded = Manifest::load(&mut Cursor::new(buf)).unwrap();
        assert_eq!(loaded, m);
    }

    #[test]
    fn perms_are_masked_to_9_bits() {
        let mut m = Manifest::new();
        m.add("hash1", "foo", 0o120644); // stray high bits from st_mode
        assert_eq!(m.entries[0].perms, 0o644);
    }
}
