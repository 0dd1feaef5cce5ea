use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Minimum filesize to try compressing (hashsync.config.COMPRESS_MINSIZE).
pub const COMPRESS_MINSIZE: u64 = 1024;

/// Files larger than this spill to a temporary file while compressing
/// instead of compressing in memory (hashsync.config.COMPRESS_INMEM_SIZE).
pub const COMPRESS_INMEM_SIZE: u64 = 100 * 1024 * 1024;

pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

const BLOCK_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == GZIP_MAGIC[0] && bytes[1] == GZIP_MAGIC[1]
}

/// Streams gzip-compressed `src` into `dst`, 1 MiB blocks.
pub fn encode_stream(src: &mut impl Read, dst: impl Write) -> Result<(), Error> {
    let mut gz = GzEncoder::new(dst, Compression::default());
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        gz.write_all(&buf[..n])?;
    }
    gz.finish()?;
    Ok(())
}

/// Streams gzip-decompressed `src` into `dst`, 1 MiB blocks.
pub fn decode_stream(src: impl Read, dst: &mut impl Write) -> Result<(), Error> {
    let mut gz = GzDecoder::new(src);
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = gz.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
    }
    Ok(())
}

pub fn encode_to_blob(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    encode_stream(&mut Cursor::new(bytes), &mut out)?;
    Ok(out)
}

pub fn decode_from_blob(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    decode_stream(Cursor::new(bytes), &mut out)?;
    Ok(out)
}

/// A readable stream produced by `maybe_compress`: either the raw file or a
/// gzip-compressed rendering of it, kept in memory or spilled to disk
/// depending on size.
pub enum CompressedSource {
    Raw(File),
    InMemory(Cursor<Vec<u8>>),
    Spilled(File),
}

impl Read for CompressedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CompressedSource::Raw(f) => f.read(buf),
            CompressedSource::InMemory(c) => c.read(buf),
            CompressedSource::Spilled(f) => f.read(buf),
        }
    }
}

/// Implements the "gzip if it helps" policy:
/// - below `min_size`, return the raw file unmodified
/// - otherwise compress (spilling to a temp file above
///   `COMPRESS_INMEM_SIZE`) and fall back to raw if compression didn't
///   actually shrink the data
pub fn maybe_compress(path: &Path, min_size: u64) -> Result<(CompressedSource, bool), Error> {
    let size = std::fs::metadata(path)?.len();
    if size < min_size {
        return Ok((CompressedSource::Raw(File::open(path)?), false));
    }

    let mut src = File::open(path)?;
    let (compressed_size, mut source) = if size > COMPRESS_INMEM_SIZE {
        let mut tmp = tempfile::tempfile()?;
        encode_stream(&mut src, &mut tmp)?;
        let compressed_size = tmp.stream_position()?;
        tmp.seek(SeekFrom::Start(0))?;
        (compressed_size, CompressedSource::Spilled(tmp))
    } else {
        let mut out = Vec::new();
        encode_stream(&mut src, &mut out)?;
        let compressed_size = out.len() as u64;
        (compressed_size, CompressedSource::InMemory(Cursor::new(out)))
    };

    if compressed_size >= size {
        return Ok((CompressedSource::Raw(File::open(path)?), false));
    }

    // make sure callers start reading from the beginning
    if let CompressedSource::Spilled(f) = &mut source {
        f.seek(SeekFrom::Start(0))?;
    }
    Ok((source, true))
}
