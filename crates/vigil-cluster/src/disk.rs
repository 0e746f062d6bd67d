//! On-disk formats for raft state.
//!
//! The log is an append-only file of checksummed records:
//!
//! ```text
//! [magic "VLOG"][version u8]
//! [len u32][payload][crc32 u32]
//! [len u32][payload][crc32 u32]
//! ...
//! ```
//!
//! All integers are little-endian. A record cut short at the end of the
//! file is an interrupted append and is ignored; a checksum mismatch is
//! corruption. Small state files (vote, snapshot, peers) are JSON written
//! to a temp file and renamed into place.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use thiserror::Error;

pub const LOG_MAGIC: &[u8; 4] = b"VLOG";

pub const FORMAT_VERSION: u8 = 1;

/// Upper bound on one log record. Entries carry a handful of addresses.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("invalid magic bytes")]
    InvalidMagic,

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("crc32 mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("invalid data in {path}: {reason}")]
    InvalidData { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

/// Appends records to a log file.
#[derive(Debug)]
pub struct LogWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl LogWriter {
    /// Opens (or creates) a log file, writing the header if it is new.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let exists = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        if !exists {
            write_header(&mut writer)?;
            writer.flush()?;
        }
        Ok(Self { writer, path })
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<(), StoreError> {
        write_record(&mut self.writer, payload)
    }

    /// Flushes and fsyncs.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replaces the file's contents with `records`.
    ///
    /// The new log is written beside the old one and renamed over it, so
    /// a crash leaves one or the other intact.
    pub fn rewrite<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<(), StoreError> {
        self.writer.flush()?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            write_header(&mut out)?;
            for payload in records {
                write_record(&mut out, payload)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }
}

/// Iterates over the records of a log file.
#[derive(Debug)]
pub struct LogReader {
    reader: BufReader<File>,
}

impl LogReader {
    /// Opens a log file and validates the header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 4];
        read_exact(&mut reader, &mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(StoreError::InvalidMagic);
        }
        let mut version = [0u8; 1];
        read_exact(&mut reader, &mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(version[0]));
        }
        Ok(Self { reader })
    }

    /// Reads the next record payload, or `None` at the end of usable data.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        match self.read_record() {
            Ok(payload) => Ok(Some(payload)),
            // clean end, or a record cut short by a crash
            Err(StoreError::UnexpectedEof) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_record(&mut self) -> Result<Vec<u8>, StoreError> {
        let mut len = [0u8; 4];
        read_exact(&mut self.reader, &mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_RECORD_LEN {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record length {len} exceeds maximum"),
            )));
        }

        let mut payload = vec![0u8; len];
        read_exact(&mut self.reader, &mut payload)?;

        let mut stored = [0u8; 4];
        read_exact(&mut self.reader, &mut stored)?;
        let expected = u32::from_le_bytes(stored);
        let actual = crc32(&payload);
        if expected != actual {
            return Err(StoreError::ChecksumMismatch { expected, actual });
        }
        Ok(payload)
    }
}

/// Writes `data` to `path` through a temp file and rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}

/// Reads a whole file, treating a missing file as `None`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_header(w: &mut impl Write) -> io::Result<()> {
    w.write_all(LOG_MAGIC)?;
    w.write_all(&[FORMAT_VERSION])
}

fn write_record(w: &mut impl Write, payload: &[u8]) -> Result<(), StoreError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record length {} exceeds u32::MAX", payload.len()),
        )
    })?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)?;
    w.write_all(&crc32(payload).to_le_bytes())?;
    Ok(())
}

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), StoreError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            StoreError::UnexpectedEof
        } else {
            StoreError::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(path: &Path) -> Vec<Vec<u8>> {
        let mut reader = LogReader::open(path).unwrap();
        let mut out = Vec::new();
        while let Some(rec) = reader.next_record().unwrap() {
            out.push(rec);
        }
        out
    }

    #[test]
    fn empty_log_has_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        LogWriter::open(&path).unwrap().sync().unwrap();

        assert!(read_all(&path).is_empty());
    }

    #[test]
    fn appends_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let mut w = LogWriter::open(&path).unwrap();
            w.append(b"one").unwrap();
            w.sync().unwrap();
        }
        {
            let mut w = LogWriter::open(&path).unwrap();
            w.append(b"two").unwrap();
            w.sync().unwrap();
        }

        assert_eq!(read_all(&path), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let mut w = LogWriter::open(&path).unwrap();
            w.append(b"kept").unwrap();
            w.append(b"lost in the crash").unwrap();
            w.sync().unwrap();
        }
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 6]).unwrap();

        assert_eq!(read_all(&path), vec![b"kept".to_vec()]);
    }

    #[test]
    fn corrupt_record_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let mut w = LogWriter::open(&path).unwrap();
            w.append(b"payload").unwrap();
            w.sync().unwrap();
        }
        let mut data = fs::read(&path).unwrap();
        // flip a payload byte: header(5) + len(4)
        data[9] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        let err = reader.next_record().unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn wrong_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, b"NOPE\x01").unwrap();

        assert!(matches!(
            LogReader::open(&path).unwrap_err(),
            StoreError::InvalidMagic
        ));
    }

    #[test]
    fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut w = LogWriter::open(&path).unwrap();
        w.append(b"a").unwrap();
        w.append(b"b").unwrap();
        w.append(b"c").unwrap();

        w.rewrite([&b"b"[..], &b"c"[..]]).unwrap();
        w.append(b"d").unwrap();
        w.sync().unwrap();

        assert_eq!(
            read_all(&path),
            vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn atomic_write_and_optional_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vote.json");
        assert_eq!(read_optional(&path).unwrap(), None);

        write_atomic(&path, b"{\"term\":1}").unwrap();
        write_atomic(&path, b"{\"term\":2}").unwrap();
        assert_eq!(read_optional(&path).unwrap().unwrap(), b"{\"term\":2}");
        assert!(!path.with_extension("tmp").exists());
    }
}
