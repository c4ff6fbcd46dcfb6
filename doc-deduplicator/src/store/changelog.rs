//! Append-only change log backing a partition's durable key store.
//!
//! Every store update is appended here before the decision that produced it
//! is reported, and the log is the only durable structure: rebuilding the
//! store means replaying this file from the top.
//!
//! On-disk layout: a fixed header (magic + format version), then one frame
//! per record. A frame is a little-endian u32 payload length, the
//! bincode-encoded record, and a SipHash-2-4 checksum of the payload. The
//! checksum uses fixed keys; it detects corruption, it does not authenticate.

use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;
use thiserror::Error;

use crate::fingerprint::Fingerprint;

const MAGIC: &[u8; 4] = b"DDCL";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: u64 = 5;

const LEN_PREFIX_LEN: usize = 4;
const CHECKSUM_LEN: usize = 8;

/// Upper bound on a single frame; anything larger is not a record we wrote.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const CHECKSUM_KEY_0: u64 = 0x646f_635f_6465_6475;
const CHECKSUM_KEY_1: u64 = 0x705f_6368_616e_6765;

/// One update to the durable key store, in append order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogRecord {
    pub key: String,
    pub fingerprint: Fingerprint,
    pub source_offset: i64,
}

#[derive(Debug, Error)]
pub enum ChangeLogError {
    #[error("change log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("change log encoding error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("change log header is missing or not recognized")]
    BadHeader,
    #[error("corrupt change log frame at byte {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}

fn frame_checksum(payload: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(CHECKSUM_KEY_0, CHECKSUM_KEY_1);
    hasher.write(payload);
    hasher.finish()
}

/// Reads as many bytes as the file still has, up to `buf.len()`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Append handle for a partition's change log.
pub struct ChangeLog {
    path: PathBuf,
    file: File,
    end: u64,
}

impl ChangeLog {
    /// Opens (or creates) the log at `path` and validates its header.
    pub fn open(path: &Path) -> Result<Self, ChangeLogError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            let mut header = [0u8; HEADER_LEN as usize];
            header[..4].copy_from_slice(MAGIC);
            header[4] = FORMAT_VERSION;
            file.write_all(&header)?;
            file.sync_data()?;
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                end: HEADER_LEN,
            });
        }

        if len < HEADER_LEN {
            return Err(ChangeLogError::BadHeader);
        }
        let mut header = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if &header[..4] != MAGIC || header[4] != FORMAT_VERSION {
            return Err(ChangeLogError::BadHeader);
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            end: len,
        })
    }

    /// Appends one record and syncs it to disk before returning, so the
    /// caller may safely act on the update once this returns.
    pub fn append(&mut self, record: &ChangeLogRecord) -> Result<(), ChangeLogError> {
        let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
        let mut frame = Vec::with_capacity(LEN_PREFIX_LEN + payload.len() + CHECKSUM_LEN);
        frame.extend_from_slice(&u32::try_from(payload.len()).expect("record fits a u32").to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&frame_checksum(&payload).to_le_bytes());

        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.end += frame.len() as u64;
        Ok(())
    }

    /// Byte position appends go to next, which is also the replay watermark.
    pub fn end_offset(&self) -> u64 {
        self.end
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drops everything past `valid_end`, used to discard a torn tail frame
    /// found during replay before new appends land after it.
    pub fn truncate_to(&mut self, valid_end: u64) -> Result<(), ChangeLogError> {
        self.file.set_len(valid_end)?;
        self.file.sync_data()?;
        self.end = valid_end;
        Ok(())
    }

    pub fn sync_all(&mut self) -> Result<(), ChangeLogError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Replaces the log with exactly `records`, written to a sibling file
    /// and renamed over the original so a crash leaves one intact log.
    pub fn rewrite(path: PathBuf, records: &[ChangeLogRecord]) -> Result<Self, ChangeLogError> {
        let tmp_path = path.with_extension("compact");
        {
            let mut tmp = ChangeLog::open_truncated(&tmp_path)?;
            for record in records {
                tmp.append(record)?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Self::open(&path)
    }

    fn open_truncated(path: &Path) -> Result<Self, ChangeLogError> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Self::open(path)
    }
}

/// Sequential reader over a change log, for recovery replay.
///
/// A frame cut short at the end of the file is debris from an append that
/// crashed mid-write; `next_record` stops there and records the valid end so
/// the caller can truncate. A checksum mismatch on a fully present frame can
/// only be corruption and is fatal.
pub struct ChangeLogReader {
    reader: BufReader<File>,
    pos: u64,
    torn_tail: Option<u64>,
}

impl ChangeLogReader {
    pub fn open(path: &Path) -> Result<Self, ChangeLogError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN as usize];
        if read_full(&mut reader, &mut header)? < header.len() {
            return Err(ChangeLogError::BadHeader);
        }
        if &header[..4] != MAGIC || header[4] != FORMAT_VERSION {
            return Err(ChangeLogError::BadHeader);
        }

        Ok(Self {
            reader,
            pos: HEADER_LEN,
            torn_tail: None,
        })
    }

    /// Returns the next record, or `None` at the end of the log (clean or
    /// torn; check `torn_tail` to tell them apart).
    pub fn next_record(&mut self) -> Result<Option<ChangeLogRecord>, ChangeLogError> {
        if self.torn_tail.is_some() {
            return Ok(None);
        }

        let mut len_buf = [0u8; LEN_PREFIX_LEN];
        let n = read_full(&mut self.reader, &mut len_buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n < len_buf.len() {
            self.torn_tail = Some(self.pos);
            return Ok(None);
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ChangeLogError::Corrupt {
                offset: self.pos,
                reason: format!("frame length {len} exceeds maximum"),
            });
        }

        let mut payload = vec![0u8; len];
        if read_full(&mut self.reader, &mut payload)? < len {
            self.torn_tail = Some(self.pos);
            return Ok(None);
        }

        let mut sum_buf = [0u8; CHECKSUM_LEN];
        if read_full(&mut self.reader, &mut sum_buf)? < sum_buf.len() {
            self.torn_tail = Some(self.pos);
            return Ok(None);
        }

        let expected = u64::from_le_bytes(sum_buf);
        if frame_checksum(&payload) != expected {
            // A torn append leaves a short frame, never a complete frame with
            // a bad sum, so this is real corruption.
            return Err(ChangeLogError::Corrupt {
                offset: self.pos,
                reason: "checksum mismatch".to_string(),
            });
        }

        let (record, _) =
            bincode::serde::decode_from_slice(&payload, bincode::config::standard()).map_err(
                |e| ChangeLogError::Corrupt {
                    offset: self.pos,
                    reason: format!("undecodable record: {e}"),
                },
            )?;

        self.pos += (LEN_PREFIX_LEN + len + CHECKSUM_LEN) as u64;
        Ok(Some(record))
    }

    /// Position of the first byte of a torn tail frame, if one was found.
    pub fn torn_tail(&self) -> Option<u64> {
        self.torn_tail
    }

    /// Byte position of the next unread frame.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{Fingerprinter, Sha256Fingerprinter};
    use tempfile::TempDir;

    fn record(key: &str, body: &[u8], source_offset: i64) -> ChangeLogRecord {
        ChangeLogRecord {
            key: key.to_string(),
            fingerprint: Sha256Fingerprinter.fingerprint(body).unwrap(),
            source_offset,
        }
    }

    fn read_all(path: &Path) -> (Vec<ChangeLogRecord>, Option<u64>) {
        let mut reader = ChangeLogReader::open(path).unwrap();
        let mut records = Vec::new();
        while let Some(r) = reader.next_record().unwrap() {
            records.push(r);
        }
        (records, reader.torn_tail())
    }

    #[test]
    fn append_then_replay_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changelog.log");

        let first = record("doc-1", b"a", 1);
        let second = record("doc-2", b"b", 2);
        {
            let mut log = ChangeLog::open(&path).unwrap();
            log.append(&first).unwrap();
            log.append(&second).unwrap();
        }

        let (records, torn) = read_all(&path);
        assert_eq!(records, vec![first, second]);
        assert!(torn.is_none());
    }

    #[test]
    fn replaying_twice_yields_identical_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changelog.log");

        let mut log = ChangeLog::open(&path).unwrap();
        for i in 0..10 {
            log.append(&record("doc-1", format!("rev-{i}").as_bytes(), i))
                .unwrap();
        }

        let (once, _) = read_all(&path);
        let (twice, _) = read_all(&path);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 10);
    }

    #[test]
    fn empty_log_replays_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changelog.log");
        drop(ChangeLog::open(&path).unwrap());

        let (records, torn) = read_all(&path);
        assert!(records.is_empty());
        assert!(torn.is_none());
    }

    #[test]
    fn torn_tail_is_detected_and_survivors_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changelog.log");

        let first = record("doc-1", b"a", 1);
        let second = record("doc-2", b"b", 2);
        let valid_end;
        {
            let mut log = ChangeLog::open(&path).unwrap();
            log.append(&first).unwrap();
            log.append(&second).unwrap();
            valid_end = log.end_offset();
        }

        // Simulate a crash mid-append: a frame cut short at the end
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[42u8, 0, 0]).unwrap();
        }

        let (records, torn) = read_all(&path);
        assert_eq!(records, vec![first, second]);
        assert_eq!(torn, Some(valid_end));

        // Truncating restores a clean log
        let mut log = ChangeLog::open(&path).unwrap();
        log.truncate_to(valid_end).unwrap();
        drop(log);
        let (records, torn) = read_all(&path);
        assert_eq!(records.len(), 2);
        assert!(torn.is_none());
    }

    #[test]
    fn checksum_corruption_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changelog.log");
        {
            let mut log = ChangeLog::open(&path).unwrap();
            log.append(&record("doc-1", b"a", 1)).unwrap();
            log.append(&record("doc-2", b"b", 2)).unwrap();
        }

        // Flip one payload byte of the first frame
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let target = HEADER_LEN + LEN_PREFIX_LEN as u64 + 1;
            file.seek(SeekFrom::Start(target)).unwrap();
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte).unwrap();
            byte[0] ^= 0xFF;
            file.seek(SeekFrom::Start(target)).unwrap();
            file.write_all(&byte).unwrap();
        }

        let mut reader = ChangeLogReader::open(&path).unwrap();
        let err = reader.next_record().unwrap_err();
        assert!(matches!(err, ChangeLogError::Corrupt { .. }));
    }

    #[test]
    fn unrecognized_header_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changelog.log");
        std::fs::write(&path, b"not a change log").unwrap();

        assert!(matches!(
            ChangeLogReader::open(&path),
            Err(ChangeLogError::BadHeader)
        ));
        assert!(matches!(
            ChangeLog::open(&path),
            Err(ChangeLogError::BadHeader)
        ));
    }

    #[test]
    fn rewrite_replaces_log_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changelog.log");
        {
            let mut log = ChangeLog::open(&path).unwrap();
            for i in 0..5 {
                log.append(&record("doc-1", format!("rev-{i}").as_bytes(), i))
                    .unwrap();
            }
        }

        let survivor = record("doc-1", b"rev-4", 4);
        let log = ChangeLog::rewrite(path.clone(), std::slice::from_ref(&survivor)).unwrap();
        drop(log);

        let (records, torn) = read_all(&path);
        assert_eq!(records, vec![survivor]);
        assert!(torn.is_none());
    }
}
