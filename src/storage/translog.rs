//! Rolling transaction log for the paged store.
//!
//! The log is an append-only file holding committed-but-unapplied record
//! snapshots. It keeps an in-memory mirror of its frames; the paged store
//! decides when frames are merged into the data files (rolling threshold,
//! rollback, close, open-time recovery).

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tracing::{debug, warn};

use crate::error::{GraphError, Result};
use crate::storage::record::Record;
use crate::util;

/// Magic bytes prefixing every transaction log file.
pub const LOG_MAGIC: &[u8; 2] = b"sl";

/// Default number of commit frames held before rolling.
pub const DEFAULT_TRANS_IN_LOG: usize = 10;

const FRAME_HEADER_SIZE: usize = 8 + 4;

/// On-disk frame: `[record_count u64][crc u32][record ...]` where each record
/// uses [`Record::marshal_binary`]. The crc covers the record bytes.
#[derive(Debug)]
pub struct TransLog {
    path: PathBuf,
    file: File,
    frames: VecDeque<Vec<Record>>,
    current: Option<Vec<Record>>,
    max_trans: usize,
}

impl TransLog {
    /// Opens or creates the log at `path` and loads all complete frames.
    ///
    /// A truncated final frame aborts with [`GraphError::UnexpectedEof`];
    /// callers may discard the incomplete tail with [`TransLog::repair`] and
    /// reopen.
    pub fn open(path: impl Into<PathBuf>, max_trans: usize) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(LOG_MAGIC)?;
            file.sync_data()?;
            return Ok(Self {
                path,
                file,
                frames: VecDeque::new(),
                current: None,
                max_trans: max_trans.max(1),
            });
        }

        let mut buf = Vec::with_capacity(len as usize);
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf)?;
        if buf.len() < LOG_MAGIC.len() || &buf[..LOG_MAGIC.len()] != LOG_MAGIC {
            return Err(GraphError::Corruption(format!(
                "invalid transaction log magic in {}",
                path.display()
            )));
        }

        let (frames, consumed) = parse_frames(&buf[LOG_MAGIC.len()..])?;
        if LOG_MAGIC.len() + consumed != buf.len() {
            return Err(GraphError::UnexpectedEof);
        }

        debug!(log = %path.display(), frames = frames.len(), "transaction log opened");
        Ok(Self {
            path,
            file,
            frames,
            current: None,
            max_trans: max_trans.max(1),
        })
    }

    /// Truncates an incomplete tail left by a crash mid-commit, keeping all
    /// complete frames.
    pub fn repair(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.len() < LOG_MAGIC.len() || &buf[..LOG_MAGIC.len()] != LOG_MAGIC {
            return Err(GraphError::Corruption(format!(
                "invalid transaction log magic in {}",
                path.display()
            )));
        }
        let (frames, consumed) = parse_frames(&buf[LOG_MAGIC.len()..])?;
        let keep = (LOG_MAGIC.len() + consumed) as u64;
        if keep < buf.len() as u64 {
            warn!(
                log = %path.display(),
                kept_frames = frames.len(),
                dropped_bytes = buf.len() as u64 - keep,
                "discarding incomplete transaction log tail"
            );
            file.set_len(keep)?;
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn max_trans(&self) -> usize {
        self.max_trans
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Opens a new commit frame.
    pub fn start(&mut self) {
        self.current = Some(Vec::new());
    }

    /// Buffers a snapshot of `record` in the current frame.
    pub fn add(&mut self, record: &Record) -> Result<()> {
        match &mut self.current {
            Some(frame) => {
                frame.push(record.clone());
                Ok(())
            }
            None => Err(GraphError::TransDisabled),
        }
    }

    /// Serialises the current frame, appends it and syncs the log file.
    pub fn commit(&mut self) -> Result<()> {
        let frame = self
            .current
            .take()
            .ok_or(GraphError::TransDisabled)?;
        if frame.is_empty() {
            return Ok(());
        }

        let mut records = Vec::new();
        for record in &frame {
            records.extend_from_slice(&record.marshal_binary());
        }
        let mut hasher = Hasher::new();
        hasher.update(&records);

        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + records.len());
        buf.extend_from_slice(&(frame.len() as u64).to_le_bytes());
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        buf.extend_from_slice(&records);

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;

        self.frames.push_back(frame);
        Ok(())
    }

    /// The oldest committed frame, if any.
    pub fn oldest(&self) -> Option<&[Record]> {
        self.frames.front().map(Vec::as_slice)
    }

    /// Drops the oldest frame after the caller applied it to the data files,
    /// and rewrites the log to the remaining frames.
    pub fn pop_oldest(&mut self) -> Result<()> {
        self.frames.pop_front();
        self.rewrite()
    }

    /// Removes and returns every committed frame; the on-disk log is left
    /// untouched until [`TransLog::truncate`] is called.
    pub fn take_all(&mut self) -> Vec<Vec<Record>> {
        self.frames.drain(..).collect()
    }

    /// Truncates the log to just the magic header.
    pub fn truncate(&mut self) -> Result<()> {
        self.frames.clear();
        self.file.set_len(LOG_MAGIC.len() as u64)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rewrite(&mut self) -> Result<()> {
        self.file.set_len(LOG_MAGIC.len() as u64)?;
        self.file.seek(SeekFrom::End(0))?;
        for frame in &self.frames {
            let mut records = Vec::new();
            for record in frame {
                records.extend_from_slice(&record.marshal_binary());
            }
            let mut hasher = Hasher::new();
            hasher.update(&records);
            self.file.write_all(&(frame.len() as u64).to_le_bytes())?;
            self.file.write_all(&hasher.finalize().to_le_bytes())?;
            self.file.write_all(&records)?;
        }
        self.file.sync_data()?;
        Ok(())
    }
}

/// Parses as many complete frames as the buffer holds. Returns the frames
/// and the number of bytes they cover; an incomplete tail is simply not
/// consumed, so callers can distinguish a clean log (`consumed ==
/// buf.len()`) from a torn one.
fn parse_frames(buf: &[u8]) -> Result<(VecDeque<Vec<Record>>, usize)> {
    let mut frames = VecDeque::new();
    let mut consumed = 0usize;

    'frames: while consumed < buf.len() {
        let rest = &buf[consumed..];
        if rest.len() < FRAME_HEADER_SIZE {
            break;
        }
        let count = util::read_u64_le(rest, 0)?;
        let crc = util::read_u32_le(rest, 8)?;

        let mut cursor = FRAME_HEADER_SIZE;
        let mut frame = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match Record::unmarshal_binary(&rest[cursor..]) {
                Ok((record, used)) => {
                    cursor += used;
                    frame.push(record);
                }
                Err(GraphError::UnexpectedEof) => break 'frames,
                Err(e) => return Err(e),
            }
        }

        let mut hasher = Hasher::new();
        hasher.update(&rest[FRAME_HEADER_SIZE..cursor]);
        if hasher.finalize() != crc {
            return Err(GraphError::Corruption(
                "transaction log frame checksum mismatch".into(),
            ));
        }

        frames.push_back(frame);
        consumed += cursor;
    }

    Ok((frames, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot(id: u64, fill: u8) -> Record {
        let mut record = Record::new(id, 32);
        record.write_bytes(0, &[fill; 4]);
        record
    }

    #[test]
    fn commit_persists_frames_across_reopen() {
        let dir = tempdir().expect("tmpdir");
        let path = dir.path().join("test.tlg");

        {
            let mut log = TransLog::open(&path, 10).expect("open");
            log.start();
            log.add(&snapshot(1, 0xAA)).expect("add");
            log.add(&snapshot(2, 0xBB)).expect("add");
            log.commit().expect("commit");
            log.start();
            log.add(&snapshot(3, 0xCC)).expect("add");
            log.commit().expect("commit");
        }

        let log = TransLog::open(&path, 10).expect("reopen");
        assert_eq!(log.frame_count(), 2);
        let first = log.oldest().expect("oldest frame");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id(), 1);
        assert_eq!(&first[0].data()[..4], &[0xAA; 4]);
    }

    #[test]
    fn add_without_start_is_rejected() {
        let dir = tempdir().expect("tmpdir");
        let mut log = TransLog::open(dir.path().join("x.tlg"), 10).expect("open");
        assert!(matches!(
            log.add(&snapshot(1, 0)),
            Err(GraphError::TransDisabled)
        ));
    }

    #[test]
    fn truncated_tail_detected_and_repaired() {
        let dir = tempdir().expect("tmpdir");
        let path = dir.path().join("test.tlg");

        {
            let mut log = TransLog::open(&path, 10).expect("open");
            log.start();
            log.add(&snapshot(1, 0x11)).expect("add");
            log.commit().expect("commit");
        }

        // Simulate a crash mid-append of a second frame.
        {
            let mut file = OpenOptions::new().append(true).open(&path).expect("append");
            file.write_all(&9u64.to_le_bytes()).expect("partial frame");
        }

        assert!(matches!(
            TransLog::open(&path, 10),
            Err(GraphError::UnexpectedEof)
        ));

        TransLog::repair(&path).expect("repair");
        let log = TransLog::open(&path, 10).expect("open after repair");
        assert_eq!(log.frame_count(), 1);
    }

    #[test]
    fn pop_oldest_rewrites_log() {
        let dir = tempdir().expect("tmpdir");
        let path = dir.path().join("test.tlg");

        let mut log = TransLog::open(&path, 10).expect("open");
        for i in 0..3u64 {
            log.start();
            log.add(&snapshot(i, i as u8)).expect("add");
            log.commit().expect("commit");
        }
        log.pop_oldest().expect("pop");
        drop(log);

        let log = TransLog::open(&path, 10).expect("reopen");
        assert_eq!(log.frame_count(), 2);
        assert_eq!(log.oldest().expect("frame")[0].id(), 1);
    }
}
