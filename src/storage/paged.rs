//! Multi-file paged record store with in-memory record states.
//!
//! Records live in exactly one of four states while resident: checked out
//! (`in_use`), modified (`dirty`), committed to the log but not yet merged
//! into the data files (`in_trans`), or pooled for reuse (`free`). The store
//! owns the data files `<name>.0`, `<name>.1`, ... and, when transactions
//! are enabled, the rolling log `<name>.tlg`.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::{debug, trace};

use crate::error::{GraphError, Result};
use crate::storage::record::Record;
use crate::storage::translog::TransLog;

/// Maximum size of a single data file before the next one is started.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

const FREE_POOL_LIMIT: usize = 64;

pub struct PagedStore {
    name: PathBuf,
    record_size: usize,
    records_per_file: u64,
    files: Vec<Option<File>>,
    in_use: HashSet<u64>,
    dirty: HashMap<u64, Record>,
    in_trans: HashMap<u64, Record>,
    free: Vec<Record>,
    pending_dec: HashMap<u64, i64>,
    log: Option<TransLog>,
}

impl PagedStore {
    /// Opens the store with a rolling transaction log.
    ///
    /// Any committed-but-unapplied frames in the log are recovered into the
    /// data files before the store becomes usable.
    pub fn open(
        name: impl Into<PathBuf>,
        record_size: usize,
        max_file_size: u64,
        max_trans: usize,
    ) -> Result<Self> {
        let name = name.into();
        let mut log_path = name.as_os_str().to_owned();
        log_path.push(".tlg");
        let mut log = TransLog::open(PathBuf::from(log_path), max_trans)?;

        let mut store = Self::build(name, record_size, max_file_size, None)?;

        // Recovery: merge every committed frame left behind by a crash into
        // the data files, then truncate the log.
        let frames = log.take_all();
        if !frames.is_empty() {
            debug!(
                store = %store.name.display(),
                frames = frames.len(),
                "recovering committed transaction log frames"
            );
            for frame in frames {
                for snapshot in &frame {
                    store.write_record_data(snapshot.id(), snapshot.data())?;
                }
            }
            store.sync()?;
            log.truncate()?;
        }

        store.log = Some(log);
        Ok(store)
    }

    /// Opens the store without transaction support; flush writes records
    /// straight back to the data files.
    pub fn open_without_trans(
        name: impl Into<PathBuf>,
        record_size: usize,
        max_file_size: u64,
    ) -> Result<Self> {
        Self::build(name.into(), record_size, max_file_size, None)
    }

    fn build(
        name: PathBuf,
        record_size: usize,
        max_file_size: u64,
        log: Option<TransLog>,
    ) -> Result<Self> {
        assert!(record_size > 0, "record size must be positive");
        let records_per_file = (max_file_size / record_size as u64).max(1);
        Ok(Self {
            name,
            record_size,
            records_per_file,
            files: Vec::new(),
            in_use: HashSet::new(),
            dirty: HashMap::new(),
            in_trans: HashMap::new(),
            free: Vec::new(),
            pending_dec: HashMap::new(),
            log,
        })
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn has_trans(&self) -> bool {
        self.log.is_some()
    }

    /// Checks the record with `id` out of the store, reading it from disk if
    /// it is not resident. Sparse reads past the end of the data files yield
    /// a zero-filled record.
    pub fn get(&mut self, id: u64) -> Result<Record> {
        if self.in_use.contains(&id) {
            return Err(GraphError::AlreadyInUse(id));
        }

        let record = if let Some(record) = self.dirty.remove(&id) {
            record
        } else if let Some(record) = self.in_trans.remove(&id) {
            record
        } else {
            let mut record = match self.free.pop() {
                Some(mut pooled) if pooled.len() == self.record_size => {
                    pooled.reset(id);
                    pooled
                }
                _ => Record::new(id, self.record_size),
            };
            self.read_record(&mut record)?;
            record
        };

        self.in_use.insert(id);
        trace!(store = %self.name.display(), id, "record checked out");
        Ok(record)
    }

    /// Checks a record back in. Dirty records move to the dirty map,
    /// records with outstanding log references move to `in_trans`, anything
    /// else is recycled.
    ///
    /// Panics if the record was not checked out; that is a programming
    /// error.
    pub fn release_in_use(&mut self, record: Record) {
        self.release_inner(record, None);
    }

    /// Like [`PagedStore::release_in_use`] but forces the dirty flag.
    pub fn release_in_use_id(&mut self, record: Record, dirty: bool) {
        self.release_inner(record, Some(dirty));
    }

    /// Returns a checked-out record unchanged: any modifications are
    /// dropped and the record does not become dirty.
    pub fn discard(&mut self, mut record: Record) {
        record.set_dirty(false);
        self.release_inner(record, None);
    }

    fn release_inner(&mut self, mut record: Record, force_dirty: Option<bool>) {
        let id = record.id();
        assert!(
            self.in_use.remove(&id),
            "releasing record {id} which is not in use"
        );
        if let Some(dirty) = force_dirty {
            record.set_dirty(dirty);
        }
        if let Some(pending) = self.pending_dec.remove(&id) {
            for _ in 0..pending {
                record.dec_trans_count();
            }
        }

        if record.is_dirty() {
            self.dirty.insert(id, record);
        } else if self.log.is_some() && record.trans_count() > 0 {
            self.in_trans.insert(id, record);
        } else {
            self.recycle(record);
        }
    }

    /// Writes all dirty records out. With transactions enabled the records
    /// are committed to the log in a single frame and move to `in_trans`
    /// until their frame is merged into the data files; without transactions
    /// they are written back directly.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let mut log = match self.log.take() {
            Some(log) => log,
            None => {
                let ids: Vec<u64> = self.dirty.keys().copied().collect();
                for id in ids {
                    let mut record = self.dirty.remove(&id).expect("dirty record");
                    self.write_record(&record)?;
                    record.set_dirty(false);
                    self.recycle(record);
                }
                return self.sync();
            }
        };

        let ids: Vec<u64> = self.dirty.keys().copied().collect();
        log.start();
        for &id in &ids {
            let record = self.dirty.get_mut(&id).expect("dirty record");
            record.inc_trans_count();
            if let Err(e) = log.add(record) {
                record.dec_trans_count();
                self.log = Some(log);
                return Err(e);
            }
        }

        match log.commit() {
            Ok(()) => {
                for id in ids {
                    let mut record = self.dirty.remove(&id).expect("dirty record");
                    record.set_dirty(false);
                    self.in_trans.insert(id, record);
                }
            }
            Err(e) => {
                for id in ids {
                    if let Some(record) = self.dirty.get_mut(&id) {
                        record.dec_trans_count();
                    }
                }
                self.log = Some(log);
                return Err(e);
            }
        }

        let result = self.roll(&mut log);
        self.log = Some(log);
        result
    }

    /// Undoes everything since the last flush: uncommitted modifications are
    /// discarded and all committed log frames are merged into the data
    /// files, after which the log is truncated.
    ///
    /// Fails with [`GraphError::RecordInUse`] if any record is checked out.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_use.is_empty() {
            return Err(GraphError::RecordInUse);
        }

        let dirty_ids: Vec<u64> = self.dirty.keys().copied().collect();
        for id in dirty_ids {
            let mut record = self.dirty.remove(&id).expect("dirty record");
            record.set_dirty(false);
            self.recycle(record);
        }

        if let Some(mut log) = self.log.take() {
            for frame in log.take_all() {
                for snapshot in &frame {
                    self.write_record_data(snapshot.id(), snapshot.data())?;
                }
            }
            self.sync()?;
            log.truncate()?;
            self.log = Some(log);
        }

        let trans_ids: Vec<u64> = self.in_trans.keys().copied().collect();
        for id in trans_ids {
            let record = self.in_trans.remove(&id).expect("in-trans record");
            self.recycle(record);
        }
        self.pending_dec.clear();

        debug!(store = %self.name.display(), "store rolled back");
        Ok(())
    }

    /// Syncs all open data files to disk.
    pub fn sync(&mut self) -> Result<()> {
        for file in self.files.iter().flatten() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Flushes, merges every remaining log frame into the data files and
    /// settles the store. Fails if any record is still checked out. The
    /// underlying files close when the store is dropped.
    pub fn close(&mut self) -> Result<()> {
        if !self.in_use.is_empty() {
            return Err(GraphError::RecordInUse);
        }
        self.flush()?;

        if let Some(mut log) = self.log.take() {
            for frame in log.take_all() {
                for snapshot in &frame {
                    self.write_record_data(snapshot.id(), snapshot.data())?;
                }
            }
            self.sync()?;
            log.truncate()?;
        }
        self.in_trans.clear();
        self.sync()
    }

    fn roll(&mut self, log: &mut TransLog) -> Result<()> {
        while log.frame_count() > log.max_trans() {
            let frame: Vec<Record> = log
                .oldest()
                .expect("frame count checked")
                .to_vec();
            for snapshot in &frame {
                self.write_record_data(snapshot.id(), snapshot.data())?;
            }
            self.sync()?;
            for snapshot in &frame {
                self.apply_trans_dec(snapshot.id());
            }
            log.pop_oldest()?;
        }
        Ok(())
    }

    fn apply_trans_dec(&mut self, id: u64) {
        if let Some(record) = self.in_trans.get_mut(&id) {
            record.dec_trans_count();
            if record.trans_count() == 0 {
                let record = self.in_trans.remove(&id).expect("in-trans record");
                self.recycle(record);
            }
        } else if let Some(record) = self.dirty.get_mut(&id) {
            record.dec_trans_count();
        } else if self.in_use.contains(&id) {
            *self.pending_dec.entry(id).or_insert(0) += 1;
        } else {
            debug_assert!(false, "trans decrement for untracked record {id}");
        }
    }

    fn recycle(&mut self, record: Record) {
        if record.len() == self.record_size && self.free.len() < FREE_POOL_LIMIT {
            self.free.push(record);
        }
    }

    fn file_path(&self, index: usize) -> PathBuf {
        let mut os = self.name.as_os_str().to_owned();
        os.push(format!(".{index}"));
        PathBuf::from(os)
    }

    fn ensure_file(&mut self, index: usize, create: bool) -> Result<Option<&mut File>> {
        if self.files.len() <= index {
            self.files.resize_with(index + 1, || None);
        }
        if self.files[index].is_none() {
            let path = self.file_path(index);
            if !create && !path.exists() {
                return Ok(None);
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            self.files[index] = Some(file);
        }
        Ok(self.files[index].as_mut())
    }

    fn locate(&self, id: u64) -> (usize, u64) {
        let file_index = (id / self.records_per_file) as usize;
        let intra = (id % self.records_per_file) * self.record_size as u64;
        (file_index, intra)
    }

    fn read_record(&mut self, record: &mut Record) -> Result<()> {
        let (file_index, offset) = self.locate(record.id());
        let Some(file) = self.ensure_file(file_index, false)? else {
            record.data_mut().fill(0);
            return Ok(());
        };

        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0usize;
        let buf = record.data_mut();
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                // Sparse region: remainder stays zeroed.
                buf[read..].fill(0);
                break;
            }
            read += n;
        }
        record.set_dirty(false);
        Ok(())
    }

    fn write_record(&mut self, record: &Record) -> Result<()> {
        if record.len() != self.record_size {
            return Err(GraphError::NilData(record.id()));
        }
        self.write_record_data(record.id(), record.data())
    }

    fn write_record_data(&mut self, id: u64, data: &[u8]) -> Result<()> {
        if data.len() != self.record_size {
            return Err(GraphError::NilData(id));
        }
        let (file_index, offset) = self.locate(id);
        let file = self
            .ensure_file(file_index, true)?
            .expect("file created on demand");
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    #[cfg(test)]
    fn resident_states(&self, id: u64) -> usize {
        usize::from(self.in_use.contains(&id))
            + usize::from(self.dirty.contains_key(&id))
            + usize::from(self.in_trans.contains_key(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &std::path::Path, name: &str) -> PagedStore {
        PagedStore::open(dir.join(name), 128, 1024, 3).expect("open store")
    }

    #[test]
    fn get_release_round_trip() {
        let dir = tempdir().expect("tmpdir");
        let mut store = open_store(dir.path(), "data");

        let mut record = store.get(5).expect("get");
        record.write_bytes(0, b"hello");
        store.release_in_use(record);
        store.flush().expect("flush");

        let record = store.get(5).expect("get again");
        assert_eq!(record.read_bytes(0, 5), b"hello");
        store.discard(record);
    }

    #[test]
    fn double_checkout_is_rejected() {
        let dir = tempdir().expect("tmpdir");
        let mut store = open_store(dir.path(), "data");

        let record = store.get(1).expect("get");
        assert!(matches!(store.get(1), Err(GraphError::AlreadyInUse(1))));
        store.discard(record);
        let record = store.get(1).expect("get after release");
        store.discard(record);
    }

    #[test]
    fn sparse_read_yields_zero_record() {
        let dir = tempdir().expect("tmpdir");
        let mut store = open_store(dir.path(), "data");
        let record = store.get(1_000_000).expect("sparse get");
        assert!(record.data().iter().all(|&b| b == 0));
        store.discard(record);
    }

    #[test]
    fn record_resides_in_at_most_one_state() {
        let dir = tempdir().expect("tmpdir");
        let mut store = open_store(dir.path(), "data");

        let mut record = store.get(9).expect("get");
        assert_eq!(store.resident_states(9), 1);
        record.write_u8(0, 1);
        store.release_in_use(record);
        assert_eq!(store.resident_states(9), 1);
        store.flush().expect("flush");
        assert_eq!(store.resident_states(9), 1); // in_trans until the frame rolls
    }

    #[test]
    fn multi_file_addressing() {
        let dir = tempdir().expect("tmpdir");
        // 1024 / 128 = 8 records per file.
        let mut store = open_store(dir.path(), "data");
        for id in [0u64, 7, 8, 17] {
            let mut record = store.get(id).expect("get");
            record.write_u64(0, id + 1);
            store.release_in_use(record);
        }
        store.flush().expect("flush");
        store.rollback().expect("rollback to settle log");

        assert!(dir.path().join("data.0").exists());
        assert!(dir.path().join("data.1").exists());
        assert!(dir.path().join("data.2").exists());

        for id in [0u64, 7, 8, 17] {
            let record = store.get(id).expect("get");
            assert_eq!(record.read_u64(0), id + 1);
            store.discard(record);
        }
    }

    #[test]
    fn rollback_discards_unflushed_changes() {
        let dir = tempdir().expect("tmpdir");
        let mut store = open_store(dir.path(), "data");

        let mut record = store.get(1).expect("get");
        record.write_bytes(0, b"keep");
        store.release_in_use(record);
        store.flush().expect("flush");

        let mut record = store.get(2).expect("get");
        record.write_bytes(0, b"drop");
        store.release_in_use(record);

        store.rollback().expect("rollback");

        let record = store.get(1).expect("get kept");
        assert_eq!(record.read_bytes(0, 4), b"keep");
        store.discard(record);
        let record = store.get(2).expect("get dropped");
        assert_eq!(record.read_bytes(0, 4), &[0u8; 4]);
        store.discard(record);
    }

    #[test]
    fn rollback_with_checked_out_record_fails() {
        let dir = tempdir().expect("tmpdir");
        let mut store = open_store(dir.path(), "data");
        let record = store.get(1).expect("get");
        assert!(matches!(store.rollback(), Err(GraphError::RecordInUse)));
        store.discard(record);
    }

    #[test]
    fn rolling_log_merges_oldest_frames() {
        let dir = tempdir().expect("tmpdir");
        let mut store = open_store(dir.path(), "data"); // threshold 3

        for round in 0u8..5 {
            let mut record = store.get(u64::from(round)).expect("get");
            record.write_u8(0, round + 1);
            store.release_in_use(record);
            store.flush().expect("flush");
        }
        // Two frames rolled into the data file, three remain in the log.
        drop(store);

        let mut reopened = open_store(dir.path(), "data");
        for round in 0u8..5 {
            let record = reopened.get(u64::from(round)).expect("get");
            assert_eq!(record.read_u8(0), round + 1);
            reopened.discard(record);
        }
    }

    #[test]
    fn crash_recovery_applies_committed_frames() {
        let dir = tempdir().expect("tmpdir");

        {
            let mut store = open_store(dir.path(), "data");
            let mut record = store.get(1).expect("get");
            record.write_bytes(0, b"payload");
            store.release_in_use(record);
            store.flush().expect("flush");
            // Dropped without close: the frame stays in the log, the data
            // file was never written.
        }
        assert!(!dir.path().join("data.0").exists());

        let mut store = open_store(dir.path(), "data");
        let record = store.get(1).expect("get after recovery");
        assert_eq!(record.read_bytes(0, 7), b"payload");
        store.discard(record);
    }

    #[test]
    fn close_settles_everything() {
        let dir = tempdir().expect("tmpdir");
        {
            let mut store = open_store(dir.path(), "data");
            let mut record = store.get(3).expect("get");
            record.write_bytes(0, b"closed");
            store.release_in_use(record);
            store.close().expect("close");
        }

        let mut store = open_store(dir.path(), "data");
        let record = store.get(3).expect("get");
        assert_eq!(record.read_bytes(0, 6), b"closed");
        store.discard(record);
    }
}
