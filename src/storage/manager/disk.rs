//! Disk-backed storage manager: paged store + transaction log + free slots.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::Config;
use crate::error::{GraphError, Result};
use crate::storage::manager::{StorageManager, ROOT_SLOTS};
use crate::storage::paged::PagedStore;
use crate::storage::record::RecordView;
use crate::storage::slots::{
    self, FreeSlotManager, SLOT_HEADER_SIZE,
};

const STORAGE_MAGIC: u16 = 0x6D73;
const STORAGE_VERSION: u16 = 1;

// Header record layout: [magic u16][version u16][cursor u64][roots 8 x u64].
const HEADER_CURSOR_OFFSET: usize = 4;
const HEADER_ROOTS_OFFSET: usize = 12;

/// Storage manager persisting objects into a paged store with a rolling
/// transaction log. Record 0 is the allocation header; objects start at the
/// first byte of record 1 and may span records.
pub struct DiskStorageManager {
    name: String,
    store: PagedStore,
    free: FreeSlotManager,
    cursor: u64,
    roots: [u64; ROOT_SLOTS],
    header_dirty: bool,
}

impl DiskStorageManager {
    /// Opens (or creates) the storage manager `name` inside `dir`.
    pub fn open(name: impl Into<String>, dir: &Path, config: &Config) -> Result<Self> {
        let name = name.into();
        let prefix: PathBuf = dir.join(&name);
        let store = PagedStore::open(
            &prefix,
            config.record_size,
            config.max_file_size,
            config.trans_log_threshold,
        )?;

        let mut free_path = prefix.as_os_str().to_owned();
        free_path.push(".free");
        let free = FreeSlotManager::open(PathBuf::from(free_path))?;

        let mut manager = Self {
            name,
            store,
            free,
            cursor: 0,
            roots: [0; ROOT_SLOTS],
            header_dirty: false,
        };
        manager.read_header()?;
        Ok(manager)
    }

    /// True if persisted state for `name` exists in `dir`. A transaction
    /// log without data files counts: after a crash the data may live only
    /// in committed log frames.
    pub fn data_exists(name: &str, dir: &Path) -> bool {
        dir.join(format!("{name}.0")).exists() || dir.join(format!("{name}.tlg")).exists()
    }

    fn read_header(&mut self) -> Result<()> {
        let mut record = self.store.get(0)?;
        record.set_view(RecordView::AllocHeader);
        let magic = record.read_u16(0);

        if magic == 0 && record.read_u64(HEADER_CURSOR_OFFSET) == 0 {
            // Fresh store: objects start at record 1.
            self.cursor = self.store.record_size() as u64;
            self.roots = [0; ROOT_SLOTS];
            self.store.discard(record);
            self.header_dirty = true;
            debug!(name = %self.name, "initialised fresh storage manager");
            return Ok(());
        }

        if magic != STORAGE_MAGIC {
            let id = record.id();
            self.store.discard(record);
            return Err(GraphError::Corruption(format!(
                "invalid storage manager magic in record {id} of {}",
                self.name
            )));
        }
        let version = record.read_u16(2);
        if version != STORAGE_VERSION {
            self.store.discard(record);
            return Err(GraphError::Corruption(format!(
                "unsupported storage manager version {version} in {}",
                self.name
            )));
        }

        self.cursor = record.read_u64(HEADER_CURSOR_OFFSET);
        for (i, root) in self.roots.iter_mut().enumerate() {
            *root = record.read_u64(HEADER_ROOTS_OFFSET + i * 8);
        }
        self.store.discard(record);
        self.header_dirty = false;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        if !self.header_dirty {
            return Ok(());
        }
        let mut record = self.store.get(0)?;
        record.set_view(RecordView::AllocHeader);
        record.write_u16(0, STORAGE_MAGIC);
        record.write_u16(2, STORAGE_VERSION);
        record.write_u64(HEADER_CURSOR_OFFSET, self.cursor);
        for (i, root) in self.roots.iter().enumerate() {
            record.write_u64(HEADER_ROOTS_OFFSET + i * 8, *root);
        }
        self.store.release_in_use(record);
        self.header_dirty = false;
        Ok(())
    }

    fn slot_pos(&self, location: u64) -> u64 {
        slots::location_to_pos(location, self.store.record_size())
    }

    fn checked_span(data: &[u8]) -> Result<u32> {
        if data.is_empty() {
            return Err(GraphError::Corruption(
                "cannot store an empty object".into(),
            ));
        }
        u32::try_from(data.len()).map_err(|_| GraphError::SlotTooLarge(data.len()))
    }
}

impl StorageManager for DiskStorageManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&mut self, data: &[u8]) -> Result<u64> {
        let span = Self::checked_span(data)?;

        let pos = match self.free.get_slot(&mut self.store, span)? {
            Some((pos, alloc)) => {
                slots::write_slot_header(&mut self.store, pos, alloc, span)?;
                pos
            }
            None => {
                let pos = self.cursor;
                slots::write_slot_header(&mut self.store, pos, span, span)?;
                self.cursor = pos + SLOT_HEADER_SIZE + u64::from(span);
                self.header_dirty = true;
                pos
            }
        };
        slots::write_stream(&mut self.store, pos + SLOT_HEADER_SIZE, data)?;
        Ok(slots::pos_to_location(pos, self.store.record_size()))
    }

    fn fetch(&mut self, location: u64) -> Result<Vec<u8>> {
        let pos = self.slot_pos(location);
        let (alloc, used) = slots::read_slot_header(&mut self.store, pos)?;
        if used == 0 || used > alloc {
            return Err(GraphError::SlotEmpty(location));
        }
        slots::read_stream(&mut self.store, pos + SLOT_HEADER_SIZE, used as usize)
    }

    fn update(&mut self, location: u64, data: &[u8]) -> Result<u64> {
        let span = Self::checked_span(data)?;
        let pos = self.slot_pos(location);
        let (alloc, used) = slots::read_slot_header(&mut self.store, pos)?;
        if used == 0 {
            return Err(GraphError::SlotEmpty(location));
        }

        if span <= alloc {
            slots::write_slot_header(&mut self.store, pos, alloc, span)?;
            slots::write_stream(&mut self.store, pos + SLOT_HEADER_SIZE, data)?;
            return Ok(location);
        }

        self.free(location)?;
        self.insert(data)
    }

    fn free(&mut self, location: u64) -> Result<()> {
        let pos = self.slot_pos(location);
        let (alloc, used) = slots::read_slot_header(&mut self.store, pos)?;
        if used == 0 {
            return Err(GraphError::SlotEmpty(location));
        }
        self.free.free_slot(&mut self.store, pos, alloc)
    }

    fn set_root(&mut self, root: usize, value: u64) -> Result<()> {
        assert!(root < ROOT_SLOTS, "root index out of range");
        self.roots[root] = value;
        self.header_dirty = true;
        Ok(())
    }

    fn root(&mut self, root: usize) -> Result<u64> {
        assert!(root < ROOT_SLOTS, "root index out of range");
        Ok(self.roots[root])
    }

    fn flush(&mut self) -> Result<()> {
        self.write_header()?;
        self.free.save()?;
        self.store.flush()
    }

    fn rollback(&mut self) -> Result<()> {
        self.store.rollback()?;
        self.free.reload()?;
        self.read_header()
    }

    fn close(&mut self) -> Result<()> {
        self.write_header()?;
        self.free.save()?;
        self.store.close()
    }
}
