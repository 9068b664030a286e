//! Map-backed storage manager for memory-only graphs and tests.

use std::collections::HashMap;

use crate::error::{GraphError, Result};
use crate::storage::manager::{StorageManager, ROOT_SLOTS};

pub struct MemoryStorageManager {
    name: String,
    objects: HashMap<u64, Vec<u8>>,
    next_location: u64,
    roots: [u64; ROOT_SLOTS],
}

impl MemoryStorageManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: HashMap::new(),
            next_location: 1,
            roots: [0; ROOT_SLOTS],
        }
    }
}

impl StorageManager for MemoryStorageManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&mut self, data: &[u8]) -> Result<u64> {
        let location = self.next_location;
        self.next_location += 1;
        self.objects.insert(location, data.to_vec());
        Ok(location)
    }

    fn fetch(&mut self, location: u64) -> Result<Vec<u8>> {
        self.objects
            .get(&location)
            .cloned()
            .ok_or(GraphError::SlotEmpty(location))
    }

    fn update(&mut self, location: u64, data: &[u8]) -> Result<u64> {
        match self.objects.get_mut(&location) {
            Some(existing) => {
                *existing = data.to_vec();
                Ok(location)
            }
            None => Err(GraphError::SlotEmpty(location)),
        }
    }

    fn free(&mut self, location: u64) -> Result<()> {
        self.objects
            .remove(&location)
            .map(|_| ())
            .ok_or(GraphError::SlotEmpty(location))
    }

    fn set_root(&mut self, root: usize, value: u64) -> Result<()> {
        assert!(root < ROOT_SLOTS, "root index out of range");
        self.roots[root] = value;
        Ok(())
    }

    fn root(&mut self, root: usize) -> Result<u64> {
        assert!(root < ROOT_SLOTS, "root index out of range");
        Ok(self.roots[root])
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    // Memory-only storage has no flushed state to return to.
    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
