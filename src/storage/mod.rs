//! Paged record storage: fixed-size records, multi-file stores, the rolling
//! transaction log, variable-length slots and the extensible hash index.

pub mod hashtree;
pub mod manager;
pub mod paged;
pub mod record;
pub mod slots;
pub mod translog;

pub use hashtree::HashTree;
pub use manager::{
    CachedStorageManager, DiskStorageManager, MemoryStorageManager, StorageManager,
};
pub use paged::PagedStore;
pub use record::Record;
pub use translog::TransLog;
