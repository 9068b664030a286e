use std::path::PathBuf;

/// Engine construction options.
///
/// Recognised by the embedder; the core components receive the individual
/// values at construction time and never read configuration themselves.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed record size of the paged stores in bytes.
    pub record_size: usize,
    /// Maximum size of a single datastore file before the next numbered file
    /// is started.
    pub max_file_size: u64,
    /// Number of commit frames the rolling transaction log holds before the
    /// oldest frames are merged into the data files.
    pub trans_log_threshold: usize,
    /// Entry count of the per-storage-manager data cache.
    pub data_cache_entries: usize,
    /// Entry count of the query result cache.
    pub result_cache_entries: usize,
    /// Keep all graph data in memory instead of on disk.
    pub memory_only: bool,
    /// Graph root directory for disk storage.
    pub location: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            record_size: 4096,
            max_file_size: 10 * 1024 * 1024 * 1024,
            trans_log_threshold: 10,
            data_cache_entries: 512,
            result_cache_entries: 100,
            memory_only: false,
            location: PathBuf::from("db"),
        }
    }
}

impl Config {
    /// Disk-backed configuration rooted at `location`.
    pub fn disk(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }

    /// Memory-only configuration; nothing is persisted.
    pub fn memory() -> Self {
        Self {
            memory_only: true,
            ..Self::default()
        }
    }
}
