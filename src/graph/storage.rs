//! Named collections of storage managers backing one graph, plus the small
//! always-in-memory main DB holding meta information.
//!
//! The main DB (`names.pm`) is a flat string map persisted by whole-file
//! rewrite; the previous version is kept as a `.bak` rollback copy.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::Config;
use crate::error::{GraphError, Result};
use crate::storage::manager::{
    CachedStorageManager, DiskStorageManager, MemoryStorageManager, StorageManager,
};

/// Main DB file name inside the graph root directory.
pub const MAINDB_FILE: &str = "names.pm";

/// Main DB key holding the storage format version.
pub const MAINDB_VERSION: &str = "version";

/// Current storage format version.
pub const VERSION: u32 = 1;

/// Storage facade for one graph: the main DB plus named storage managers.
pub trait GraphStorage: Send {
    /// Identifier of this storage (directory path or memory name).
    fn name(&self) -> &str;

    /// The always-in-memory meta-information map.
    fn main_db(&mut self) -> &mut BTreeMap<String, String>;

    /// Persists the main DB.
    fn flush_main(&mut self) -> Result<()>;

    /// Restores the main DB to its last persisted state.
    fn rollback_main(&mut self) -> Result<()>;

    /// True if a storage manager with `name` already has persisted data.
    fn has_manager(&self, name: &str) -> bool;

    /// Returns the storage manager registered under `name`, creating it when
    /// `create` is set. Returns `None` for a missing manager when `create`
    /// is unset.
    fn storage_manager(
        &mut self,
        name: &str,
        create: bool,
    ) -> Result<Option<&mut dyn StorageManager>>;

    /// Flushes every open storage manager and the main DB.
    fn flush_all(&mut self) -> Result<()>;

    /// Flushes and settles everything.
    fn close(&mut self) -> Result<()>;
}

/// Disk-backed graph storage rooted at a directory.
pub struct DiskGraphStorage {
    root: PathBuf,
    name: String,
    config: Config,
    main_db: BTreeMap<String, String>,
    managers: HashMap<String, Box<dyn StorageManager>>,
}

impl DiskGraphStorage {
    /// Opens (or initialises) the graph root directory from `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let root = config.location.clone();
        fs::create_dir_all(&root)?;

        let main_path = root.join(MAINDB_FILE);
        let main_db = if main_path.exists() {
            read_main_db(&main_path)?
        } else {
            let mut db = BTreeMap::new();
            db.insert(MAINDB_VERSION.to_string(), VERSION.to_string());
            write_main_db(&root, &db)?;
            db
        };

        let version: u32 = main_db
            .get(MAINDB_VERSION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if version != VERSION {
            return Err(GraphError::Corruption(format!(
                "unsupported graph storage version {version} in {}",
                main_path.display()
            )));
        }

        info!(root = %root.display(), "graph storage opened");
        Ok(Self {
            name: root.display().to_string(),
            root,
            config: config.clone(),
            main_db,
            managers: HashMap::new(),
        })
    }
}

impl GraphStorage for DiskGraphStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn main_db(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.main_db
    }

    fn flush_main(&mut self) -> Result<()> {
        write_main_db(&self.root, &self.main_db)
    }

    fn rollback_main(&mut self) -> Result<()> {
        self.main_db = read_main_db(&self.root.join(MAINDB_FILE))?;
        Ok(())
    }

    fn has_manager(&self, name: &str) -> bool {
        self.managers.contains_key(name) || DiskStorageManager::data_exists(name, &self.root)
    }

    fn storage_manager(
        &mut self,
        name: &str,
        create: bool,
    ) -> Result<Option<&mut dyn StorageManager>> {
        if !self.managers.contains_key(name) {
            if !create && !DiskStorageManager::data_exists(name, &self.root) {
                return Ok(None);
            }
            let disk = DiskStorageManager::open(name, &self.root, &self.config)?;
            let cached = CachedStorageManager::new(Box::new(disk), self.config.data_cache_entries);
            debug!(manager = name, "storage manager opened");
            self.managers.insert(name.to_string(), Box::new(cached));
        }
        Ok(self
            .managers
            .get_mut(name)
            .map(|manager| manager.as_mut() as &mut dyn StorageManager))
    }

    fn flush_all(&mut self) -> Result<()> {
        for manager in self.managers.values_mut() {
            manager.flush()?;
        }
        self.flush_main()
    }

    fn close(&mut self) -> Result<()> {
        for manager in self.managers.values_mut() {
            manager.close()?;
        }
        self.managers.clear();
        self.flush_main()
    }
}

fn read_main_db(path: &Path) -> Result<BTreeMap<String, String>> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        GraphError::Corruption(format!("could not decode main DB {}: {e}", path.display()))
    })
}

/// Whole-file rewrite with a `.bak` rollback copy of the previous version.
fn write_main_db(root: &Path, db: &BTreeMap<String, String>) -> Result<()> {
    let path = root.join(MAINDB_FILE);
    let tmp = root.join(format!("{MAINDB_FILE}.new"));
    let bak = root.join(format!("{MAINDB_FILE}.bak"));

    let bytes = serde_json::to_vec_pretty(db)
        .map_err(|e| GraphError::Corruption(format!("could not encode main DB: {e}")))?;
    fs::write(&tmp, bytes)?;
    if path.exists() {
        fs::rename(&path, &bak)?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Memory-backed graph storage; nothing is persisted.
pub struct MemoryGraphStorage {
    name: String,
    main_db: BTreeMap<String, String>,
    managers: HashMap<String, Box<dyn StorageManager>>,
}

impl MemoryGraphStorage {
    pub fn new(name: impl Into<String>) -> Self {
        let mut main_db = BTreeMap::new();
        main_db.insert(MAINDB_VERSION.to_string(), VERSION.to_string());
        Self {
            name: name.into(),
            main_db,
            managers: HashMap::new(),
        }
    }
}

impl GraphStorage for MemoryGraphStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn main_db(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.main_db
    }

    fn flush_main(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback_main(&mut self) -> Result<()> {
        Ok(())
    }

    fn has_manager(&self, name: &str) -> bool {
        self.managers.contains_key(name)
    }

    fn storage_manager(
        &mut self,
        name: &str,
        create: bool,
    ) -> Result<Option<&mut dyn StorageManager>> {
        if !self.managers.contains_key(name) {
            if !create {
                return Ok(None);
            }
            self.managers.insert(
                name.to_string(),
                Box::new(MemoryStorageManager::new(name)),
            );
        }
        Ok(self
            .managers
            .get_mut(name)
            .map(|manager| manager.as_mut() as &mut dyn StorageManager))
    }

    fn flush_all(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// List- and counter-valued main DB entries are JSON encoded strings; these
/// helpers keep the encoding in one place.
pub(crate) fn main_db_list(db: &BTreeMap<String, String>, key: &str) -> Vec<String> {
    db.get(key)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

pub(crate) fn main_db_list_add(db: &mut BTreeMap<String, String>, key: &str, value: &str) {
    let mut list = main_db_list(db, key);
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
        list.sort();
        db.insert(
            key.to_string(),
            serde_json::to_string(&list).expect("string list encodes"),
        );
    }
}

pub(crate) fn main_db_count(db: &BTreeMap<String, String>, key: &str) -> u64 {
    db.get(key).and_then(|raw| raw.parse().ok()).unwrap_or(0)
}

pub(crate) fn main_db_count_add(db: &mut BTreeMap<String, String>, key: &str, delta: i64) {
    let current = main_db_count(db, key) as i64;
    let next = (current + delta).max(0);
    db.insert(key.to_string(), next.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn main_db_rewrite_keeps_rollback_copy() {
        let dir = tempdir().expect("tmpdir");
        let config = Config::disk(dir.path());

        let mut storage = DiskGraphStorage::open(&config).expect("open");
        storage
            .main_db()
            .insert("nodekinds".into(), "[\"Song\"]".into());
        storage.flush_main().expect("flush");
        storage
            .main_db()
            .insert("nodekinds".into(), "[\"Song\",\"Author\"]".into());
        storage.flush_main().expect("flush again");

        assert!(dir.path().join("names.pm").exists());
        assert!(dir.path().join("names.pm.bak").exists());

        let bak: BTreeMap<String, String> =
            serde_json::from_slice(&fs::read(dir.path().join("names.pm.bak")).expect("read bak"))
                .expect("decode bak");
        assert_eq!(bak.get("nodekinds").map(String::as_str), Some("[\"Song\"]"));

        let mut reopened = DiskGraphStorage::open(&config).expect("reopen");
        assert_eq!(
            reopened.main_db().get("nodekinds").map(String::as_str),
            Some("[\"Song\",\"Author\"]")
        );
    }

    #[test]
    fn missing_managers_are_not_created_on_read() {
        let dir = tempdir().expect("tmpdir");
        let mut storage = DiskGraphStorage::open(&Config::disk(dir.path())).expect("open");

        assert!(storage
            .storage_manager("mainSong.nodes", false)
            .expect("lookup")
            .is_none());
        assert!(storage
            .storage_manager("mainSong.nodes", true)
            .expect("create")
            .is_some());
    }

    #[test]
    fn list_and_count_helpers() {
        let mut db = BTreeMap::new();
        main_db_list_add(&mut db, "parts", "main");
        main_db_list_add(&mut db, "parts", "aux");
        main_db_list_add(&mut db, "parts", "main");
        assert_eq!(main_db_list(&db, "parts"), vec!["aux", "main"]);

        main_db_count_add(&mut db, "nodecount.Song", 2);
        main_db_count_add(&mut db, "nodecount.Song", -5);
        assert_eq!(main_db_count(&db, "nodecount.Song"), 0);
    }
}
