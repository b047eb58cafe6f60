use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::{Database, Error, FileStorage, Result, Serializer};

/// Configuration for the storage and the database on top of it.
#[derive(Debug, Clone)]
pub struct Config {
    /// The data file. The index snapshot, lock file and pack
    /// artifacts live next to it with `.index`, `.lock`, `.pack`
    /// and `.old` appended.
    pub path: PathBuf,
    /// Open without taking the commit path. Stores fail with
    /// `Error::ReadOnly` and a torn tail is ignored rather than
    /// truncated.
    pub read_only: bool,
    /// Discard any existing data file.
    pub create: bool,
    /// fsync the data file when a transaction commits. Turning
    /// this off trades durability of the last few transactions
    /// for commit latency; atomicity is unaffected.
    pub fsync_each_commit: bool,
    /// Write the index next to the data file on close so the next
    /// open does not have to scan the whole file.
    pub save_index: bool,
    /// The ceiling on the size of a single object revision.
    pub max_record_size: usize,
    /// Keep the pre-pack data file around as `<path>.old`.
    pub pack_keep_old: bool,
    /// The number of connections that may be open at once.
    pub pool_size: usize,
    /// How long `Database::open` waits for a connection to be
    /// returned when `pool_size` connections are already open.
    /// `None` fails immediately.
    pub pool_timeout: Option<Duration>,
    /// Target number of non-ghost objects each connection keeps
    /// in its cache.
    pub cache_size: usize,
    /// Idle historical connections kept around per database.
    pub historical_pool_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: "".into(),
            read_only: false,
            create: false,
            fsync_each_commit: true,
            save_index: true,
            max_record_size: 1 << 30, // 1gb
            pack_keep_old: true,
            pool_size: 7,
            pool_timeout: None,
            cache_size: 400,
            historical_pool_size: 3,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Storage("Config's path must be set".into()));
        }

        if self.read_only && self.create {
            return Err(Error::Storage(
                "Config's read_only and create are mutually exclusive".into(),
            ));
        }

        if self.max_record_size == 0 {
            return Err(Error::Storage(
                "Config's max_record_size must be non-zero".into(),
            ));
        }

        if self.pool_size == 0 {
            return Err(Error::Storage("Config's pool_size must be non-zero".into()));
        }

        if self.cache_size == 0 {
            return Err(Error::Storage("Config's cache_size must be non-zero".into()));
        }

        Ok(())
    }

    /// Opens just the storage, using the built-in classes to find
    /// references during pack and to resolve conflicts.
    pub fn open_storage(&self) -> Result<FileStorage> {
        FileStorage::open(self, Arc::new(Serializer::new()))
    }

    /// Opens a database that knows only the built-in classes.
    pub fn open(&self) -> Result<Database> {
        self.open_with(Arc::new(Serializer::new()))
    }

    /// Opens a database that (de)serializes objects with the
    /// classes registered in `serializer`.
    pub fn open_with(&self, serializer: Arc<Serializer>) -> Result<Database> {
        let storage = FileStorage::open(self, serializer.clone())?;
        Database::new(Arc::new(storage), serializer, self.clone())
    }
}
