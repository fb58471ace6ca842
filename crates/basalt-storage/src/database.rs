//! Shared redb database handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::Database;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Path that selects a throwaway database.
pub const MEMORY_PATH: &str = ":memory:";

/// Configuration for the redb-backed stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the database file, or `:memory:`.
    #[serde(default = "default_path")]
    pub path: String,

    /// Create parent directories if they don't exist.
    #[serde(default = "default_create_dirs")]
    pub create_dirs: bool,
}

fn default_path() -> String {
    "data/basalt.redb".to_string()
}

fn default_create_dirs() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            create_dirs: default_create_dirs(),
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            create_dirs: true,
        }
    }

    pub fn with_create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }

    /// Config for a database that is discarded when the last handle drops.
    pub fn memory() -> Self {
        Self {
            path: MEMORY_PATH.to_string(),
            create_dirs: false,
        }
    }

    pub fn is_memory(&self) -> bool {
        self.path == MEMORY_PATH
    }
}

struct DatabaseInner {
    db: Database,
    path: String,
    /// Actual file path for temporary databases (for cleanup).
    temp_path: Option<PathBuf>,
}

/// Reference-counted redb database shared by the schema and blob stores.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for SharedDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDatabase")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl SharedDatabase {
    /// Open or create the database described by `config`.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let (db, temp_path) = if config.is_memory() {
            // redb has no file-less mode here; use a temporary file instead.
            let temp_path =
                std::env::temp_dir().join(format!("basalt_{}.redb", uuid::Uuid::new_v4()));
            let db = Database::create(&temp_path)?;
            (db, Some(temp_path))
        } else {
            let path_ref = Path::new(&config.path);
            if config.create_dirs {
                if let Some(parent) = path_ref.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
            }

            let db = if path_ref.exists() {
                Database::open(path_ref)?
            } else {
                Database::create(path_ref)?
            };
            (db, None)
        };

        tracing::debug!(path = %config.path, "Opened storage database");
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                db,
                path: config.path.clone(),
                temp_path,
            }),
        })
    }

    /// Open or create a database file at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(&StorageConfig::new(
            path.as_ref().to_string_lossy().to_string(),
        ))
    }

    pub fn memory() -> Result<Self> {
        Self::open(&StorageConfig::memory())
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.temp_path.is_none()
    }

    pub(crate) fn db(&self) -> &Database {
        &self.inner.db
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if let Some(temp_path) = &self.temp_path {
            if let Err(e) = std::fs::remove_file(temp_path) {
                tracing::debug!(
                    "Failed to remove temporary database file {}: {}",
                    temp_path.display(),
                    e
                );
            }
        }
    }
}
