//! Persistent storage for the Basalt host.
//!
//! redb-backed implementations of the runtime's persistence collaborators:
//! [`RedbStore`] for module schemas and [`RedbBlobStorage`] for module
//! blobs. Both share one database file through [`SharedDatabase`].

pub mod blobs;
pub mod database;
pub mod error;
pub mod schema;

use std::sync::Arc;

use basalt_core::extension::{HostServices, IdentityProvider};

pub use blobs::RedbBlobStorage;
pub use database::{SharedDatabase, StorageConfig};
pub use error::{Error, Result};
pub use schema::RedbStore;

/// Open the database described by `config` and build host services on it.
pub fn open_host_services(
    config: &StorageConfig,
    identity: Arc<dyn IdentityProvider>,
) -> Result<HostServices> {
    let db = SharedDatabase::open(config)?;
    let store = RedbStore::new(db.clone())?;
    let blobs = RedbBlobStorage::new(db)?;
    Ok(HostServices::new(
        Arc::new(store),
        identity,
        Arc::new(blobs),
    ))
}
