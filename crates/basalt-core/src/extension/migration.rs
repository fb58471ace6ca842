//! Per-module schema migrations.
//!
//! # Invariants
//! - Declared versions are unique and greater than zero.
//! - Migrations apply in strictly increasing version order.
//! - Each migration and its tracking records are written in one atomic batch,
//!   so a module is never left with a migration half applied.
//! - The highest applied version per module lives in the host-owned
//!   `_basalt.migration_state` table; `_basalt.migration_log` is append-only.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::store::{qualify, SchemaStore, StoreError, StoreOp};

pub const HOST_SCHEMA: &str = "_basalt";
pub const STATE_TABLE: &str = "_basalt.migration_state";
pub const LOG_TABLE: &str = "_basalt.migration_log";

/// One declarative schema operation, relative to the module's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MigrationStep {
    CreateTable { table: String },
    DropTable { table: String },
    Put { table: String, key: String, value: Value },
    Delete { table: String, key: String },
}

impl MigrationStep {
    pub fn create_table(table: impl Into<String>) -> Self {
        Self::CreateTable {
            table: table.into(),
        }
    }

    pub fn drop_table(table: impl Into<String>) -> Self {
        Self::DropTable {
            table: table.into(),
        }
    }

    pub fn put(table: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self::Put {
            table: table.into(),
            key: key.into(),
            value,
        }
    }

    pub fn delete(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Delete {
            table: table.into(),
            key: key.into(),
        }
    }

    fn scoped(&self, schema: &str) -> Result<StoreOp, StoreError> {
        Ok(match self {
            Self::CreateTable { table } => StoreOp::CreateTable {
                table: qualify(schema, table)?,
            },
            Self::DropTable { table } => StoreOp::DropTable {
                table: qualify(schema, table)?,
            },
            Self::Put { table, key, value } => StoreOp::Put {
                table: qualify(schema, table)?,
                key: key.clone(),
                value: value.clone(),
            },
            Self::Delete { table, key } => StoreOp::Delete {
                table: qualify(schema, table)?,
                key: key.clone(),
            },
        })
    }
}

/// A versioned (forward, reverse) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub version: u32,
    pub description: String,
    pub forward: Vec<MigrationStep>,
    #[serde(default)]
    pub reverse: Vec<MigrationStep>,
}

impl Migration {
    pub fn new(version: u32, description: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            forward: Vec::new(),
            reverse: Vec::new(),
        }
    }

    pub fn up(mut self, step: MigrationStep) -> Self {
        self.forward.push(step);
        self
    }

    pub fn down(mut self, step: MigrationStep) -> Self {
        self.reverse.push(step);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MigrationError {
    #[error("module `{module}` declares invalid migration version {version}")]
    InvalidVersion { module: String, version: u32 },

    #[error("module `{module}` declares migration version {version} twice")]
    DuplicateVersion { module: String, version: u32 },

    #[error("module `{module}` schema is at version {stored}, newer than the latest declared {latest}")]
    UnsupportedSchemaVersion {
        module: String,
        stored: u32,
        latest: u32,
    },

    #[error("module `{module}` migration {version} failed: {source}")]
    Failed {
        module: String,
        version: u32,
        #[source]
        source: StoreError,
    },

    #[error("module `{module}` cannot roll back to {target} from {current}")]
    InvalidTarget {
        module: String,
        target: u32,
        current: u32,
    },

    #[error("module `{module}` migration {version} has no reverse steps")]
    Irreversible { module: String, version: u32 },

    #[error("migration tracking error: {0}")]
    Store(#[from] StoreError),

    #[error("corrupt migration record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    Forward,
    Reverse,
}

/// One entry of the append-only migration log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub module: String,
    pub version: u32,
    pub description: String,
    pub direction: MigrationDirection,
    pub forward: Vec<MigrationStep>,
    pub reverse: Vec<MigrationStep>,
    pub applied_at: DateTime<Utc>,
}

/// Versions touched by one `apply_pending` or `revert_to` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub module: String,
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateRow {
    version: u32,
    updated_at: DateTime<Utc>,
}

/// Applies and tracks migrations against a [`SchemaStore`].
#[derive(Clone)]
pub struct MigrationRunner {
    store: Arc<dyn SchemaStore>,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn SchemaStore>) -> Self {
        Self { store }
    }

    fn ensure_tables(&self) -> Result<(), MigrationError> {
        for table in [STATE_TABLE, LOG_TABLE] {
            if self.store.table_exists(table)? {
                continue;
            }
            match self.store.apply(vec![StoreOp::CreateTable {
                table: table.to_string(),
            }]) {
                Ok(()) | Err(StoreError::TableExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Checks declared versions and returns them sorted ascending.
    pub fn validate<'a>(
        module: &str,
        migrations: &'a [Migration],
    ) -> Result<Vec<&'a Migration>, MigrationError> {
        let mut seen = BTreeSet::new();
        for migration in migrations {
            if migration.version == 0 {
                return Err(MigrationError::InvalidVersion {
                    module: module.to_string(),
                    version: 0,
                });
            }
            if !seen.insert(migration.version) {
                return Err(MigrationError::DuplicateVersion {
                    module: module.to_string(),
                    version: migration.version,
                });
            }
        }
        let mut sorted: Vec<&Migration> = migrations.iter().collect();
        sorted.sort_by_key(|m| m.version);
        Ok(sorted)
    }

    /// Highest applied version, 0 when none.
    pub fn current_version(&self, module: &str) -> Result<u32, MigrationError> {
        if !self.store.table_exists(STATE_TABLE)? {
            return Ok(0);
        }
        match self.store.get(STATE_TABLE, module)? {
            Some(row) => {
                let row: StateRow = serde_json::from_value(row)
                    .map_err(|e| MigrationError::Corrupt(e.to_string()))?;
                Ok(row.version)
            }
            None => Ok(0),
        }
    }

    /// Declared migrations not yet applied, ascending.
    pub fn pending<'a>(
        &self,
        module: &str,
        migrations: &'a [Migration],
    ) -> Result<Vec<&'a Migration>, MigrationError> {
        let sorted = Self::validate(module, migrations)?;
        let current = self.current_version(module)?;
        let latest = sorted.last().map_or(0, |m| m.version);
        if current > latest {
            return Err(MigrationError::UnsupportedSchemaVersion {
                module: module.to_string(),
                stored: current,
                latest,
            });
        }
        Ok(sorted.into_iter().filter(|m| m.version > current).collect())
    }

    /// Applies every pending migration in order. Stops at the first failure;
    /// migrations applied before it stay applied.
    pub fn apply_pending(
        &self,
        module: &str,
        schema: &str,
        migrations: &[Migration],
    ) -> Result<MigrationReport, MigrationError> {
        let from_version = self.current_version(module)?;
        let pending = self.pending(module, migrations)?;
        let mut report = MigrationReport {
            module: module.to_string(),
            from_version,
            to_version: from_version,
            applied: Vec::new(),
        };
        if pending.is_empty() {
            return Ok(report);
        }

        self.ensure_tables()?;
        for migration in pending {
            let fail = |source: StoreError| MigrationError::Failed {
                module: module.to_string(),
                version: migration.version,
                source,
            };
            let mut ops = migration
                .forward
                .iter()
                .map(|step| step.scoped(schema))
                .collect::<Result<Vec<_>, _>>()
                .map_err(fail)?;
            ops.extend(self.tracking_ops(
                module,
                migration,
                MigrationDirection::Forward,
                migration.version,
            )?);
            self.store.apply(ops).map_err(fail)?;

            debug!(module, version = migration.version, "Applied migration");
            report.applied.push(migration.version);
            report.to_version = migration.version;
        }
        info!(
            module,
            from = report.from_version,
            to = report.to_version,
            "Module schema migrated"
        );
        Ok(report)
    }

    /// Applies reverse steps, newest first, until the schema is at `target`.
    pub fn revert_to(
        &self,
        module: &str,
        schema: &str,
        migrations: &[Migration],
        target: u32,
    ) -> Result<MigrationReport, MigrationError> {
        let sorted = Self::validate(module, migrations)?;
        let current = self.current_version(module)?;
        let latest = sorted.last().map_or(0, |m| m.version);
        if current > latest {
            return Err(MigrationError::UnsupportedSchemaVersion {
                module: module.to_string(),
                stored: current,
                latest,
            });
        }
        if target > current {
            return Err(MigrationError::InvalidTarget {
                module: module.to_string(),
                target,
                current,
            });
        }

        let mut report = MigrationReport {
            module: module.to_string(),
            from_version: current,
            to_version: current,
            applied: Vec::new(),
        };
        let to_revert: Vec<&Migration> = sorted
            .iter()
            .rev()
            .copied()
            .filter(|m| m.version > target && m.version <= current)
            .collect();
        if let Some(m) = to_revert
            .iter()
            .find(|m| m.reverse.is_empty() && !m.forward.is_empty())
        {
            return Err(MigrationError::Irreversible {
                module: module.to_string(),
                version: m.version,
            });
        }

        for migration in to_revert {
            let fail = |source: StoreError| MigrationError::Failed {
                module: module.to_string(),
                version: migration.version,
                source,
            };
            let previous = sorted
                .iter()
                .map(|m| m.version)
                .filter(|v| *v < migration.version)
                .max()
                .unwrap_or(0);
            let mut ops = migration
                .reverse
                .iter()
                .map(|step| step.scoped(schema))
                .collect::<Result<Vec<_>, _>>()
                .map_err(fail)?;
            ops.extend(self.tracking_ops(
                module,
                migration,
                MigrationDirection::Reverse,
                previous,
            )?);
            self.store.apply(ops).map_err(fail)?;

            report.applied.push(migration.version);
            report.to_version = previous;
        }
        info!(
            module,
            from = report.from_version,
            to = report.to_version,
            "Module schema rolled back"
        );
        Ok(report)
    }

    /// Log entries for `module`, oldest first.
    pub fn history(&self, module: &str) -> Result<Vec<MigrationRecord>, MigrationError> {
        if !self.store.table_exists(LOG_TABLE)? {
            return Ok(Vec::new());
        }
        self.store
            .scan(LOG_TABLE, &log_prefix(module), None)?
            .into_iter()
            .map(|(_, row)| {
                serde_json::from_value(row).map_err(|e| MigrationError::Corrupt(e.to_string()))
            })
            .collect()
    }

    fn tracking_ops(
        &self,
        module: &str,
        migration: &Migration,
        direction: MigrationDirection,
        new_version: u32,
    ) -> Result<Vec<StoreOp>, MigrationError> {
        let now = Utc::now();
        let seq = self.store.scan(LOG_TABLE, &log_prefix(module), None)?.len();
        let record = MigrationRecord {
            module: module.to_string(),
            version: migration.version,
            description: migration.description.clone(),
            direction,
            forward: migration.forward.clone(),
            reverse: migration.reverse.clone(),
            applied_at: now,
        };
        let record =
            serde_json::to_value(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(vec![
            StoreOp::Put {
                table: STATE_TABLE.to_string(),
                key: module.to_string(),
                value: json!({ "version": new_version, "updated_at": now }),
            },
            StoreOp::Put {
                table: LOG_TABLE.to_string(),
                key: format!("{}{:08}", log_prefix(module), seq),
                value: record,
            },
        ])
    }
}

fn log_prefix(module: &str) -> String {
    format!("{module}:")
}
