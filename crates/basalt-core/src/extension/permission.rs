//! Permissions a module declares to use parts of the capability façade.
//!
//! Access is deny-by-default: a façade operation whose permission is not in
//! the module's declared set fails with `PermissionDenied`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const PERMISSION_DATA_READ: &str = "data.read";
pub const PERMISSION_DATA_WRITE: &str = "data.write";
pub const PERMISSION_IDENTITY_READ: &str = "identity.read";
pub const PERMISSION_STORAGE_READ: &str = "storage.read";
pub const PERMISSION_STORAGE_WRITE: &str = "storage.write";
pub const PERMISSION_CONFIG_READ: &str = "config.read";

/// A single façade permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    DataRead,
    DataWrite,
    IdentityRead,
    StorageRead,
    StorageWrite,
    ConfigRead,
}

impl Permission {
    pub const ALL: [Permission; 6] = [
        Permission::DataRead,
        Permission::DataWrite,
        Permission::IdentityRead,
        Permission::StorageRead,
        Permission::StorageWrite,
        Permission::ConfigRead,
    ];

    /// Stable string id.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataRead => PERMISSION_DATA_READ,
            Self::DataWrite => PERMISSION_DATA_WRITE,
            Self::IdentityRead => PERMISSION_IDENTITY_READ,
            Self::StorageRead => PERMISSION_STORAGE_READ,
            Self::StorageWrite => PERMISSION_STORAGE_WRITE,
            Self::ConfigRead => PERMISSION_CONFIG_READ,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::DataRead => "Read rows from tables in the module's own schema.",
            Self::DataWrite => "Write and delete rows in the module's own schema.",
            Self::IdentityRead => "Look up users, validate tokens and check permissions.",
            Self::StorageRead => "Read blobs under the module's storage prefix.",
            Self::StorageWrite => "Write and delete blobs under the module's storage prefix.",
            Self::ConfigRead => "Read the module's current configuration.",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission parse errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    #[error("permission value must not be empty")]
    Empty,
    #[error("permission is unsupported: {0}")]
    Unsupported(String),
}

impl FromStr for Permission {
    type Err = PermissionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if normalized.is_empty() {
            return Err(PermissionError::Empty);
        }
        match normalized {
            PERMISSION_DATA_READ => Ok(Self::DataRead),
            PERMISSION_DATA_WRITE => Ok(Self::DataWrite),
            PERMISSION_IDENTITY_READ => Ok(Self::IdentityRead),
            PERMISSION_STORAGE_READ => Ok(Self::StorageRead),
            PERMISSION_STORAGE_WRITE => Ok(Self::StorageWrite),
            PERMISSION_CONFIG_READ => Ok(Self::ConfigRead),
            other => Err(PermissionError::Unsupported(other.to_string())),
        }
    }
}

impl TryFrom<String> for Permission {
    type Error = PermissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.as_str().to_string()
    }
}

/// Parses a list of permission ids, rejecting unknown ones.
pub fn parse_permissions<I, S>(values: I) -> Result<PermissionSet, PermissionError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| v.as_ref().parse::<Permission>())
        .collect::<Result<BTreeSet<_>, _>>()
        .map(PermissionSet)
}

/// The declared permission set of one module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_all_permissions() {
        for permission in Permission::ALL {
            assert_eq!(permission.as_str().parse::<Permission>(), Ok(permission));
        }
    }

    #[test]
    fn test_rejects_empty_and_unknown() {
        assert_eq!("  ".parse::<Permission>(), Err(PermissionError::Empty));
        assert_eq!(
            "data.admin".parse::<Permission>(),
            Err(PermissionError::Unsupported("data.admin".to_string()))
        );
        assert!("DATA.READ".parse::<Permission>().is_err());
    }

    #[test]
    fn test_serde_uses_string_ids() {
        let json = serde_json::to_string(&Permission::StorageWrite).unwrap();
        assert_eq!(json, "\"storage.write\"");
        let parsed: Permission = serde_json::from_str("\"identity.read\"").unwrap();
        assert_eq!(parsed, Permission::IdentityRead);
        assert!(serde_json::from_str::<Permission>("\"root\"").is_err());
    }

    #[test]
    fn test_parse_permission_list() {
        let set = parse_permissions(["data.read", "data.write", "data.read"]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(Permission::DataWrite));
        assert!(!set.contains(Permission::IdentityRead));
        assert!(parse_permissions(["data.read", "net"]).is_err());
    }
}
