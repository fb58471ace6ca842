//! Descriptor, status and error types shared by the extension runtime.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::store::StoreError;

/// Maximum length of a module name.
pub const MAX_MODULE_NAME_LEN: usize = 48;

// ============================================================================
// Descriptor
// ============================================================================

/// Static description of a module. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique key, also the route and schema segment.
    pub name: String,
    pub version: semver::Version,
    /// Names of modules that must be registered (and enabled) first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Host versions this module is compatible with.
    pub host_requirement: semver::VersionReq,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, version: semver::Version) -> Self {
        Self {
            name: name.into(),
            version,
            dependencies: Vec::new(),
            host_requirement: semver::VersionReq::STAR,
            tags: Vec::new(),
            description: None,
        }
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn with_host_requirement(mut self, requirement: semver::VersionReq) -> Self {
        self.host_requirement = requirement;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validates declaration-level invariants.
    pub fn validate(&self) -> std::result::Result<(), RegistrationError> {
        if !is_valid_module_name(&self.name) {
            return Err(RegistrationError::InvalidDescriptor(format!(
                "module name is invalid: `{}` (lowercase letters, digits, `_` or `-`, starting with a letter)",
                self.name
            )));
        }
        for dependency in &self.dependencies {
            if dependency == &self.name {
                return Err(RegistrationError::InvalidDescriptor(format!(
                    "module `{}` cannot depend on itself",
                    self.name
                )));
            }
            if !is_valid_module_name(dependency) {
                return Err(RegistrationError::InvalidDescriptor(format!(
                    "dependency name is invalid: `{dependency}`"
                )));
            }
        }
        Ok(())
    }
}

/// Module names double as path segments and schema suffixes.
pub fn is_valid_module_name(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_MODULE_NAME_LEN {
        return false;
    }
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

// ============================================================================
// Status & health
// ============================================================================

/// Lifecycle status, mutated only by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Registered,
    Initializing,
    Enabled,
    Failed,
    Disabled,
}

impl ModuleStatus {
    /// Whether `enable` may be attempted from this status.
    pub fn can_enable(self) -> bool {
        matches!(self, Self::Registered | Self::Failed | Self::Disabled)
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Initializing => "initializing",
            Self::Enabled => "enabled",
            Self::Failed => "failed",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Reported health of an enabled module. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Result of one `Extension::health` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub state: HealthState,
    #[serde(default)]
    pub message: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            state: HealthState::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Unhealthy,
            message: Some(message.into()),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by module code and by the façade.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtensionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Storage quota exceeded: {used} of {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Other: {0}")]
    Other(String),
}

impl ExtensionError {
    /// HTTP status a module route returns for this error.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidInput(_) | Self::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for ExtensionError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<StoreError> for ExtensionError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::TableNotFound(table) => Self::NotFound(format!("table {table}")),
            StoreError::InvalidName(name) => Self::InvalidInput(format!("invalid name: {name}")),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Result type for module-facing operations.
pub type Result<T> = std::result::Result<T, ExtensionError>;

/// Rejections from `Registry::register`. No state changes on error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("module already registered: {0}")]
    Duplicate(String),

    #[error("module `{module}` depends on unregistered module `{dependency}`")]
    MissingDependency { module: String, dependency: String },

    #[error("module `{module}` requires host {required}, host is {host}")]
    IncompatibleHost {
        module: String,
        required: semver::VersionReq,
        host: semver::Version,
    },

    #[error("invalid module descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Stage of `enable` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStage {
    Config,
    Migrations,
    Initialize,
    Registration,
    Start,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config validation",
            Self::Migrations => "migrations",
            Self::Initialize => "initialize",
            Self::Registration => "registration",
            Self::Start => "start",
        };
        f.write_str(s)
    }
}

/// Errors from the registry's public API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("module `{module}` failed during {stage}: {message}")]
    Initialization {
        module: String,
        stage: InitStage,
        message: String,
    },

    #[error("module `{module}` rejected configuration: {source}")]
    Config {
        module: String,
        #[source]
        source: ExtensionError,
    },

    #[error("module not found: {0}")]
    NotFound(String),

    #[error("module `{module}` cannot {action} while {status}")]
    InvalidState {
        module: String,
        action: &'static str,
        status: ModuleStatus,
    },

    #[error("module `{module}` requires `{dependency}` to be enabled")]
    DependencyNotEnabled { module: String, dependency: String },

    #[error("module `{module}` migration error: {message}")]
    Migration { module: String, message: String },
}

impl RegistryError {
    /// Name of the module the error concerns, when there is one.
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::Registration(RegistrationError::Duplicate(m)) => Some(m),
            Self::Registration(RegistrationError::MissingDependency { module, .. })
            | Self::Registration(RegistrationError::IncompatibleHost { module, .. }) => {
                Some(module)
            }
            Self::Registration(RegistrationError::InvalidDescriptor(_)) => None,
            Self::Initialization { module, .. }
            | Self::Config { module, .. }
            | Self::InvalidState { module, .. }
            | Self::DependencyNotEnabled { module, .. }
            | Self::Migration { module, .. } => Some(module),
            Self::NotFound(m) => Some(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> ModuleDescriptor {
        ModuleDescriptor::new(name, semver::Version::new(1, 0, 0))
    }

    #[test]
    fn test_accepts_valid_names() {
        for name in ["analytics", "web-hooks", "cloud_storage2"] {
            assert!(descriptor(name).validate().is_ok(), "{name}");
        }
    }

    #[test]
    fn test_rejects_invalid_names() {
        for name in ["", "Analytics", "9lives", "a.b", "a/b", &"x".repeat(49)] {
            let err = descriptor(name).validate().unwrap_err();
            assert!(matches!(err, RegistrationError::InvalidDescriptor(_)), "{name}");
        }
    }

    #[test]
    fn test_rejects_self_dependency() {
        let err = descriptor("analytics")
            .with_dependency("analytics")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn test_status_display_and_transitions() {
        assert_eq!(ModuleStatus::Enabled.to_string(), "enabled");
        assert!(ModuleStatus::Disabled.can_enable());
        assert!(ModuleStatus::Failed.can_enable());
        assert!(!ModuleStatus::Enabled.can_enable());
        assert!(!ModuleStatus::Initializing.can_enable());
    }

    #[test]
    fn test_error_status_codes() {
        use axum::http::StatusCode;
        assert_eq!(
            ExtensionError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ExtensionError::PermissionDenied("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ExtensionError::ExecutionFailed("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_registry_error_exposes_module() {
        let err = RegistryError::Initialization {
            module: "analytics".into(),
            stage: InitStage::Start,
            message: "boom".into(),
        };
        assert_eq!(err.module(), Some("analytics"));
        assert!(err.to_string().contains("start"));
    }
}
