use thiserror::Error;

/// Custom result type for lifecycle core operations.
pub type Result<T> = std::result::Result<T, QmsError>;

/// Closed error set surfaced by the lifecycle core. Business-rule variants map
/// 1:1 onto the external error-code contract via `error_code()`; infra
/// variants (`Database`, `FileSystem`, `Serialization`, `Config`) carry
/// whatever the underlying failure said.
#[derive(Error, Debug)]
pub enum QmsError {
    /// A requested state transition is not reachable from the current state.
    #[error("invalid transition from {from_state} to {to_state}")]
    InvalidTransition {
        from_state: String,
        to_state: String,
    },

    /// The acting user lacks the capability required for the operation.
    #[error("permission denied: {capability} required for {operation}")]
    PermissionDenied {
        capability: String,
        operation: String,
    },

    /// A critical dependency is not yet effective.
    #[error("critical dependency unmet for {document_number}: {offending:?}")]
    CriticalDependencyUnmet {
        document_number: String,
        offending: Vec<String>,
    },

    /// Other active documents still critically depend on this one.
    #[error("dependents still active on {document_number}: {dependents:?}")]
    DependentStillActive {
        document_number: String,
        dependents: Vec<String>,
    },

    /// Adding this edge would close a dependency cycle.
    #[error("circular dependency: {from_family} -> {to_family}")]
    CircularDependency {
        from_family: String,
        to_family: String,
    },

    /// A required field was absent or empty.
    #[error("missing required field: {field}")]
    MissingRequiredField { field: String },

    /// The requested entity does not exist.
    #[error("not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    /// Revoking this user would leave zero active superusers.
    #[error("last active superuser cannot be revoked: {user_id}")]
    LastSuperuserProtected { user_id: String },

    /// The operation conflicts with current state (e.g. concurrent transition).
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Database-related errors
    #[error("database error: {message}")]
    Database { message: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Audit trail errors (tamper-evidence critical)
    #[error("audit trail error: {message}")]
    AuditTrail { message: String },

    /// File system operation errors
    #[error("file system error: {path} - {message}")]
    FileSystem { path: String, message: String },

    /// Serialization/deserialization errors
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Uncategorized internal errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl QmsError {
    /// Stable error code for external callers and audit log entries.
    pub fn error_code(&self) -> &'static str {
        match self {
            QmsError::InvalidTransition { .. } => "INVALID_TRANSITION",
            QmsError::PermissionDenied { .. } => "PERMISSION_DENIED",
            QmsError::CriticalDependencyUnmet { .. } => "CRITICAL_DEPENDENCY_UNMET",
            QmsError::DependentStillActive { .. } => "DEPENDENT_STILL_ACTIVE",
            QmsError::CircularDependency { .. } => "CIRCULAR_DEPENDENCY",
            QmsError::MissingRequiredField { .. } => "MISSING_REQUIRED_FIELD",
            QmsError::NotFound { .. } => "NOT_FOUND",
            QmsError::LastSuperuserProtected { .. } => "LAST_SUPERUSER_PROTECTED",
            QmsError::Conflict { .. } => "CONFLICT",
            QmsError::Database { .. }
            | QmsError::Config { .. }
            | QmsError::AuditTrail { .. }
            | QmsError::FileSystem { .. }
            | QmsError::Serialization { .. }
            | QmsError::Internal { .. } => "INTERNAL",
        }
    }

    /// Severity level for compliance reporting and log routing.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            QmsError::AuditTrail { .. } => ErrorSeverity::Critical,
            QmsError::CircularDependency { .. } => ErrorSeverity::Critical,
            QmsError::Database { .. } | QmsError::Internal { .. } => ErrorSeverity::High,
            QmsError::CriticalDependencyUnmet { .. }
            | QmsError::DependentStillActive { .. }
            | QmsError::LastSuperuserProtected { .. } => ErrorSeverity::High,
            QmsError::InvalidTransition { .. }
            | QmsError::PermissionDenied { .. }
            | QmsError::Conflict { .. } => ErrorSeverity::Medium,
            QmsError::MissingRequiredField { .. }
            | QmsError::NotFound { .. }
            | QmsError::FileSystem { .. }
            | QmsError::Serialization { .. }
            | QmsError::Config { .. } => ErrorSeverity::Low,
        }
    }

    /// Whether the error is severe enough to page a quality/compliance owner.
    pub fn requires_fda_notification(&self) -> bool {
        matches!(self.severity(), ErrorSeverity::Critical)
    }
}

/// Error severity levels for compliance reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "LOW",
            ErrorSeverity::Medium => "MEDIUM",
            ErrorSeverity::High => "HIGH",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }
}

impl From<rusqlite::Error> for QmsError {
    fn from(err: rusqlite::Error) -> Self {
        QmsError::Database {
            message: err.to_string(),
        }
    }
}

impl From<r2d2::Error> for QmsError {
    fn from(err: r2d2::Error) -> Self {
        QmsError::Database {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for QmsError {
    fn from(err: std::io::Error) -> Self {
        QmsError::FileSystem {
            path: "unknown".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for QmsError {
    fn from(err: serde_json::Error) -> Self {
        QmsError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for QmsError {
    fn from(err: toml::de::Error) -> Self {
        QmsError::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            QmsError::InvalidTransition {
                from_state: "DRAFT".into(),
                to_state: "EFFECTIVE".into()
            }
            .error_code(),
            "INVALID_TRANSITION"
        );
        assert_eq!(
            QmsError::LastSuperuserProtected { user_id: "u1".into() }.error_code(),
            "LAST_SUPERUSER_PROTECTED"
        );
        assert_eq!(
            QmsError::Database { message: "test".into() }.error_code(),
            "INTERNAL"
        );
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            QmsError::AuditTrail { message: "test".into() }.severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            QmsError::CircularDependency {
                from_family: "A".into(),
                to_family: "B".into()
            }
            .severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            QmsError::NotFound { kind: "Document".into(), id: "x".into() }.severity(),
            ErrorSeverity::Low
        );
    }

    #[test]
    fn test_fda_notification_requirement() {
        assert!(QmsError::AuditTrail { message: "test".into() }.requires_fda_notification());
        assert!(!QmsError::NotFound { kind: "Document".into(), id: "x".into() }
            .requires_fda_notification());
    }

    #[test]
    fn test_error_severity_as_str() {
        assert_eq!(ErrorSeverity::Low.as_str(), "LOW");
        assert_eq!(ErrorSeverity::Critical.as_str(), "CRITICAL");
    }

    #[test]
    fn test_error_conversion_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let qms_error: QmsError = io_error.into();
        match qms_error {
            QmsError::FileSystem { path, message } => {
                assert_eq!(path, "unknown");
                assert!(message.contains("file not found"));
            }
            _ => panic!("expected FileSystem error"),
        }
    }
}
