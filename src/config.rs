use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{QmsError, Result};

/// Top-level configuration for the lifecycle core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub application: ApplicationConfig,
    pub compliance: ComplianceConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Organization name for compliance reporting.
    pub organization_name: String,

    /// Root directory for file-store artifacts (originals, signed PDFs).
    #[serde(default = "default_data_dir")]
    pub data_directory: String,
}

/// Compliance-related settings (21 CFR Part 11 / ALCOA).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// Audit retention period in days (minimum 7 years).
    #[serde(default = "default_audit_retention")]
    pub audit_retention_days: u32,

    /// Whether reviewer == approver on the same document is a hard error
    /// (false: surfaced as a non-fatal warning, per spec §4.2.2/§9).
    #[serde(default = "default_false")]
    pub reject_same_reviewer_approver: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (rolled daily).
    #[serde(default = "default_log_file")]
    pub file: String,

    /// Use JSON format for structured logging.
    #[serde(default = "default_true")]
    pub json_format: bool,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (file path or `:memory:`).
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Enable WAL mode for better read concurrency.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

/// Scheduler cadence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Beat interval in seconds between due-task scans.
    #[serde(default = "default_beat_interval")]
    pub beat_interval_seconds: u64,

    /// Workflow SLA timeout in hours before escalation.
    #[serde(default = "default_workflow_timeout")]
    pub workflow_timeout_hours: u32,
}

impl Config {
    /// Load configuration from a TOML file, validating on the way out.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| QmsError::Config {
            message: format!("failed to read config file: {e}"),
        })?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration against compliance requirements.
    pub fn validate(&self) -> Result<()> {
        if self.compliance.audit_retention_days < 2555 {
            return Err(QmsError::Config {
                message: "audit_retention_days must be at least 2555 (7 years)".to_string(),
            });
        }

        if self.application.organization_name.trim().is_empty() {
            return Err(QmsError::MissingRequiredField {
                field: "organization_name".to_string(),
            });
        }

        if self.scheduler.beat_interval_seconds == 0 {
            return Err(QmsError::Config {
                message: "beat_interval_seconds must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Render a commented sample configuration file.
    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_else(|_| String::new())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            compliance: ComplianceConfig::default(),
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            organization_name: "Medical Device Company".to_string(),
            data_directory: default_data_dir(),
        }
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            audit_retention_days: default_audit_retention(),
            reject_same_reviewer_approver: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            json_format: default_true(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            wal_mode: true,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            beat_interval_seconds: default_beat_interval(),
            workflow_timeout_hours: default_workflow_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_data_dir() -> String {
    "./qms-data".to_string()
}
fn default_audit_retention() -> u32 {
    2555
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> String {
    "./qms-data/qms.log".to_string()
}
fn default_database_url() -> String {
    "./qms-data/qms.db".to_string()
}
fn default_max_connections() -> u32 {
    10
}
fn default_beat_interval() -> u64 {
    30
}
fn default_workflow_timeout() -> u32 {
    72
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation_success() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_audit_retention() {
        let mut config = Config::default();
        config.compliance.audit_retention_days = 365;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_organization_name() {
        let mut config = Config::default();
        config.application.organization_name = "".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_beat_interval() {
        let mut config = Config::default();
        config.scheduler.beat_interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_sample_generation() {
        let sample = Config::generate_sample();
        assert!(!sample.is_empty());
        assert!(sample.contains("organization_name"));
        assert!(sample.contains("audit_retention_days"));
    }

    #[test]
    fn test_default_values_compliance() {
        let config = Config::default();
        assert_eq!(config.compliance.audit_retention_days, 2555);
        assert_eq!(config.scheduler.beat_interval_seconds, 30);
    }
}
