//! Error types for the nearline cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the nearline cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error (unusable cache root, bad config file, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Index Errors
    // =========================================================================
    /// Cache index persistence failed
    #[error("Cache index error: {0}")]
    Index(String),

    /// Concurrent writers kept racing on the same record
    #[error("Concurrent modification of cache file {checksum} for tenant {tenant} after {attempts} attempts")]
    ConcurrentModification {
        tenant: String,
        checksum: String,
        attempts: u32,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Config file parse error
    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Checksum cannot be used as a content address
    #[error("Invalid checksum '{checksum}': {reason}")]
    InvalidChecksum { checksum: String, reason: String },

    /// Tenant identifier cannot be used as a partition name
    #[error("Invalid tenant '{tenant}': {reason}")]
    InvalidTenant { tenant: String, reason: String },

    /// Location is not a valid URL
    #[error("Invalid cache file location: {0}")]
    InvalidLocation(#[from] url::ParseError),

    /// Tenant partition could not be initialized
    #[error("Cache partition for tenant {0} is not initialized")]
    TenantNotInitialized(String),
}

impl Error {
    /// Whether the error is a misconfiguration that must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::DurationParse(_)
        )
    }
}
