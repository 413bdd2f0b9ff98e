//! Error types for iris core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while interpreting values reported by the hardware
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Error code outside the known and vendor ranges
    #[error("Unknown hardware error code: {0}")]
    UnknownErrorCode(i32),

    /// Acquisition code outside the known and vendor ranges
    #[error("Unknown acquired info: {0}")]
    UnknownAcquiredInfo(i32),

    /// Lockout thresholds that cannot produce a sane policy
    #[error("Invalid lockout policy: {0}")]
    InvalidLockoutPolicy(String),
}
