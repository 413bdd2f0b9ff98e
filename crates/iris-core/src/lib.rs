//! Iris Core - Shared types for the iris biometric session service
//!
//! This crate provides the vocabulary shared between the session scheduler
//! and its collaborators: identifiers, hardware error and acquisition codes,
//! enrollment records, and the failed-attempt lockout policy.

pub mod error;
pub mod lockout;
pub mod record;
pub mod types;

pub use error::{CoreError, Result};
pub use lockout::{LockoutMode, LockoutPolicy, LockoutState};
pub use record::EnrollmentRecord;
pub use types::{
    AcquiredInfo, DeviceId, ErrorCode, GroupId, SessionToken, TemplateId, UserId,
};

/// Failed attempts that trigger a timed lockout (and every multiple thereof)
pub const MAX_FAILED_ATTEMPTS_LOCKOUT_TIMED: u32 = 5;

/// Failed attempts that trigger a permanent lockout
pub const MAX_FAILED_ATTEMPTS_LOCKOUT_PERMANENT: u32 = 20;
