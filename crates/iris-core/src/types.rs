//! Core type aliases and newtypes

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

/// User identifier
pub type UserId = i32;

/// Enrollment namespace on the hardware, normally equal to the user id
pub type GroupId = i32;

/// Hardware template identifier; 0 means "no template"
pub type TemplateId = i32;

/// Identifier handed out by the driver when the connection is opened
pub type DeviceId = u64;

/// Opaque capability a caller presents to start or cancel an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(Uuid);

impl SessionToken {
    /// Mint a fresh token
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short display format (first 8 hex digits)
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// First vendor-specific error code
pub const ERROR_VENDOR_BASE: i32 = 1000;

/// First vendor-specific acquisition code
pub const ACQUIRED_VENDOR_BASE: i32 = 1000;

/// Error reported to a session, either by the hardware or synthesized locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Driver connection lost or a driver call was rejected
    HwUnavailable,
    /// The sensor could not process the current image
    UnableToProcess,
    /// The request ran too long (enroll challenge expiry)
    Timeout,
    /// Not enough storage left to enroll
    NoSpace,
    /// A cancel request was acknowledged
    Canceled,
    /// The remove request failed
    UnableToRemove,
    /// Too many failed attempts; authentication suspended for a while
    Lockout,
    /// Vendor error with a vendor code alongside
    Vendor,
    /// Too many timed lockouts; authentication suspended until reset
    LockoutPermanent,
    /// The user dismissed the operation
    UserCanceled,
    /// Vendor-defined code at or above [`ERROR_VENDOR_BASE`]
    VendorSpecific(i32),
}

impl ErrorCode {
    /// Numeric wire value
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::HwUnavailable => 1,
            ErrorCode::UnableToProcess => 2,
            ErrorCode::Timeout => 3,
            ErrorCode::NoSpace => 4,
            ErrorCode::Canceled => 5,
            ErrorCode::UnableToRemove => 6,
            ErrorCode::Lockout => 7,
            ErrorCode::Vendor => 8,
            ErrorCode::LockoutPermanent => 9,
            ErrorCode::UserCanceled => 10,
            ErrorCode::VendorSpecific(code) => code,
        }
    }

    /// Whether this code is produced by the lockout policy rather than the hardware
    pub fn is_lockout(self) -> bool {
        matches!(self, ErrorCode::Lockout | ErrorCode::LockoutPermanent)
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = CoreError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => ErrorCode::HwUnavailable,
            2 => ErrorCode::UnableToProcess,
            3 => ErrorCode::Timeout,
            4 => ErrorCode::NoSpace,
            5 => ErrorCode::Canceled,
            6 => ErrorCode::UnableToRemove,
            7 => ErrorCode::Lockout,
            8 => ErrorCode::Vendor,
            9 => ErrorCode::LockoutPermanent,
            10 => ErrorCode::UserCanceled,
            c if c >= ERROR_VENDOR_BASE => ErrorCode::VendorSpecific(c),
            c => return Err(CoreError::UnknownErrorCode(c)),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::VendorSpecific(code) => write!(f, "VENDOR({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Image acquisition feedback emitted while an operation is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcquiredInfo {
    Good,
    Insufficient,
    TooBright,
    TooDark,
    TooClose,
    TooFar,
    EyesClosed,
    EyesPartiallyObscured,
    DetectedOneEye,
    DetectedTwoEye,
    DetectedTooManyEyes,
    /// Vendor message with a vendor code alongside
    Vendor,
    /// Vendor-defined code at or above [`ACQUIRED_VENDOR_BASE`]
    VendorSpecific(i32),
}

impl AcquiredInfo {
    /// Numeric wire value
    pub fn code(self) -> i32 {
        match self {
            AcquiredInfo::Good => 0,
            AcquiredInfo::Insufficient => 1,
            AcquiredInfo::TooBright => 2,
            AcquiredInfo::TooDark => 3,
            AcquiredInfo::TooClose => 4,
            AcquiredInfo::TooFar => 5,
            AcquiredInfo::EyesClosed => 6,
            AcquiredInfo::EyesPartiallyObscured => 7,
            AcquiredInfo::DetectedOneEye => 8,
            AcquiredInfo::DetectedTwoEye => 9,
            AcquiredInfo::DetectedTooManyEyes => 10,
            AcquiredInfo::Vendor => 11,
            AcquiredInfo::VendorSpecific(code) => code,
        }
    }
}

impl TryFrom<i32> for AcquiredInfo {
    type Error = CoreError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => AcquiredInfo::Good,
            1 => AcquiredInfo::Insufficient,
            2 => AcquiredInfo::TooBright,
            3 => AcquiredInfo::TooDark,
            4 => AcquiredInfo::TooClose,
            5 => AcquiredInfo::TooFar,
            6 => AcquiredInfo::EyesClosed,
            7 => AcquiredInfo::EyesPartiallyObscured,
            8 => AcquiredInfo::DetectedOneEye,
            9 => AcquiredInfo::DetectedTwoEye,
            10 => AcquiredInfo::DetectedTooManyEyes,
            11 => AcquiredInfo::Vendor,
            c if c >= ACQUIRED_VENDOR_BASE => AcquiredInfo::VendorSpecific(c),
            c => return Err(CoreError::UnknownAcquiredInfo(c)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_values() {
        assert_eq!(ErrorCode::HwUnavailable.code(), 1);
        assert_eq!(ErrorCode::Canceled.code(), 5);
        assert_eq!(ErrorCode::LockoutPermanent.code(), 9);
        assert_eq!(ErrorCode::try_from(7).unwrap(), ErrorCode::Lockout);
    }

    #[test]
    fn test_error_code_vendor_range() {
        assert_eq!(
            ErrorCode::try_from(1002).unwrap(),
            ErrorCode::VendorSpecific(1002)
        );
        assert_eq!(
            ErrorCode::try_from(42),
            Err(CoreError::UnknownErrorCode(42))
        );
    }

    #[test]
    fn test_lockout_codes() {
        assert!(ErrorCode::Lockout.is_lockout());
        assert!(ErrorCode::LockoutPermanent.is_lockout());
        assert!(!ErrorCode::Canceled.is_lockout());
    }

    #[test]
    fn test_acquired_info_codes() {
        assert_eq!(AcquiredInfo::try_from(0).unwrap(), AcquiredInfo::Good);
        assert_eq!(AcquiredInfo::TooFar.code(), 5);
        assert!(AcquiredInfo::try_from(-1).is_err());
    }

    #[test]
    fn test_tokens_are_distinct() {
        let a = SessionToken::new();
        let b = SessionToken::new();
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 8);
    }
}
