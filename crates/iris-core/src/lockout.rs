//! Failed-attempt lockout policy for brute-force protection
//!
//! The mode is a pure function of the failure counter:
//!
//! - every multiple of the timed threshold (5, 10, 15): timed lockout,
//!   until the reset alarm clears it
//! - at the permanent threshold (20) or beyond: permanent lockout, until an
//!   authorized reset zeroes the counter
//! - otherwise: authentication allowed

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::ErrorCode;
use crate::{MAX_FAILED_ATTEMPTS_LOCKOUT_PERMANENT, MAX_FAILED_ATTEMPTS_LOCKOUT_TIMED};

/// Whether authentication attempts are currently allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockoutMode {
    /// Attempts allowed
    None,
    /// Attempts suspended until the reset alarm fires
    Timed,
    /// Attempts suspended until an authorized reset
    Permanent,
}

impl LockoutMode {
    /// Error delivered to a caller turned away by this mode
    pub fn error_code(self) -> Option<ErrorCode> {
        match self {
            LockoutMode::None => None,
            LockoutMode::Timed => Some(ErrorCode::Lockout),
            LockoutMode::Permanent => Some(ErrorCode::LockoutPermanent),
        }
    }
}

/// Lockout thresholds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutPolicy {
    /// Timed lockout at every multiple of this many failures
    pub timed_threshold: u32,
    /// Permanent lockout at this many failures
    pub permanent_threshold: u32,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            timed_threshold: MAX_FAILED_ATTEMPTS_LOCKOUT_TIMED,
            permanent_threshold: MAX_FAILED_ATTEMPTS_LOCKOUT_PERMANENT,
        }
    }
}

impl LockoutPolicy {
    /// Create a policy, rejecting thresholds that could never lock out
    pub fn new(timed_threshold: u32, permanent_threshold: u32) -> Result<Self> {
        if timed_threshold == 0 {
            return Err(CoreError::InvalidLockoutPolicy(
                "timed threshold must be positive".to_string(),
            ));
        }
        if permanent_threshold < timed_threshold {
            return Err(CoreError::InvalidLockoutPolicy(format!(
                "permanent threshold {} below timed threshold {}",
                permanent_threshold, timed_threshold
            )));
        }
        Ok(Self {
            timed_threshold,
            permanent_threshold,
        })
    }

    /// Lockout mode for the given counter state
    pub fn mode(&self, failed_attempts: u32, timed_lockout_cleared: bool) -> LockoutMode {
        if failed_attempts >= self.permanent_threshold {
            LockoutMode::Permanent
        } else if failed_attempts > 0
            && !timed_lockout_cleared
            && failed_attempts % self.timed_threshold == 0
        {
            LockoutMode::Timed
        } else {
            LockoutMode::None
        }
    }

    /// Human-readable description of the lockout state
    pub fn describe(&self, state: &LockoutState) -> String {
        match self.mode(state.failed_attempts, state.timed_lockout_cleared) {
            LockoutMode::Permanent => "Locked until reset".to_string(),
            LockoutMode::Timed => format!("Locked after {} failures", state.failed_attempts),
            LockoutMode::None => format!(
                "{} attempts before permanent lockout",
                self.permanent_threshold.saturating_sub(state.failed_attempts)
            ),
        }
    }
}

/// Failure counter owned by the scheduler
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutState {
    /// Consecutive failed authentications
    pub failed_attempts: u32,
    /// Set once the timed lockout alarm (or a reset) has fired
    pub timed_lockout_cleared: bool,
}

impl LockoutState {
    /// Count one failed authentication and return the resulting mode
    pub fn record_failure(&mut self, policy: &LockoutPolicy) -> LockoutMode {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.timed_lockout_cleared = false;
        self.mode(policy)
    }

    /// Clear the timed lockout, and the counter too when `clear_counter`
    pub fn reset(&mut self, clear_counter: bool) {
        if clear_counter {
            self.failed_attempts = 0;
        }
        self.timed_lockout_cleared = true;
    }

    /// Current mode under `policy`
    pub fn mode(&self, policy: &LockoutPolicy) -> LockoutMode {
        policy.mode(self.failed_attempts, self.timed_lockout_cleared)
    }
}
