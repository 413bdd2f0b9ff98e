//! Per-user authentication statistics

use serde::Serialize;
use std::collections::BTreeMap;

use iris_core::{LockoutMode, UserId};

/// Counters for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerformanceStats {
    pub accept: u32,
    pub reject: u32,
    pub acquire: u32,
    pub lockout: u32,
    pub permanent_lockout: u32,
}

impl PerformanceStats {
    /// Count the lockout a failed attempt produced
    pub fn record_lockout(&mut self, mode: LockoutMode) {
        match mode {
            LockoutMode::Timed => self.lockout += 1,
            LockoutMode::Permanent => self.permanent_lockout += 1,
            LockoutMode::None => {}
        }
    }
}

/// Statistics split by whether the authentication was bound to a crypto operation
#[derive(Debug, Default)]
pub struct StatsBook {
    normal: BTreeMap<UserId, PerformanceStats>,
    crypto: BTreeMap<UserId, PerformanceStats>,
}

impl StatsBook {
    /// Counters for a user; `operation_id != 0` selects the crypto set
    pub fn entry(&mut self, user_id: UserId, operation_id: u64) -> &mut PerformanceStats {
        let map = if operation_id != 0 {
            &mut self.crypto
        } else {
            &mut self.normal
        };
        map.entry(user_id).or_default()
    }

    pub fn normal(&self, user_id: UserId) -> PerformanceStats {
        self.normal.get(&user_id).copied().unwrap_or_default()
    }

    pub fn crypto(&self, user_id: UserId) -> PerformanceStats {
        self.crypto.get(&user_id).copied().unwrap_or_default()
    }

    /// JSON dump entry for one user
    pub fn user_summary(&self, user_id: UserId, enrolled: usize) -> serde_json::Value {
        let stats = self.normal(user_id);
        let crypto = self.crypto(user_id);
        serde_json::json!({
            "id": user_id,
            "count": enrolled,
            "accept": stats.accept,
            "reject": stats.reject,
            "acquire": stats.acquire,
            "lockout": stats.lockout,
            "permanentLockout": stats.permanent_lockout,
            "acceptCrypto": crypto.accept,
            "rejectCrypto": crypto.reject,
            "acquireCrypto": crypto.acquire,
            "lockoutCrypto": crypto.lockout,
            "permanentLockoutCrypto": crypto.permanent_lockout,
        })
    }
}
