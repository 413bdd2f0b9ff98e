//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use iris_core::{LockoutPolicy, UserId};

use crate::error::DaemonError;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IrisConfig {
    /// Root for per-user record files and hardware template storage
    pub data_dir: PathBuf,

    /// Maximum enrolled templates per user
    pub max_templates_per_user: usize,

    /// How long to wait for the hardware to acknowledge a cancel (milliseconds)
    pub cancel_timeout_ms: u64,

    /// Delay before a timed lockout is lifted (milliseconds)
    pub lockout_reset_ms: u64,

    /// Enrollment timeout handed to the hardware (seconds)
    pub enrollment_timeout_secs: u32,

    /// Timed lockout at every multiple of this many failures
    pub timed_lockout_threshold: u32,

    /// Permanent lockout at this many failures
    pub permanent_lockout_threshold: u32,

    /// Whether to reconcile hardware templates against records on user switch
    pub cleanup_unused_templates: bool,

    /// Whether a successful authentication zeroes the failure counter
    pub reset_lockout_on_success: bool,

    /// Owner label of the lock screen, which always resolves to the credential owner
    pub keyguard_owner: String,

    /// How long a lockout-reset notification may hold the wake lock (milliseconds)
    pub wake_lock_timeout_ms: u64,
}

impl Default for IrisConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            max_templates_per_user: 5,
            cancel_timeout_ms: 3000,
            lockout_reset_ms: 30_000,
            enrollment_timeout_secs: 60,
            timed_lockout_threshold: iris_core::MAX_FAILED_ATTEMPTS_LOCKOUT_TIMED,
            permanent_lockout_threshold: iris_core::MAX_FAILED_ATTEMPTS_LOCKOUT_PERMANENT,
            cleanup_unused_templates: true,
            reset_lockout_on_success: true,
            keyguard_owner: "keyguard".to_string(),
            wake_lock_timeout_ms: 2000,
        }
    }
}

impl IrisConfig {
    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("iris")
    }

    /// Configuration rooted at `data_dir`, otherwise default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_templates_per_user == 0 {
            return Err(DaemonError::Config(
                "max_templates_per_user must be positive".to_string(),
            ));
        }
        if self.cancel_timeout_ms == 0 {
            return Err(DaemonError::Config(
                "cancel_timeout_ms must be positive".to_string(),
            ));
        }
        self.lockout_policy()?;
        Ok(())
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> crate::Result<()> {
        std::fs::create_dir_all(self.data_dir.join("users"))?;
        Ok(())
    }

    /// Lockout thresholds as a policy
    pub fn lockout_policy(&self) -> crate::Result<LockoutPolicy> {
        Ok(LockoutPolicy::new(
            self.timed_lockout_threshold,
            self.permanent_lockout_threshold,
        )?)
    }

    /// Watchdog interval for unacknowledged cancels
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    /// Timed lockout duration
    pub fn lockout_reset_delay(&self) -> Duration {
        Duration::from_millis(self.lockout_reset_ms)
    }

    /// Wake lock bound for lockout-reset notifications
    pub fn wake_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.wake_lock_timeout_ms)
    }

    /// Directory holding a user's record file
    pub fn user_dir(&self, user_id: UserId) -> PathBuf {
        self.data_dir.join("users").join(user_id.to_string())
    }

    /// Record file for a user
    pub fn records_path(&self, user_id: UserId) -> PathBuf {
        self.user_dir(user_id).join("iris_records.json")
    }

    /// Template storage directory handed to the hardware for a group
    pub fn template_dir(&self, user_id: UserId) -> PathBuf {
        self.user_dir(user_id).join("irisdata")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.json");

        let mut config = IrisConfig::with_data_dir(temp_dir.path());
        config.max_templates_per_user = 3;
        config.save(&path).unwrap();

        let loaded = IrisConfig::load(&path).unwrap();
        assert_eq!(loaded.max_templates_per_user, 3);
        assert_eq!(loaded.data_dir, temp_dir.path());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.json");
        std::fs::write(&path, r#"{ "cancel_timeout_ms": 500 }"#).unwrap();

        let loaded = IrisConfig::load(&path).unwrap();
        assert_eq!(loaded.cancel_timeout(), Duration::from_millis(500));
        assert_eq!(loaded.permanent_lockout_threshold, 20);
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        let config = IrisConfig {
            timed_lockout_threshold: 10,
            permanent_lockout_threshold: 5,
            ..IrisConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_data_dir_under_platform_data_dir() {
        let config = IrisConfig::default();
        assert!(config.data_dir.ends_with("iris"));
        if let Some(base) = dirs::data_local_dir() {
            assert_eq!(config.data_dir, base.join("iris"));
        }
    }

    #[test]
    fn test_user_paths() {
        let config = IrisConfig::with_data_dir("/data/iris");
        assert_eq!(
            config.template_dir(10),
            PathBuf::from("/data/iris/users/10/irisdata")
        );
        assert_eq!(
            config.records_path(0),
            PathBuf::from("/data/iris/users/0/iris_records.json")
        );
    }
}
