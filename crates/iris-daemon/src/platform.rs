//! Platform collaborators the scheduler calls into

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use iris_core::DeviceId;

use crate::receiver::ReceiverError;
use crate::users::{StaticUserDirectory, UserDirectory};

/// Key store that accepts hardware authentication tokens
pub trait CredentialStore: Send + Sync {
    /// Fire-and-forget hand-off of an authentication token
    fn submit_auth_token(&self, token: &[u8]);
}

/// Power manager hook for user-presence signals
pub trait ActivityNotifier: Send + Sync {
    fn user_activity(&self);
}

/// Keeps the device awake while lockout-reset notifications are delivered
pub trait WakeLock: Send + Sync {
    fn acquire(&self, timeout: Duration);
    fn release(&self);
}

/// Held wake lock, released on drop
pub struct WakeLockGuard<'a> {
    lock: &'a dyn WakeLock,
}

impl<'a> WakeLockGuard<'a> {
    pub fn acquire(lock: &'a dyn WakeLock, timeout: Duration) -> Self {
        lock.acquire(timeout);
        Self { lock }
    }
}

impl Drop for WakeLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Told when a timed lockout ends or the counter is reset
pub trait LockoutResetObserver: Send + Sync {
    /// `Err` unregisters the observer
    fn on_lockout_reset(&self, device_id: DeviceId) -> Result<(), ReceiverError>;
}

/// Told when the service goes from idle to busy and back
pub trait ClientActiveObserver: Send + Sync {
    fn on_client_active_changed(&self, active: bool);
}

/// Collaborator that ignores every call
pub struct Noop;

impl CredentialStore for Noop {
    fn submit_auth_token(&self, token: &[u8]) {
        debug!("Discarding {}-byte auth token", token.len());
    }
}

impl ActivityNotifier for Noop {
    fn user_activity(&self) {}
}

impl WakeLock for Noop {
    fn acquire(&self, _timeout: Duration) {}
    fn release(&self) {}
}

/// Collaborators injected into the scheduler
#[derive(Clone)]
pub struct Platform {
    pub users: Arc<dyn UserDirectory>,
    pub credentials: Arc<dyn CredentialStore>,
    pub activity: Arc<dyn ActivityNotifier>,
    pub wake_lock: Arc<dyn WakeLock>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            users: Arc::new(StaticUserDirectory::single(0)),
            credentials: Arc::new(Noop),
            activity: Arc::new(Noop),
            wake_lock: Arc::new(Noop),
        }
    }
}
