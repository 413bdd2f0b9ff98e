//! Lockout tracking with timed reset and observer notification

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use iris_core::{DeviceId, LockoutMode, LockoutPolicy, LockoutState};

use crate::platform::{LockoutResetObserver, WakeLock, WakeLockGuard};
use crate::scheduler::Message;
use crate::timer::DeferredMessage;

/// Snapshot of the lockout state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutStatus {
    pub mode: LockoutMode,
    pub failed_attempts: u32,
    pub description: String,
}

/// Failure counter plus the alarm that lifts a timed lockout
pub struct LockoutTracker {
    policy: LockoutPolicy,
    state: LockoutState,
    reset_delay: Duration,
    alarm: DeferredMessage,
    observers: Vec<Arc<dyn LockoutResetObserver>>,
    wake_lock: Arc<dyn WakeLock>,
    wake_lock_timeout: Duration,
}

impl LockoutTracker {
    pub fn new(
        policy: LockoutPolicy,
        reset_delay: Duration,
        wake_lock: Arc<dyn WakeLock>,
        wake_lock_timeout: Duration,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            policy,
            state: LockoutState::default(),
            reset_delay,
            alarm: DeferredMessage::new(tx),
            observers: Vec::new(),
            wake_lock,
            wake_lock_timeout,
        }
    }

    pub fn mode(&self) -> LockoutMode {
        self.state.mode(&self.policy)
    }

    pub fn state(&self) -> &LockoutState {
        &self.state
    }

    /// Human-readable lockout status
    pub fn describe(&self) -> String {
        self.policy.describe(&self.state)
    }

    pub fn status(&self) -> LockoutStatus {
        LockoutStatus {
            mode: self.mode(),
            failed_attempts: self.state.failed_attempts,
            description: self.describe(),
        }
    }

    /// Count a rejected authentication; a resulting lockout arms the reset alarm
    pub fn handle_failed_attempt(&mut self) -> LockoutMode {
        let mode = self.state.record_failure(&self.policy);
        if mode != LockoutMode::None {
            warn!(
                "Iris lockout after {} failed attempts: {:?}",
                self.state.failed_attempts, mode
            );
            self.alarm
                .arm(self.reset_delay, |generation| Message::LockoutAlarm { generation });
        }
        mode
    }

    /// Lift a timed lockout, zeroing the counter too when `clear_counter`
    pub fn reset_failed_attempts(&mut self, clear_counter: bool, device_id: DeviceId) {
        if self.mode() != LockoutMode::None {
            info!("Reset iris lockout, clear counter: {}", clear_counter);
        }
        self.state.reset(clear_counter);
        self.alarm.disarm();
        self.notify_observers(device_id);
    }

    /// Reset alarm expiry
    pub fn on_alarm(&mut self, generation: u64, device_id: DeviceId) {
        if self.alarm.fire(generation) {
            debug!("Lockout reset alarm fired");
            self.reset_failed_attempts(false, device_id);
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn LockoutResetObserver>) {
        self.observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn notify_observers(&mut self, device_id: DeviceId) {
        let wake_lock = self.wake_lock.clone();
        let timeout = self.wake_lock_timeout;
        self.observers.retain(|observer| {
            let _guard = WakeLockGuard::acquire(wake_lock.as_ref(), timeout);
            match observer.on_lockout_reset(device_id) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Removing lockout reset observer: {}", e);
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::ReceiverError;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLock {
        held: AtomicI32,
        acquired: AtomicUsize,
    }

    impl WakeLock for CountingLock {
        fn acquire(&self, _timeout: Duration) {
            self.held.fetch_add(1, Ordering::SeqCst);
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self) {
            self.held.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct Observer {
        alive: AtomicBool,
        calls: AtomicUsize,
    }

    impl Observer {
        fn new(alive: bool) -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(alive),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl LockoutResetObserver for Observer {
        fn on_lockout_reset(&self, _device_id: DeviceId) -> Result<(), ReceiverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ReceiverError)
            }
        }
    }

    fn tracker(
        lock: Arc<CountingLock>,
    ) -> (LockoutTracker, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = LockoutTracker::new(
            LockoutPolicy::default(),
            Duration::from_secs(30),
            lock,
            Duration::from_secs(2),
            tx,
        );
        (tracker, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_lockout_lifted_by_alarm() {
        let (mut tracker, mut rx) = tracker(Arc::new(CountingLock::default()));
        for _ in 0..4 {
            assert_eq!(tracker.handle_failed_attempt(), LockoutMode::None);
        }
        assert_eq!(tracker.handle_failed_attempt(), LockoutMode::Timed);

        tokio::time::sleep(Duration::from_secs(31)).await;
        match rx.try_recv() {
            Ok(Message::LockoutAlarm { generation }) => tracker.on_alarm(generation, 1),
            _ => panic!("expected lockout alarm"),
        }
        assert_eq!(tracker.mode(), LockoutMode::None);
        assert_eq!(tracker.state().failed_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_lockout_survives_alarm() {
        let (mut tracker, mut rx) = tracker(Arc::new(CountingLock::default()));
        for _ in 0..20 {
            tracker.handle_failed_attempt();
        }
        assert_eq!(tracker.mode(), LockoutMode::Permanent);

        tokio::time::sleep(Duration::from_secs(31)).await;
        if let Ok(Message::LockoutAlarm { generation }) = rx.try_recv() {
            tracker.on_alarm(generation, 1);
        }
        assert_eq!(tracker.mode(), LockoutMode::Permanent);

        tracker.reset_failed_attempts(true, 1);
        assert_eq!(tracker.mode(), LockoutMode::None);
    }

    #[tokio::test]
    async fn test_dead_observer_removed_and_lock_released() {
        let lock = Arc::new(CountingLock::default());
        let (mut tracker, _rx) = tracker(lock.clone());
        let live = Observer::new(true);
        let dead = Observer::new(false);
        tracker.add_observer(live.clone());
        tracker.add_observer(dead.clone());

        tracker.reset_failed_attempts(true, 1);
        assert_eq!(tracker.observer_count(), 1);
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(lock.held.load(Ordering::SeqCst), 0);

        tracker.reset_failed_attempts(true, 1);
        assert_eq!(live.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dead.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_describe() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tracker = LockoutTracker::new(
            LockoutPolicy::default(),
            Duration::from_secs(30),
            Arc::new(crate::platform::Noop),
            Duration::from_secs(2),
            tx,
        );
        assert_eq!(tracker.describe(), "20 attempts before permanent lockout");
    }
}
