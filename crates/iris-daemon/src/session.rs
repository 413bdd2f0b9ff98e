//! Sessions: one outstanding operation against the hardware
//!
//! Every session runs `Created -> Running -> (Completed | Cancelled | Errored)`.
//! `start` issues exactly one driver request; results are routed to the
//! handler matching the event kind, which returns `true` once the session is
//! finished. A handler invoked on a session of the wrong kind logs and
//! reports the session finished.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use iris_core::{
    AcquiredInfo, DeviceId, EnrollmentRecord, ErrorCode, GroupId, LockoutMode, SessionToken,
    TemplateId, UserId,
};

use crate::driver::DriverAccess;
use crate::platform::{ActivityNotifier, CredentialStore};
use crate::receiver::{ReceiverError, SessionReceiver};
use crate::record_store::RecordStores;

/// Owner label of sessions the service starts on its own
pub const INTERNAL_OWNER: &str = "iris-service";

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Cancelled,
    Errored,
}

/// Operation a session performs, with its kind-specific payload
pub enum SessionKind {
    Enroll {
        challenge: Zeroizing<Vec<u8>>,
        timeout_secs: u32,
    },
    Authenticate {
        operation_id: u64,
    },
    Remove {
        template_id: TemplateId,
    },
    Enumerate,
    /// Enumeration checked against the user's records
    InternalEnumerate {
        /// Records not yet confirmed by the hardware
        expected: Vec<EnrollmentRecord>,
        /// Hardware templates without a record
        orphans: Vec<EnrollmentRecord>,
    },
    /// Removal of an orphaned template
    InternalRemove {
        template_id: TemplateId,
    },
}

impl SessionKind {
    pub fn name(&self) -> &'static str {
        match self {
            SessionKind::Enroll { .. } => "Enroll",
            SessionKind::Authenticate { .. } => "Authenticate",
            SessionKind::Remove { .. } => "Remove",
            SessionKind::Enumerate => "Enumerate",
            SessionKind::InternalEnumerate { .. } => "InternalEnumerate",
            SessionKind::InternalRemove { .. } => "InternalRemove",
        }
    }

    /// Sessions started by the service for reconciliation
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            SessionKind::InternalEnumerate { .. } | SessionKind::InternalRemove { .. }
        )
    }
}

/// Caller identity a client session is bound to
#[derive(Clone)]
pub struct ClientBinding {
    pub token: SessionToken,
    pub receiver: Arc<dyn SessionReceiver>,
    pub restricted: bool,
    pub owner: String,
}

impl ClientBinding {
    pub fn new(
        token: SessionToken,
        receiver: Arc<dyn SessionReceiver>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            token,
            receiver,
            restricted: false,
            owner: owner.into(),
        }
    }

    /// Hide record details from this caller
    pub fn restricted(mut self) -> Self {
        self.restricted = true;
        self
    }
}

/// Capabilities every session is constructed with
#[derive(Clone)]
pub struct SessionServices {
    pub driver: Arc<dyn DriverAccess>,
    pub activity: Arc<dyn ActivityNotifier>,
}

/// Failure-counter hooks driven by authentication results
pub trait LockoutHooks {
    /// Count a rejection and return the resulting mode
    fn handle_failed_attempt(&mut self) -> LockoutMode;

    /// Called on a successful match
    fn on_authenticated(&mut self);
}

/// Scheduler state a result handler may touch
pub struct SessionContext<'a> {
    pub records: &'a mut RecordStores,
    pub credentials: &'a dyn CredentialStore,
    pub lockout: &'a mut dyn LockoutHooks,
}

/// One operation bound to the hardware
pub struct Session {
    id: u64,
    token: SessionToken,
    receiver: Option<Arc<dyn SessionReceiver>>,
    target_user: UserId,
    group_id: GroupId,
    restricted: bool,
    owner: String,
    kind: SessionKind,
    state: SessionState,
    cancelled: bool,
    cancel_notified: bool,
    services: SessionServices,
}

impl Session {
    /// Session on behalf of a caller
    pub fn client(
        id: u64,
        binding: ClientBinding,
        target_user: UserId,
        group_id: GroupId,
        kind: SessionKind,
        services: SessionServices,
    ) -> Self {
        Self {
            id,
            token: binding.token,
            receiver: Some(binding.receiver),
            target_user,
            group_id,
            restricted: binding.restricted,
            owner: binding.owner,
            kind,
            state: SessionState::Created,
            cancelled: false,
            cancel_notified: false,
            services,
        }
    }

    /// Session the service runs for itself
    pub fn internal(
        id: u64,
        target_user: UserId,
        group_id: GroupId,
        kind: SessionKind,
        services: SessionServices,
    ) -> Self {
        Self {
            id,
            token: SessionToken::new(),
            receiver: None,
            target_user,
            group_id,
            restricted: true,
            owner: INTERNAL_OWNER.to_string(),
            kind,
            state: SessionState::Created,
            cancelled: false,
            cancel_notified: false,
            services,
        }
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn kind(&self) -> &SessionKind {
        &self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target_user(&self) -> UserId {
        self.target_user
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_internal(&self) -> bool {
        self.kind.is_internal()
    }

    /// Whether a cancel has been issued to the hardware
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn deliver(
        &self,
        send: impl FnOnce(&dyn SessionReceiver) -> Result<(), ReceiverError>,
    ) -> Result<(), ReceiverError> {
        match &self.receiver {
            Some(receiver) => send(receiver.as_ref()).map_err(|e| {
                warn!("{}: {}", self, e);
                e
            }),
            None => Ok(()),
        }
    }

    fn complete(&mut self, finished: bool) -> bool {
        if finished && self.state == SessionState::Running {
            self.state = SessionState::Completed;
        }
        finished
    }

    /// A gone receiver ends the session; stop the hardware if it is mid-operation
    fn settle(&mut self, sent: Result<(), ReceiverError>, done: bool) -> bool {
        if sent.is_err() && !done {
            self.stop(false);
        }
        self.complete(sent.is_err() || done)
    }

    fn unexpected(&self, callback: &str) -> bool {
        warn!("{} called for {}!", callback, self);
        true
    }

    /// Issue the driver request for this session
    ///
    /// A missing driver or a nonzero status fails with `HwUnavailable`,
    /// which the scheduler delivers through [`on_error`](Self::on_error).
    pub fn start(&mut self) -> Result<(), ErrorCode> {
        let Some(driver) = self.services.driver.driver() else {
            warn!("{}: hardware not available", self);
            return Err(ErrorCode::HwUnavailable);
        };

        let status = match &self.kind {
            SessionKind::Enroll {
                challenge,
                timeout_secs,
            } => driver.enroll(challenge, self.group_id, *timeout_secs),
            SessionKind::Authenticate { operation_id } => {
                driver.authenticate(*operation_id, self.group_id)
            }
            SessionKind::Remove { template_id } | SessionKind::InternalRemove { template_id } => {
                driver.remove(self.group_id, *template_id)
            }
            SessionKind::Enumerate | SessionKind::InternalEnumerate { .. } => driver.enumerate(),
        };

        if status != 0 {
            warn!("{}: start failed, status {}", self, status);
            return Err(ErrorCode::HwUnavailable);
        }
        debug!("Started {}", self);
        self.state = SessionState::Running;
        Ok(())
    }

    /// Ask the hardware to cancel; a second stop is a no-op
    ///
    /// A client-initiated stop tells the receiver `Canceled` right away; the
    /// hardware acknowledgement still ends the session.
    pub fn stop(&mut self, initiated_by_client: bool) {
        if self.cancelled {
            warn!("{}: stop requested but already cancelled", self);
            return;
        }
        let Some(driver) = self.services.driver.driver() else {
            warn!("{}: cannot stop, hardware not available", self);
            return;
        };
        let status = driver.cancel();
        if status != 0 {
            warn!("{}: cancel failed, status {}", self, status);
            return;
        }
        debug!("Stopping {} (by client: {})", self, initiated_by_client);
        self.cancelled = true;
        if initiated_by_client {
            self.notify_canceled();
        }
    }

    /// Tell the receiver the session was cancelled, at most once
    pub fn notify_canceled(&mut self) {
        if self.cancel_notified {
            return;
        }
        self.cancel_notified = true;
        let device_id = self.services.driver.device_id();
        let _ = self.deliver(|r| r.on_error(device_id, ErrorCode::Canceled, 0));
    }

    /// Drop a session that will never be started or acknowledged
    pub fn abandon(&mut self) {
        self.notify_canceled();
        self.state = SessionState::Cancelled;
    }

    pub fn on_enroll_result(
        &mut self,
        ctx: &mut SessionContext<'_>,
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    ) -> bool {
        if !matches!(self.kind, SessionKind::Enroll { .. }) {
            return self.unexpected("on_enroll_result");
        }
        if group_id != self.group_id {
            warn!(
                "Enroll result for group {} on session for group {}",
                group_id, self.group_id
            );
        }
        if remaining == 0 && template_id != 0 {
            ctx.records
                .add(self.target_user, template_id, group_id, device_id);
        }
        let sent = self.deliver(|r| r.on_enroll_result(device_id, template_id, group_id, remaining));
        self.settle(sent, remaining == 0)
    }

    /// Forwarded to the receiver; a good capture counts as user activity
    pub fn on_acquired(&mut self, device_id: DeviceId, info: AcquiredInfo, vendor_code: i32) -> bool {
        if info == AcquiredInfo::Good {
            self.services.activity.user_activity();
        }
        let sent = self.deliver(|r| r.on_acquired(device_id, info, vendor_code));
        self.settle(sent, false)
    }

    /// Single-shot: the session finishes on every result
    pub fn on_authenticated(
        &mut self,
        ctx: &mut SessionContext<'_>,
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        token: &[u8],
    ) -> bool {
        if !matches!(self.kind, SessionKind::Authenticate { .. }) {
            return self.unexpected("on_authenticated");
        }

        let user_id = self.target_user;
        if template_id != 0 {
            if !token.is_empty() {
                ctx.credentials.submit_auth_token(token);
            }
            let record = if self.restricted {
                None
            } else {
                Some(
                    ctx.records
                        .get(user_id, template_id)
                        .unwrap_or_else(|| EnrollmentRecord::anonymous(template_id, group_id, device_id)),
                )
            };
            let _ = self.deliver(|r| r.on_authentication_succeeded(device_id, record.as_ref(), user_id));
            ctx.lockout.on_authenticated();
        } else {
            let _ = self.deliver(|r| r.on_authentication_failed(device_id));
            let mode = ctx.lockout.handle_failed_attempt();
            if let Some(error) = mode.error_code() {
                let _ = self.deliver(|r| r.on_error(device_id, error, 0));
            }
        }
        self.complete(true)
    }

    /// Always finishes the session
    pub fn on_error(&mut self, device_id: DeviceId, error: ErrorCode, vendor_code: i32) -> bool {
        if error == ErrorCode::Canceled {
            self.state = SessionState::Cancelled;
            if self.cancel_notified {
                return true;
            }
            self.cancel_notified = true;
        } else {
            self.state = SessionState::Errored;
        }
        let _ = self.deliver(|r| r.on_error(device_id, error, vendor_code));
        true
    }

    pub fn on_removed(
        &mut self,
        ctx: &mut SessionContext<'_>,
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    ) -> bool {
        if !matches!(
            self.kind,
            SessionKind::Remove { .. } | SessionKind::InternalRemove { .. }
        ) {
            return self.unexpected("on_removed");
        }
        if template_id != 0 {
            ctx.records.remove(self.target_user, template_id);
        }
        let sent = self.deliver(|r| r.on_removed(device_id, template_id, group_id, remaining));
        self.settle(sent, remaining == 0)
    }

    pub fn on_enumerated(
        &mut self,
        ctx: &mut SessionContext<'_>,
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    ) -> bool {
        let user_id = self.target_user;
        match &mut self.kind {
            SessionKind::Enumerate => {
                let sent =
                    self.deliver(|r| r.on_enumerated(device_id, template_id, group_id, remaining));
                self.settle(sent, remaining == 0)
            }
            SessionKind::InternalEnumerate { expected, orphans } => {
                if let Some(pos) = expected.iter().position(|r| r.id == template_id) {
                    expected.remove(pos);
                } else if template_id != 0 {
                    orphans.push(EnrollmentRecord::anonymous(template_id, group_id, device_id));
                }
                if remaining == 0 {
                    for record in expected.iter() {
                        error!(
                            "Removing dangling enrolled record {} for user {}",
                            record.id, user_id
                        );
                        ctx.records.remove(user_id, record.id);
                    }
                }
                self.complete(remaining == 0)
            }
            _ => self.unexpected("on_enumerated"),
        }
    }

    /// Dangling records and orphaned templates found by an internal enumeration
    pub fn take_reconciliation(&mut self) -> Option<(Vec<EnrollmentRecord>, Vec<EnrollmentRecord>)> {
        match &mut self.kind {
            SessionKind::InternalEnumerate { expected, orphans } => {
                Some((std::mem::take(expected), std::mem::take(orphans)))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} ({}, group {})",
            self.kind.name(),
            self.id,
            self.owner,
            self.group_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{DriverCall, SimulatedConnector, SimulatedDriver};
    use crate::driver::{DriverCallback, HardwareConnection};
    use crate::platform::Noop;
    use crate::receiver::{ChannelReceiver, SessionEvent};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Hooks {
        failures: u32,
        successes: u32,
        lock_at: Option<u32>,
    }

    impl LockoutHooks for Hooks {
        fn handle_failed_attempt(&mut self) -> LockoutMode {
            self.failures += 1;
            if Some(self.failures) == self.lock_at {
                LockoutMode::Permanent
            } else {
                LockoutMode::None
            }
        }
        fn on_authenticated(&mut self) {
            self.successes += 1;
        }
    }

    #[derive(Default)]
    struct Tokens(Mutex<Vec<Vec<u8>>>);

    impl CredentialStore for Tokens {
        fn submit_auth_token(&self, token: &[u8]) {
            self.0.lock().unwrap().push(token.to_vec());
        }
    }

    #[derive(Default)]
    struct Activity(AtomicU32);

    impl ActivityNotifier for Activity {
        fn user_activity(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        driver: Arc<SimulatedDriver>,
        services: SessionServices,
        activity: Arc<Activity>,
        _rx: mpsc::UnboundedReceiver<crate::scheduler::Message>,
    }

    fn fixture() -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Arc::new(SimulatedDriver::manual());
        let connection = HardwareConnection::new(
            Arc::new(SimulatedConnector::new(driver.clone())),
            DriverCallback::new(tx),
        );
        let activity = Arc::new(Activity::default());
        Fixture {
            driver,
            services: SessionServices {
                driver: Arc::new(connection),
                activity: activity.clone(),
            },
            activity,
            _rx: rx,
        }
    }

    fn client(
        fx: &Fixture,
        kind: SessionKind,
    ) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (receiver, events) = ChannelReceiver::new();
        let binding = ClientBinding::new(SessionToken::new(), receiver, "settings");
        (
            Session::client(1, binding, 5, 5, kind, fx.services.clone()),
            events,
        )
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_display_names_session() {
        let fx = fixture();
        let (session, _events) = client(&fx, SessionKind::Enumerate);
        assert_eq!(session.to_string(), "Enumerate #1 (settings, group 5)");
    }

    #[test]
    fn test_enroll_adds_record_on_last_step() {
        let fx = fixture();
        let (mut session, mut events) = client(
            &fx,
            SessionKind::Enroll {
                challenge: Zeroizing::new(vec![1, 2, 3]),
                timeout_secs: 60,
            },
        );
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);

        let mut records = RecordStores::in_memory();
        let mut hooks = Hooks::default();
        let mut ctx = SessionContext {
            records: &mut records,
            credentials: &Noop,
            lockout: &mut hooks,
        };

        assert!(!session.on_enroll_result(&mut ctx, 1, 7, 5, 1));
        assert!(session.on_enroll_result(&mut ctx, 1, 7, 5, 0));
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(records.list(5)[0].id, 7);
        assert_eq!(drain(&mut events).len(), 2);
    }

    #[test]
    fn test_authentication_failure_reports_lockout() {
        let fx = fixture();
        let (mut session, mut events) = client(&fx, SessionKind::Authenticate { operation_id: 0 });
        session.start().unwrap();

        let mut records = RecordStores::in_memory();
        let mut hooks = Hooks {
            lock_at: Some(1),
            ..Hooks::default()
        };
        let mut ctx = SessionContext {
            records: &mut records,
            credentials: &Noop,
            lockout: &mut hooks,
        };
        assert!(session.on_authenticated(&mut ctx, 1, 0, 5, &[]));
        assert_eq!(hooks.failures, 1);
        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::AuthenticationFailed,
                SessionEvent::Error {
                    error: ErrorCode::LockoutPermanent,
                    vendor_code: 0
                }
            ]
        );
    }

    #[test]
    fn test_authentication_success_forwards_token() {
        let fx = fixture();
        let (receiver, mut events) = ChannelReceiver::new();
        let binding = ClientBinding::new(SessionToken::new(), receiver, "keyguard").restricted();
        let mut session = Session::client(
            2,
            binding,
            5,
            5,
            SessionKind::Authenticate { operation_id: 9 },
            fx.services.clone(),
        );
        session.start().unwrap();

        let mut records = RecordStores::in_memory();
        records.add(5, 7, 5, 1);
        let tokens = Tokens::default();
        let mut hooks = Hooks::default();
        let mut ctx = SessionContext {
            records: &mut records,
            credentials: &tokens,
            lockout: &mut hooks,
        };
        assert!(session.on_authenticated(&mut ctx, 1, 7, 5, &[0xAA; 4]));
        assert_eq!(hooks.successes, 1);
        assert_eq!(tokens.0.lock().unwrap().len(), 1);
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::AuthenticationSucceeded {
                record: None,
                user_id: 5
            }]
        );
    }

    #[test]
    fn test_mismatched_callback_finishes() {
        let fx = fixture();
        let (mut session, _events) = client(&fx, SessionKind::Enumerate);
        let mut records = RecordStores::in_memory();
        let mut hooks = Hooks::default();
        let mut ctx = SessionContext {
            records: &mut records,
            credentials: &Noop,
            lockout: &mut hooks,
        };
        assert!(session.on_authenticated(&mut ctx, 1, 3, 5, &[]));
        assert!(session.on_enroll_result(&mut ctx, 1, 3, 5, 2));
        assert_eq!(hooks.failures, 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let fx = fixture();
        let (mut session, mut events) = client(&fx, SessionKind::Enumerate);
        session.start().unwrap();

        session.stop(true);
        session.stop(true);
        let cancels = fx
            .driver
            .calls()
            .into_iter()
            .filter(|c| *c == DriverCall::Cancel)
            .count();
        assert_eq!(cancels, 1);

        assert!(session.on_error(1, ErrorCode::Canceled, 0));
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::Error {
                error: ErrorCode::Canceled,
                vendor_code: 0
            }]
        );
    }

    #[test]
    fn test_start_failure() {
        let fx = fixture();
        fx.driver.set_failing(true);
        let (mut session, _events) = client(&fx, SessionKind::Remove { template_id: 3 });
        assert_eq!(session.start(), Err(ErrorCode::HwUnavailable));
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn test_internal_enumerate_sorts_templates() {
        let fx = fixture();
        let mut records = RecordStores::in_memory();
        records.add(5, 1, 5, 1);
        records.add(5, 2, 5, 1);
        let expected = records.list(5).to_vec();

        let mut session = Session::internal(
            3,
            5,
            5,
            SessionKind::InternalEnumerate {
                expected,
                orphans: Vec::new(),
            },
            fx.services.clone(),
        );
        session.start().unwrap();

        let mut hooks = Hooks::default();
        let mut ctx = SessionContext {
            records: &mut records,
            credentials: &Noop,
            lockout: &mut hooks,
        };
        assert!(!session.on_enumerated(&mut ctx, 1, 1, 5, 1));
        assert!(session.on_enumerated(&mut ctx, 1, 9, 5, 0));

        let (dangling, orphans) = session.take_reconciliation().unwrap();
        assert_eq!(dangling.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(orphans.iter().map(|r| r.id).collect::<Vec<_>>(), vec![9]);
        assert_eq!(records.list(5).iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_good_capture_is_user_activity() {
        let fx = fixture();
        let (mut session, _events) = client(&fx, SessionKind::Enumerate);
        assert!(!session.on_acquired(1, AcquiredInfo::Good, 0));
        assert!(!session.on_acquired(1, AcquiredInfo::TooFar, 0));
        assert_eq!(fx.activity.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gone_receiver_stops_hardware() {
        let fx = fixture();
        let (mut session, events) = client(
            &fx,
            SessionKind::Enroll {
                challenge: Zeroizing::new(vec![]),
                timeout_secs: 60,
            },
        );
        session.start().unwrap();
        drop(events);

        assert!(session.on_acquired(1, AcquiredInfo::Good, 0));
        assert!(session.is_cancelled());
    }
}
