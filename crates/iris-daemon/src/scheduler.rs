//! Single-session scheduler
//!
//! All session, lockout and connection state lives in [`Scheduler`], which
//! is owned by one task draining an mpsc queue. Client requests, driver
//! callbacks and timer expiries all arrive as [`Message`]s, so no state is
//! ever touched from two places at once.
//!
//! At most one session drives the hardware (`current`) and at most one
//! waits behind it (`pending`). Submitting while a client session runs
//! cancels it and arms a watchdog; the pending session starts when the
//! hardware acknowledges the cancel or the watchdog expires, whichever
//! comes first. Reconciliation sessions are never cancelled, but a client
//! waiting behind one is still covered by the watchdog; expiry abandons
//! the pass.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use iris_core::{
    DeviceId, EnrollmentRecord, ErrorCode, GroupId, LockoutMode, SessionToken, TemplateId,
    UserId,
};

use crate::config::IrisConfig;
use crate::driver::{
    DriverAccess, DriverCallback, DriverConnector, DriverEvent, HardwareConnection, IrisDriver,
};
use crate::error::Result;
use crate::lockout::{LockoutStatus, LockoutTracker};
use crate::platform::{ClientActiveObserver, LockoutResetObserver, Platform};
use crate::reconciliation::{
    generate_report, ReconciliationReport, ReconciliationStep, ReconciliationWorkflow,
};
use crate::record_store::RecordStores;
use crate::session::{
    ClientBinding, LockoutHooks, Session, SessionContext, SessionKind, SessionServices,
};
use crate::stats::{PerformanceStats, StatsBook};
use crate::timer::DeferredMessage;

/// Work item for the scheduler task
pub enum Message {
    Enroll {
        client: ClientBinding,
        challenge: Zeroizing<Vec<u8>>,
        user_id: UserId,
    },
    Authenticate {
        client: ClientBinding,
        operation_id: u64,
        group_id: GroupId,
    },
    Remove {
        client: ClientBinding,
        template_id: TemplateId,
        group_id: GroupId,
        user_id: UserId,
    },
    Enumerate {
        client: ClientBinding,
        user_id: UserId,
    },
    CancelEnrollment {
        token: SessionToken,
    },
    CancelAuthentication {
        token: SessionToken,
        owner: String,
    },
    PreEnroll {
        reply: oneshot::Sender<u64>,
    },
    PostEnroll {
        reply: oneshot::Sender<i32>,
    },
    Rename {
        template_id: TemplateId,
        user_id: UserId,
        name: String,
        reply: oneshot::Sender<bool>,
    },
    SetActiveUser {
        user_id: UserId,
    },
    UserSwitched {
        user_id: UserId,
    },
    ResetTimeout,
    AddLockoutResetObserver(Arc<dyn LockoutResetObserver>),
    AddClientActiveObserver(Arc<dyn ClientActiveObserver>),
    Query(Query),
    Driver(DriverEvent),
    CancelTimeout {
        generation: u64,
    },
    LockoutAlarm {
        generation: u64,
    },
    Shutdown,
}

/// Read-only request answered over a oneshot channel
pub enum Query {
    EnrolledRecords {
        user_id: UserId,
        reply: oneshot::Sender<Vec<EnrollmentRecord>>,
    },
    HasEnrolled {
        user_id: UserId,
        reply: oneshot::Sender<bool>,
    },
    AuthenticatorId {
        user_id: UserId,
        owner: String,
        reply: oneshot::Sender<u64>,
    },
    HardwareDetected {
        reply: oneshot::Sender<bool>,
    },
    ClientActive {
        reply: oneshot::Sender<bool>,
    },
    Lockout {
        reply: oneshot::Sender<LockoutStatus>,
    },
    Dump {
        reply: oneshot::Sender<serde_json::Value>,
    },
    ReconciliationReport {
        reply: oneshot::Sender<Option<ReconciliationReport>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Lockout and statistics hooks for the session handling a result
struct SchedulerHooks<'a> {
    tracker: &'a mut LockoutTracker,
    stats: &'a mut PerformanceStats,
    reset_on_success: bool,
    device_id: DeviceId,
}

impl LockoutHooks for SchedulerHooks<'_> {
    fn handle_failed_attempt(&mut self) -> LockoutMode {
        self.stats.reject += 1;
        let mode = self.tracker.handle_failed_attempt();
        self.stats.record_lockout(mode);
        mode
    }

    fn on_authenticated(&mut self) {
        self.stats.accept += 1;
        if self.reset_on_success {
            self.tracker.reset_failed_attempts(true, self.device_id);
        }
    }
}

/// Owner of every piece of session state
pub struct Scheduler {
    config: IrisConfig,
    platform: Platform,
    connection: Arc<HardwareConnection>,
    services: SessionServices,
    records: RecordStores,
    lockout: LockoutTracker,
    workflow: ReconciliationWorkflow,
    stats: StatsBook,

    current: Option<Session>,
    pending: Option<Session>,
    watchdog: DeferredMessage,

    authenticator_ids: HashMap<GroupId, u64>,
    current_group: Option<GroupId>,
    current_user: UserId,

    client_active: bool,
    client_active_observers: Vec<Arc<dyn ClientActiveObserver>>,
    next_session_id: u64,
}

impl Scheduler {
    /// Build a scheduler whose driver callbacks and timers post into `tx`
    pub fn new(
        config: IrisConfig,
        connector: Arc<dyn DriverConnector>,
        platform: Platform,
        records: RecordStores,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Result<Self> {
        let connection = Arc::new(HardwareConnection::new(
            connector,
            DriverCallback::new(tx.clone()),
        ));
        let services = SessionServices {
            driver: connection.clone(),
            activity: platform.activity.clone(),
        };
        let lockout = LockoutTracker::new(
            config.lockout_policy()?,
            config.lockout_reset_delay(),
            platform.wake_lock.clone(),
            config.wake_lock_timeout(),
            tx.clone(),
        );
        let current_user = platform.users.current_user();

        Ok(Self {
            platform,
            connection,
            services,
            records,
            lockout,
            workflow: ReconciliationWorkflow::new(),
            stats: StatsBook::default(),
            current: None,
            pending: None,
            watchdog: DeferredMessage::new(tx),
            authenticator_ids: HashMap::new(),
            current_group: None,
            current_user,
            client_active: false,
            client_active_observers: Vec::new(),
            next_session_id: 0,
            config,
        })
    }

    /// Drain the queue until `Shutdown`
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        info!("Iris scheduler started for user {}", self.current_user);
        self.ensure_driver();
        self.after_message();

        while let Some(message) = rx.recv().await {
            if let Message::Shutdown = message {
                break;
            }
            self.handle_message(message);
        }

        self.shutdown();
        info!("Iris scheduler stopped");
    }

    pub fn handle_message(&mut self, message: Message) {
        match message {
            Message::Enroll {
                client,
                challenge,
                user_id,
            } => self.enroll(client, challenge, user_id),
            Message::Authenticate {
                client,
                operation_id,
                group_id,
            } => self.authenticate(client, operation_id, group_id),
            Message::Remove {
                client,
                template_id,
                group_id,
                user_id,
            } => {
                let kind = SessionKind::Remove { template_id };
                let session = self.client_session(client, user_id, group_id, kind);
                self.submit(session);
            }
            Message::Enumerate { client, user_id } => {
                let kind = SessionKind::Enumerate;
                let session = self.client_session(client, user_id, user_id, kind);
                self.submit(session);
            }
            Message::CancelEnrollment { token } => {
                self.cancel(token, |kind| matches!(kind, SessionKind::Enroll { .. }))
            }
            Message::CancelAuthentication { token, owner } => {
                debug!("Cancel authentication requested by {}", owner);
                self.cancel(token, |kind| matches!(kind, SessionKind::Authenticate { .. }))
            }
            Message::PreEnroll { reply } => {
                let challenge = self.ensure_driver().map(|d| d.pre_enroll()).unwrap_or(0);
                let _ = reply.send(challenge);
            }
            Message::PostEnroll { reply } => {
                let status = self.ensure_driver().map(|d| d.post_enroll()).unwrap_or(0);
                let _ = reply.send(status);
            }
            Message::Rename {
                template_id,
                user_id,
                name,
                reply,
            } => {
                let _ = reply.send(self.records.rename(user_id, template_id, &name));
            }
            Message::SetActiveUser { user_id } => self.update_active_group(user_id, None),
            Message::UserSwitched { user_id } => self.user_switched(user_id),
            Message::ResetTimeout => {
                let device_id = self.connection.device_id();
                self.lockout.reset_failed_attempts(true, device_id);
            }
            Message::AddLockoutResetObserver(observer) => self.lockout.add_observer(observer),
            Message::AddClientActiveObserver(observer) => {
                self.client_active_observers.push(observer)
            }
            Message::Query(query) => self.answer(query),
            Message::Driver(event) => self.handle_driver_event(event),
            Message::CancelTimeout { generation } => self.on_cancel_timeout(generation),
            Message::LockoutAlarm { generation } => {
                let device_id = self.connection.device_id();
                self.lockout.on_alarm(generation, device_id);
            }
            Message::Shutdown => {}
        }
        self.after_message();
    }

    /// Bookkeeping common to every message
    fn after_message(&mut self) {
        if self.connection.take_fresh() {
            self.on_connected();
        }
        if self.current.is_none() && !self.watchdog.is_armed() {
            self.start_next();
        }
        self.refresh_client_active();
    }

    // ============================================
    // Client entry points
    // ============================================

    fn next_id(&mut self) -> u64 {
        self.next_session_id += 1;
        self.next_session_id
    }

    fn client_session(
        &mut self,
        client: ClientBinding,
        target_user: UserId,
        group_id: GroupId,
        kind: SessionKind,
    ) -> Session {
        let id = self.next_id();
        Session::client(id, client, target_user, group_id, kind, self.services.clone())
    }

    fn is_current_user_or_profile(&self, user_id: UserId) -> bool {
        user_id == self.current_user
            || self.platform.users.credential_owner(user_id) == self.current_user
    }

    fn reject(&self, client: &ClientBinding, error: ErrorCode) {
        let device_id = self.connection.device_id();
        if client.receiver.on_error(device_id, error, 0).is_err() {
            warn!("Cannot deliver {} to {}", error, client.owner);
        }
    }

    fn enroll(&mut self, client: ClientBinding, challenge: Zeroizing<Vec<u8>>, user_id: UserId) {
        let enrolled = self.records.count(user_id);
        if enrolled >= self.config.max_templates_per_user {
            warn!("Too many iris templates registered for user {}", user_id);
            self.reject(&client, ErrorCode::NoSpace);
            return;
        }
        if !self.is_current_user_or_profile(user_id) {
            warn!("Refusing enroll for user {}: not the current user or profile", user_id);
            self.reject(&client, ErrorCode::UnableToProcess);
            return;
        }

        let kind = SessionKind::Enroll {
            challenge,
            timeout_secs: self.config.enrollment_timeout_secs,
        };
        let session = self.client_session(client, user_id, user_id, kind);
        self.submit(session);
    }

    fn authenticate(&mut self, client: ClientBinding, operation_id: u64, group_id: GroupId) {
        let mode = self.lockout.mode();
        if let Some(error) = mode.error_code() {
            debug!("In lockout mode ({:?}); disallowing authentication", mode);
            self.reject(&client, error);
            return;
        }

        let kind = SessionKind::Authenticate { operation_id };
        let session = self.client_session(client, group_id, group_id, kind);
        self.submit(session);
    }

    /// Client cancel of the session holding `token`
    fn cancel(&mut self, token: SessionToken, kind_matches: fn(&SessionKind) -> bool) {
        if let Some(current) = self.current.as_mut() {
            if current.token() == token && kind_matches(current.kind()) {
                current.stop(true);
                return;
            }
        }
        let pending_matches = self
            .pending
            .as_ref()
            .is_some_and(|p| p.token() == token && kind_matches(p.kind()));
        if pending_matches {
            if let Some(mut pending) = self.pending.take() {
                debug!("Dropping {} before it started", pending);
                pending.abandon();
            }
            return;
        }
        debug!("Cancel for {} ignored: not the current session", token.short());
    }

    // ============================================
    // Serialization
    // ============================================

    /// Run `session` now or queue it behind the current one
    fn submit(&mut self, session: Session) {
        match self.current.as_mut() {
            None if !self.watchdog.is_armed() => {
                self.replace_pending(session);
                self.start_next();
            }
            None => {
                debug!("Waiting for cancel acknowledgement; {} queued", session);
                self.replace_pending(session);
            }
            Some(current) if current.is_internal() => {
                debug!("{} queued behind {}", session, current);
                self.replace_pending(session);
                self.arm_watchdog();
            }
            Some(current) => {
                if !current.is_cancelled() {
                    current.stop(false);
                }
                self.replace_pending(session);
                self.arm_watchdog();
            }
        }
    }

    fn replace_pending(&mut self, session: Session) {
        if let Some(mut superseded) = self.pending.replace(session) {
            info!("{} superseded before it started", superseded);
            superseded.abandon();
        }
    }

    fn arm_watchdog(&mut self) {
        if !self.watchdog.is_armed() {
            self.watchdog
                .arm(self.config.cancel_timeout(), |generation| Message::CancelTimeout {
                    generation,
                });
        }
    }

    fn on_cancel_timeout(&mut self, generation: u64) {
        if !self.watchdog.fire(generation) {
            return;
        }
        if let Some(mut current) = self.current.take() {
            if current.is_internal() {
                warn!("{} stalled, abandoning reconciliation", current);
                self.workflow.reset();
            }
            let next = self
                .pending
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "next session".to_string());
            warn!("{} failed to respond to cancel, starting {}", current, next);
            current.abandon();
        }
        self.start_next();
    }

    /// Start reconciliation steps first, then the pending session
    fn start_next(&mut self) {
        while self.current.is_none() {
            let reconciling = self.workflow.in_progress();
            let next = match self.workflow.next_step() {
                Some(step) => Some(self.reconciliation_session(step)),
                None => {
                    if let Some(report) = self.workflow.last_report().filter(|_| reconciling) {
                        debug!("{}", generate_report(report));
                    }
                    self.pending.take()
                }
            };
            match next {
                Some(session) => self.start_session(session),
                None => break,
            }
        }
    }

    fn reconciliation_session(&mut self, step: ReconciliationStep) -> Session {
        let id = self.next_id();
        match step {
            ReconciliationStep::Enumerate { user_id } => {
                let expected = self.records.list(user_id).to_vec();
                let kind = SessionKind::InternalEnumerate {
                    expected,
                    orphans: Vec::new(),
                };
                Session::internal(id, user_id, user_id, kind, self.services.clone())
            }
            ReconciliationStep::Remove { user_id, template } => {
                info!(
                    "Removing orphaned template {} for user {}",
                    template.id, user_id
                );
                let kind = SessionKind::InternalRemove {
                    template_id: template.id,
                };
                Session::internal(id, user_id, template.group_id, kind, self.services.clone())
            }
        }
    }

    fn start_session(&mut self, mut session: Session) {
        let owner = (!session.is_internal()).then(|| session.owner().to_string());
        self.update_active_group(session.target_user(), owner.as_deref());

        // Reconciliation steps keep a waiting client on the watchdog
        if session.is_internal() && self.pending.is_some() {
            self.arm_watchdog();
        }
        let started = session.start();
        self.current = Some(session);
        if let Err(error) = started {
            let device_id = self.connection.device_id();
            self.handle_error(device_id, error, 0);
        }
    }

    /// Tear down the current session and decide what runs next
    fn finish_current(&mut self, reason: Option<ErrorCode>) {
        let Some(mut session) = self.current.take() else {
            return;
        };
        debug!("Finished {} ({:?})", session, session.state());

        if let Some((dangling, orphans)) = session.take_reconciliation() {
            if reason.is_none() {
                self.workflow
                    .on_enumerated(session.target_user(), dangling, orphans);
            }
        }

        let acknowledged = matches!(
            reason,
            Some(ErrorCode::Canceled) | Some(ErrorCode::HwUnavailable)
        );
        if session.is_cancelled() && !acknowledged {
            debug!("{} finished with its cancel unacknowledged", session);
            self.arm_watchdog();
        } else {
            self.watchdog.disarm();
            self.start_next();
        }
    }

    // ============================================
    // Driver events
    // ============================================

    /// Run a result handler on the current session
    fn dispatch(
        &mut self,
        handler: impl FnOnce(&mut Session, &mut SessionContext<'_>) -> bool,
    ) -> Option<bool> {
        let Some(session) = self.current.as_mut() else {
            debug!("Driver event with no current session");
            return None;
        };
        let operation_id = match session.kind() {
            SessionKind::Authenticate { operation_id } => *operation_id,
            _ => 0,
        };
        let mut hooks = SchedulerHooks {
            tracker: &mut self.lockout,
            stats: self.stats.entry(session.target_user(), operation_id),
            reset_on_success: self.config.reset_lockout_on_success,
            device_id: self.connection.device_id(),
        };
        let mut ctx = SessionContext {
            records: &mut self.records,
            credentials: self.platform.credentials.as_ref(),
            lockout: &mut hooks,
        };
        Some(handler(session, &mut ctx))
    }

    fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::EnrollResult {
                device_id,
                template_id,
                group_id,
                remaining,
            } => {
                let finished = self.dispatch(|s, ctx| {
                    s.on_enroll_result(ctx, device_id, template_id, group_id, remaining)
                });
                if finished == Some(true) {
                    self.update_active_group(group_id, None);
                    self.finish_current(None);
                }
            }
            DriverEvent::Acquired {
                device_id,
                info,
                vendor_code,
            } => {
                if let Some(session) = &self.current {
                    if let SessionKind::Authenticate { operation_id } = session.kind() {
                        if self.lockout.mode() == LockoutMode::None {
                            self.stats
                                .entry(session.target_user(), *operation_id)
                                .acquire += 1;
                        }
                    }
                }
                let finished = self.dispatch(|s, _| s.on_acquired(device_id, info, vendor_code));
                if finished == Some(true) {
                    self.finish_current(None);
                }
            }
            DriverEvent::Authenticated {
                device_id,
                template_id,
                group_id,
                token,
            } => {
                let finished = self.dispatch(|s, ctx| {
                    s.on_authenticated(ctx, device_id, template_id, group_id, &token)
                });
                if finished == Some(true) {
                    self.finish_current(None);
                }
            }
            DriverEvent::Error {
                device_id,
                error,
                vendor_code,
            } => self.handle_error(device_id, error, vendor_code),
            DriverEvent::Removed {
                device_id,
                template_id,
                group_id,
                remaining,
            } => {
                let finished = self.dispatch(|s, ctx| {
                    s.on_removed(ctx, device_id, template_id, group_id, remaining)
                });
                if finished == Some(true) {
                    self.update_active_group(group_id, None);
                    self.finish_current(None);
                }
            }
            DriverEvent::Enumerate {
                device_id,
                template_id,
                group_id,
                remaining,
            } => {
                let finished = self.dispatch(|s, ctx| {
                    s.on_enumerated(ctx, device_id, template_id, group_id, remaining)
                });
                if finished == Some(true) {
                    self.finish_current(None);
                }
            }
            DriverEvent::Died => {
                error!("Iris hardware died");
                self.handle_error(self.connection.device_id(), ErrorCode::HwUnavailable, 0);
            }
        }
    }

    fn handle_error(&mut self, device_id: DeviceId, error: ErrorCode, vendor_code: i32) {
        if error == ErrorCode::HwUnavailable {
            self.connection.reset();
            self.current_group = None;
        }

        match self.current.as_mut() {
            Some(session) => {
                debug!("{} error: {}", session, error);
                if session.is_internal() {
                    self.workflow.reset();
                }
                if session.on_error(device_id, error, vendor_code) {
                    self.finish_current(Some(error));
                }
            }
            None if error == ErrorCode::Canceled => {
                debug!("Cancel acknowledged");
                self.watchdog.disarm();
                self.start_next();
            }
            None => debug!("Error {} with no current session", error),
        }
    }

    // ============================================
    // Users and groups
    // ============================================

    /// Driver handle, initializing a fresh connection before returning it
    fn ensure_driver(&mut self) -> Option<Arc<dyn IrisDriver>> {
        let driver = self.connection.driver();
        if self.connection.take_fresh() {
            self.on_connected();
        }
        driver
    }

    fn on_connected(&mut self) {
        info!(
            "Initializing iris hardware, device {}",
            self.connection.device_id()
        );
        self.current_group = None;

        let keyguard = self.config.keyguard_owner.clone();
        for user_id in self.platform.users.users() {
            let group = self.platform.users.effective_group(user_id, None, &keyguard);
            if !self.authenticator_ids.contains_key(&group) {
                self.update_active_group(group, None);
            }
        }
        self.update_active_group(self.current_user, None);

        if self.config.cleanup_unused_templates {
            self.workflow.begin(self.current_user);
        }
    }

    /// Point the hardware at the caller's effective group and refresh its authenticator id
    fn update_active_group(&mut self, user_id: UserId, owner: Option<&str>) {
        let Some(driver) = self.ensure_driver() else {
            return;
        };
        let group = self
            .platform
            .users
            .effective_group(user_id, owner, &self.config.keyguard_owner);

        if self.current_group != Some(group) {
            let dir = self.config.template_dir(group);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                error!("Cannot create {}: {}", dir.display(), e);
                return;
            }
            let status = driver.set_active_group(group, &dir);
            if status != 0 {
                warn!("Failed to activate group {}: status {}", group, status);
                return;
            }
            self.current_group = Some(group);
        }

        let id = if self.records.has_enrolled(group) {
            driver.authenticator_id()
        } else {
            0
        };
        self.authenticator_ids.insert(group, id);
    }

    fn user_switched(&mut self, user_id: UserId) {
        info!("User switched to {}", user_id);
        self.current_user = user_id;
        self.update_active_group(user_id, None);
        if !self.config.cleanup_unused_templates {
            return;
        }

        self.workflow.begin(user_id);
        if let Some(current) = self.current.as_mut() {
            if !current.is_internal() {
                if !current.is_cancelled() {
                    current.stop(false);
                }
                self.arm_watchdog();
            }
        }
    }

    // ============================================
    // Queries and observers
    // ============================================

    fn answer(&mut self, query: Query) {
        match query {
            Query::EnrolledRecords { user_id, reply } => {
                let _ = reply.send(self.records.list(user_id).to_vec());
            }
            Query::HasEnrolled { user_id, reply } => {
                let _ = reply.send(self.records.has_enrolled(user_id));
            }
            Query::AuthenticatorId {
                user_id,
                owner,
                reply,
            } => {
                let group = self.platform.users.effective_group(
                    user_id,
                    Some(&owner),
                    &self.config.keyguard_owner,
                );
                let _ = reply.send(self.authenticator_ids.get(&group).copied().unwrap_or(0));
            }
            Query::HardwareDetected { reply } => {
                let detected = self.ensure_driver().is_some() && self.connection.device_id() != 0;
                let _ = reply.send(detected);
            }
            Query::ClientActive { reply } => {
                let _ = reply.send(self.current.is_some() || self.pending.is_some());
            }
            Query::Lockout { reply } => {
                let _ = reply.send(self.lockout.status());
            }
            Query::Dump { reply } => {
                let _ = reply.send(self.dump());
            }
            Query::ReconciliationReport { reply } => {
                let _ = reply.send(self.workflow.last_report().cloned());
            }
            Query::Flush { reply } => self.records.flush(reply),
        }
    }

    fn dump(&mut self) -> serde_json::Value {
        let users: Vec<serde_json::Value> = self
            .platform
            .users
            .users()
            .into_iter()
            .map(|user_id| {
                let enrolled = self.records.count(user_id);
                self.stats.user_summary(user_id, enrolled)
            })
            .collect();
        let lockout = self.lockout.status();

        serde_json::json!({
            "service": "Iris Manager",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "device_id": self.connection.device_id(),
            "current_user": self.current_user,
            "lockout": {
                "failed_attempts": lockout.failed_attempts,
                "status": lockout.description,
            },
            "users": users,
        })
    }

    fn refresh_client_active(&mut self) {
        let active = self.current.is_some() || self.pending.is_some();
        if active != self.client_active {
            self.client_active = active;
            for observer in &self.client_active_observers {
                observer.on_client_active_changed(active);
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            pending.abandon();
        }
        if let Some(current) = self.current.as_mut() {
            current.stop(true);
        }
        self.watchdog.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{DriverCall, SimulatedConnector, SimulatedDriver};
    use crate::receiver::{ChannelReceiver, SessionEvent};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        scheduler: Scheduler,
        rx: mpsc::UnboundedReceiver<Message>,
        driver: Arc<SimulatedDriver>,
        _dir: TempDir,
    }

    impl Harness {
        fn new(driver: SimulatedDriver, cleanup: bool) -> Self {
            Self::build(driver, |config| config.cleanup_unused_templates = cleanup)
        }

        fn build(driver: SimulatedDriver, configure: impl FnOnce(&mut IrisConfig)) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = IrisConfig::with_data_dir(dir.path());
            configure(&mut config);

            let driver = Arc::new(driver);
            let connector = Arc::new(SimulatedConnector::new(driver.clone()));
            let (tx, rx) = mpsc::unbounded_channel();
            let scheduler = Scheduler::new(
                config,
                connector,
                Platform::default(),
                RecordStores::in_memory(),
                tx,
            )
            .unwrap();
            Self {
                scheduler,
                rx,
                driver,
                _dir: dir,
            }
        }

        fn send(&mut self, message: Message) {
            self.scheduler.handle_message(message);
            self.pump();
        }

        fn pump(&mut self) {
            while let Ok(message) = self.rx.try_recv() {
                self.scheduler.handle_message(message);
            }
        }

        fn client(&self) -> (ClientBinding, mpsc::UnboundedReceiver<SessionEvent>) {
            let (receiver, events) = ChannelReceiver::new();
            (ClientBinding::new(SessionToken::new(), receiver, "settings"), events)
        }

        fn enumerate(&mut self) -> (SessionToken, mpsc::UnboundedReceiver<SessionEvent>) {
            let (client, events) = self.client();
            let token = client.token;
            self.send(Message::Enumerate { client, user_id: 0 });
            (token, events)
        }

        fn running(&self) -> Option<&'static str> {
            self.scheduler.current.as_ref().map(|s| s.kind().name())
        }
    }

    #[tokio::test]
    async fn test_idle_submit_starts_immediately() {
        let mut h = Harness::new(SimulatedDriver::manual(), false);
        h.enumerate();
        assert_eq!(h.running(), Some("Enumerate"));
        assert!(h.driver.calls().contains(&DriverCall::Enumerate));
    }

    #[tokio::test]
    async fn test_cancel_ack_promotes_pending() {
        let mut h = Harness::new(SimulatedDriver::manual(), false);
        let (_, mut first) = h.enumerate();
        let (client, _events) = h.client();
        h.send(Message::Authenticate {
            client,
            operation_id: 0,
            group_id: 0,
        });

        assert_eq!(h.running(), Some("Authenticate"));
        assert!(!h.scheduler.watchdog.is_armed());
        assert_eq!(
            first.try_recv().unwrap(),
            SessionEvent::Error {
                error: ErrorCode::Canceled,
                vendor_code: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_forces_pending() {
        let mut h = Harness::new(SimulatedDriver::manual(), false);
        h.driver.set_acknowledge_cancel(false);
        h.enumerate();
        let (client, _events) = h.client();
        h.send(Message::Enumerate { client, user_id: 0 });
        assert!(h.scheduler.pending.is_some());

        tokio::time::sleep(Duration::from_millis(3100)).await;
        h.pump();
        assert!(h.scheduler.pending.is_none());
        assert_eq!(h.running(), Some("Enumerate"));
    }

    #[tokio::test]
    async fn test_client_cancel_of_pending_session() {
        let mut h = Harness::new(SimulatedDriver::manual(), false);
        h.driver.set_acknowledge_cancel(false);
        h.enumerate();
        let (client, mut events) = h.client();
        let token = client.token;
        h.send(Message::Authenticate {
            client,
            operation_id: 0,
            group_id: 0,
        });
        h.send(Message::CancelAuthentication {
            token,
            owner: "settings".to_string(),
        });

        assert!(h.scheduler.pending.is_none());
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Error {
                error: ErrorCode::Canceled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_enroll_refreshes_authenticator_id() {
        let mut h = Harness::new(SimulatedDriver::automatic(), false);
        let (client, mut events) = h.client();
        h.send(Message::Enroll {
            client,
            challenge: Zeroizing::new(vec![7; 8]),
            user_id: 0,
        });

        assert!(h.running().is_none());
        assert_eq!(h.scheduler.records.count(0), 1);
        assert_ne!(h.scheduler.authenticator_ids.get(&0).copied(), Some(0));
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(SessionEvent::EnrollResult { remaining: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_permanent_lockout_rejects_without_driver_call() {
        let mut h = Harness::build(SimulatedDriver::automatic(), |config| {
            config.cleanup_unused_templates = false;
            config.timed_lockout_threshold = 20;
        });
        let mut receivers = Vec::new();
        for _ in 0..20 {
            let (client, events) = h.client();
            h.send(Message::Authenticate {
                client,
                operation_id: 0,
                group_id: 0,
            });
            receivers.push(events);
        }
        assert_eq!(h.scheduler.lockout.mode(), LockoutMode::Permanent);
        assert_eq!(h.scheduler.stats.normal(0).reject, 20);
        assert_eq!(h.scheduler.stats.normal(0).permanent_lockout, 1);

        h.driver.clear_calls();
        let (client, mut events) = h.client();
        h.send(Message::Authenticate {
            client,
            operation_id: 0,
            group_id: 0,
        });
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Error {
                error: ErrorCode::LockoutPermanent,
                vendor_code: 0
            }
        );
        assert!(h.driver.calls().is_empty());
        assert!(h.running().is_none());
    }

    #[tokio::test]
    async fn test_hardware_death_resets_connection() {
        let mut h = Harness::new(SimulatedDriver::manual(), false);
        let (_, mut events) = h.enumerate();
        h.driver.die();
        h.pump();

        assert!(h.running().is_none());
        assert!(!h.scheduler.connection.is_connected());
        assert_eq!(h.scheduler.current_group, None);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Error {
                error: ErrorCode::HwUnavailable,
                vendor_code: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reconciliation_yields_to_client() {
        let mut h = Harness::new(SimulatedDriver::manual(), true);
        h.scheduler.ensure_driver();
        h.scheduler.after_message();
        assert_eq!(h.running(), Some("InternalEnumerate"));

        let (client, _events) = h.client();
        h.send(Message::Authenticate {
            client,
            operation_id: 0,
            group_id: 0,
        });
        assert_eq!(h.running(), Some("InternalEnumerate"));
        assert!(h.scheduler.pending.is_some());
        assert!(h.scheduler.watchdog.is_armed());
        assert!(!h.driver.calls().contains(&DriverCall::Cancel));

        tokio::time::sleep(Duration::from_millis(3100)).await;
        h.pump();
        assert_eq!(h.running(), Some("Authenticate"));
        assert!(!h.scheduler.workflow.in_progress());
        assert!(h.driver.calls().contains(&DriverCall::Authenticate {
            operation_id: 0,
            group_id: 0
        }));
    }

    #[tokio::test]
    async fn test_enroll_for_foreign_user_is_refused() {
        let mut h = Harness::new(SimulatedDriver::automatic(), false);
        let (client, mut events) = h.client();
        h.send(Message::Enroll {
            client,
            challenge: Zeroizing::new(vec![7; 8]),
            user_id: 42,
        });

        assert!(h.running().is_none());
        assert_eq!(h.scheduler.records.count(42), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Error {
                error: ErrorCode::UnableToProcess,
                vendor_code: 0
            }
        );
    }

    #[tokio::test]
    async fn test_connect_starts_reconciliation() {
        let mut h = Harness::new(SimulatedDriver::automatic(), true);
        h.driver.insert_template(0, 44);
        h.scheduler.ensure_driver();
        h.scheduler.after_message();
        h.pump();

        assert!(h.driver.templates(0).is_empty());
        let report = h.scheduler.workflow.last_report().unwrap();
        assert_eq!(report.discrepancies.len(), 1);
    }
}
