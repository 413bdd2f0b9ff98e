//! Client-facing handle to the scheduler task
//!
//! Every operation is posted onto the scheduler queue. Commands return as
//! soon as they are queued; queries wait for the scheduler's reply.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;
use zeroize::Zeroizing;

use iris_core::{EnrollmentRecord, GroupId, SessionToken, TemplateId, UserId};

use crate::config::IrisConfig;
use crate::driver::DriverConnector;
use crate::error::{DaemonError, Result};
use crate::lockout::LockoutStatus;
use crate::platform::{ClientActiveObserver, LockoutResetObserver, Platform};
use crate::reconciliation::ReconciliationReport;
use crate::record_store::RecordStores;
use crate::scheduler::{Message, Query, Scheduler};
use crate::session::ClientBinding;

/// Cloneable handle to a running iris service
#[derive(Clone)]
pub struct IrisService {
    tx: mpsc::UnboundedSender<Message>,
}

impl IrisService {
    /// Validate `config`, open the record stores and start the scheduler task
    pub fn spawn(
        config: IrisConfig,
        connector: Arc<dyn DriverConnector>,
        platform: Platform,
    ) -> Result<(Self, JoinHandle<()>)> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let records = RecordStores::open(&config)?;
        let scheduler = Scheduler::new(config, connector, platform, records, tx.clone())?;
        let handle = tokio::spawn(scheduler.run(rx));
        Ok((Self { tx }, handle))
    }

    fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| DaemonError::SchedulerClosed)
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Message) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply))?;
        response.await.map_err(|_| DaemonError::SchedulerClosed)
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T> {
        self.ask(|reply| Message::Query(build(reply))).await
    }

    // ============================================
    // Operations
    // ============================================

    pub fn enroll(&self, client: ClientBinding, challenge: &[u8], user_id: UserId) -> Result<()> {
        self.send(Message::Enroll {
            client,
            challenge: Zeroizing::new(challenge.to_vec()),
            user_id,
        })
    }

    pub fn cancel_enrollment(&self, token: SessionToken) -> Result<()> {
        self.send(Message::CancelEnrollment { token })
    }

    pub fn authenticate(
        &self,
        client: ClientBinding,
        operation_id: u64,
        group_id: GroupId,
    ) -> Result<()> {
        self.send(Message::Authenticate {
            client,
            operation_id,
            group_id,
        })
    }

    pub fn cancel_authentication(&self, token: SessionToken, owner: &str) -> Result<()> {
        self.send(Message::CancelAuthentication {
            token,
            owner: owner.to_string(),
        })
    }

    /// Remove one template, or all of the group's templates when `template_id` is 0
    pub fn remove(
        &self,
        client: ClientBinding,
        template_id: TemplateId,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<()> {
        self.send(Message::Remove {
            client,
            template_id,
            group_id,
            user_id,
        })
    }

    pub fn enumerate(&self, client: ClientBinding, user_id: UserId) -> Result<()> {
        self.send(Message::Enumerate { client, user_id })
    }

    pub async fn pre_enroll(&self) -> Result<u64> {
        self.ask(|reply| Message::PreEnroll { reply }).await
    }

    pub async fn post_enroll(&self) -> Result<i32> {
        self.ask(|reply| Message::PostEnroll { reply }).await
    }

    /// Rename a record; `false` when the user has no such template
    pub async fn rename(
        &self,
        template_id: TemplateId,
        user_id: UserId,
        name: &str,
    ) -> Result<bool> {
        let name = name.to_string();
        self.ask(|reply| Message::Rename {
            template_id,
            user_id,
            name,
            reply,
        })
        .await
    }

    // ============================================
    // User and lockout control
    // ============================================

    pub fn set_active_user(&self, user_id: UserId) -> Result<()> {
        self.send(Message::SetActiveUser { user_id })
    }

    /// Foreground user changed; may start a reconciliation pass
    pub fn user_switched(&self, user_id: UserId) -> Result<()> {
        self.send(Message::UserSwitched { user_id })
    }

    /// Clear the failure counter and lift any lockout
    pub fn reset_timeout(&self) -> Result<()> {
        self.send(Message::ResetTimeout)
    }

    pub fn add_lockout_reset_observer(&self, observer: Arc<dyn LockoutResetObserver>) -> Result<()> {
        self.send(Message::AddLockoutResetObserver(observer))
    }

    pub fn add_client_active_observer(&self, observer: Arc<dyn ClientActiveObserver>) -> Result<()> {
        self.send(Message::AddClientActiveObserver(observer))
    }

    // ============================================
    // Queries
    // ============================================

    pub async fn enrolled_records(&self, user_id: UserId) -> Result<Vec<EnrollmentRecord>> {
        self.query(|reply| Query::EnrolledRecords { user_id, reply })
            .await
    }

    pub async fn has_enrolled(&self, user_id: UserId) -> Result<bool> {
        self.query(|reply| Query::HasEnrolled { user_id, reply }).await
    }

    /// Authenticator id of the group `owner` would operate on for `user_id`
    pub async fn authenticator_id(&self, user_id: UserId, owner: &str) -> Result<u64> {
        let owner = owner.to_string();
        self.query(|reply| Query::AuthenticatorId {
            user_id,
            owner,
            reply,
        })
        .await
    }

    pub async fn is_hardware_detected(&self) -> Result<bool> {
        self.query(|reply| Query::HardwareDetected { reply }).await
    }

    /// Whether a session is running or queued
    pub async fn is_client_active(&self) -> Result<bool> {
        self.query(|reply| Query::ClientActive { reply }).await
    }

    pub async fn lockout_status(&self) -> Result<LockoutStatus> {
        self.query(|reply| Query::Lockout { reply }).await
    }

    /// Diagnostic snapshot: device, lockout state and per-user statistics
    pub async fn dump(&self) -> Result<serde_json::Value> {
        self.query(|reply| Query::Dump { reply }).await
    }

    pub async fn reconciliation_report(&self) -> Result<Option<ReconciliationReport>> {
        self.query(|reply| Query::ReconciliationReport { reply })
            .await
    }

    /// Wait until every record change made so far is on disk
    pub async fn flush(&self) -> Result<()> {
        self.query(|reply| Query::Flush { reply }).await
    }

    /// Flush records, then stop the scheduler
    pub async fn shutdown(&self) -> Result<()> {
        self.flush().await?;
        info!("Stopping iris service");
        self.send(Message::Shutdown)
    }
}
