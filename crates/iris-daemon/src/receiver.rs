//! Result receivers for client sessions

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use iris_core::{AcquiredInfo, DeviceId, EnrollmentRecord, ErrorCode, GroupId, TemplateId, UserId};

/// The receiving end has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("receiver disconnected")]
pub struct ReceiverError;

/// Kind-specific result callbacks for a client session
///
/// Every method defaults to a no-op so a receiver only implements the
/// results its operation can produce. An `Err` ends the session.
pub trait SessionReceiver: Send + Sync {
    fn on_enroll_result(
        &self,
        _device_id: DeviceId,
        _template_id: TemplateId,
        _group_id: GroupId,
        _remaining: u32,
    ) -> Result<(), ReceiverError> {
        Ok(())
    }

    fn on_acquired(
        &self,
        _device_id: DeviceId,
        _info: AcquiredInfo,
        _vendor_code: i32,
    ) -> Result<(), ReceiverError> {
        Ok(())
    }

    /// `record` is `None` for restricted callers
    fn on_authentication_succeeded(
        &self,
        _device_id: DeviceId,
        _record: Option<&EnrollmentRecord>,
        _user_id: UserId,
    ) -> Result<(), ReceiverError> {
        Ok(())
    }

    fn on_authentication_failed(&self, _device_id: DeviceId) -> Result<(), ReceiverError> {
        Ok(())
    }

    fn on_error(
        &self,
        _device_id: DeviceId,
        _error: ErrorCode,
        _vendor_code: i32,
    ) -> Result<(), ReceiverError> {
        Ok(())
    }

    fn on_removed(
        &self,
        _device_id: DeviceId,
        _template_id: TemplateId,
        _group_id: GroupId,
        _remaining: u32,
    ) -> Result<(), ReceiverError> {
        Ok(())
    }

    fn on_enumerated(
        &self,
        _device_id: DeviceId,
        _template_id: TemplateId,
        _group_id: GroupId,
        _remaining: u32,
    ) -> Result<(), ReceiverError> {
        Ok(())
    }
}

/// A result delivered to a [`ChannelReceiver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    EnrollResult {
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    },
    Acquired {
        info: AcquiredInfo,
        vendor_code: i32,
    },
    AuthenticationSucceeded {
        record: Option<EnrollmentRecord>,
        user_id: UserId,
    },
    AuthenticationFailed,
    Error {
        error: ErrorCode,
        vendor_code: i32,
    },
    Removed {
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    },
    Enumerated {
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    },
}

/// Receiver that forwards every result into an mpsc channel
pub struct ChannelReceiver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelReceiver {
    /// Create a receiver and the stream of its results
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: SessionEvent) -> Result<(), ReceiverError> {
        self.tx.send(event).map_err(|_| ReceiverError)
    }
}

impl SessionReceiver for ChannelReceiver {
    fn on_enroll_result(
        &self,
        _device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    ) -> Result<(), ReceiverError> {
        self.send(SessionEvent::EnrollResult {
            template_id,
            group_id,
            remaining,
        })
    }

    fn on_acquired(
        &self,
        _device_id: DeviceId,
        info: AcquiredInfo,
        vendor_code: i32,
    ) -> Result<(), ReceiverError> {
        self.send(SessionEvent::Acquired { info, vendor_code })
    }

    fn on_authentication_succeeded(
        &self,
        _device_id: DeviceId,
        record: Option<&EnrollmentRecord>,
        user_id: UserId,
    ) -> Result<(), ReceiverError> {
        self.send(SessionEvent::AuthenticationSucceeded {
            record: record.cloned(),
            user_id,
        })
    }

    fn on_authentication_failed(&self, _device_id: DeviceId) -> Result<(), ReceiverError> {
        self.send(SessionEvent::AuthenticationFailed)
    }

    fn on_error(
        &self,
        _device_id: DeviceId,
        error: ErrorCode,
        vendor_code: i32,
    ) -> Result<(), ReceiverError> {
        self.send(SessionEvent::Error { error, vendor_code })
    }

    fn on_removed(
        &self,
        _device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    ) -> Result<(), ReceiverError> {
        self.send(SessionEvent::Removed {
            template_id,
            group_id,
            remaining,
        })
    }

    fn on_enumerated(
        &self,
        _device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    ) -> Result<(), ReceiverError> {
        self.send(SessionEvent::Enumerated {
            template_id,
            group_id,
            remaining,
        })
    }
}
