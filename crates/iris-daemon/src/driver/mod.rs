//! Hardware driver abstraction
//!
//! The driver exposes fire-and-forget primitives that return a status
//! (0 on success) and reports results later through a [`DriverCallback`].
//! Callbacks may arrive on any thread; they are re-posted onto the
//! scheduler queue before any state is touched.

pub mod simulated;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use iris_core::{AcquiredInfo, DeviceId, ErrorCode, GroupId, TemplateId};

use crate::scheduler::Message;

/// Primitives offered by the iris hardware
pub trait IrisDriver: Send + Sync {
    /// Request an enrollment challenge
    fn pre_enroll(&self) -> u64;

    /// Release the enrollment challenge
    fn post_enroll(&self) -> i32;

    /// Begin enrolling a template into `group_id`
    fn enroll(&self, challenge: &[u8], group_id: GroupId, timeout_secs: u32) -> i32;

    /// Begin matching against the templates of `group_id`
    fn authenticate(&self, operation_id: u64, group_id: GroupId) -> i32;

    /// Remove one template, or every template of the group when `template_id` is 0
    fn remove(&self, group_id: GroupId, template_id: TemplateId) -> i32;

    /// Report every template of the active group
    fn enumerate(&self) -> i32;

    /// Abort the operation in flight; acknowledged with `ErrorCode::Canceled`
    fn cancel(&self) -> i32;

    /// Switch the active group and its template storage directory
    fn set_active_group(&self, group_id: GroupId, storage_path: &Path) -> i32;

    /// Nonce identifying the active group's current template set
    fn authenticator_id(&self) -> u64;
}

/// Asynchronous result reported by the driver
#[derive(Debug, Clone)]
pub enum DriverEvent {
    EnrollResult {
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    },
    Acquired {
        device_id: DeviceId,
        info: AcquiredInfo,
        vendor_code: i32,
    },
    Authenticated {
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        token: Zeroizing<Vec<u8>>,
    },
    Error {
        device_id: DeviceId,
        error: ErrorCode,
        vendor_code: i32,
    },
    Removed {
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    },
    Enumerate {
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    },
    /// The connection to the hardware was lost
    Died,
}

/// Sink handed to the driver for its asynchronous results
#[derive(Clone)]
pub struct DriverCallback {
    tx: mpsc::UnboundedSender<Message>,
}

impl DriverCallback {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Post an event onto the scheduler queue
    pub fn post(&self, event: DriverEvent) {
        if self.tx.send(Message::Driver(event)).is_err() {
            warn!("Driver event dropped: scheduler stopped");
        }
    }

    pub fn on_enroll_result(
        &self,
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    ) {
        self.post(DriverEvent::EnrollResult {
            device_id,
            template_id,
            group_id,
            remaining,
        });
    }

    /// Raw acquisition code; unknown values are logged and dropped
    pub fn on_acquired(&self, device_id: DeviceId, info: i32, vendor_code: i32) {
        match AcquiredInfo::try_from(info) {
            Ok(info) => self.post(DriverEvent::Acquired {
                device_id,
                info,
                vendor_code,
            }),
            Err(e) => warn!("Ignoring acquired event: {}", e),
        }
    }

    pub fn on_authenticated(
        &self,
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        token: &[u8],
    ) {
        self.post(DriverEvent::Authenticated {
            device_id,
            template_id,
            group_id,
            token: Zeroizing::new(token.to_vec()),
        });
    }

    /// Raw error code; unknown values are delivered as `UnableToProcess`
    pub fn on_error(&self, device_id: DeviceId, error: i32, vendor_code: i32) {
        let error = ErrorCode::try_from(error).unwrap_or_else(|e| {
            warn!("{}; reporting as UnableToProcess", e);
            ErrorCode::UnableToProcess
        });
        self.post(DriverEvent::Error {
            device_id,
            error,
            vendor_code,
        });
    }

    pub fn on_removed(
        &self,
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    ) {
        self.post(DriverEvent::Removed {
            device_id,
            template_id,
            group_id,
            remaining,
        });
    }

    pub fn on_enumerate(
        &self,
        device_id: DeviceId,
        template_id: TemplateId,
        group_id: GroupId,
        remaining: u32,
    ) {
        self.post(DriverEvent::Enumerate {
            device_id,
            template_id,
            group_id,
            remaining,
        });
    }

    /// Connection-health notification
    pub fn on_died(&self) {
        self.post(DriverEvent::Died);
    }
}

/// Opens connections to the hardware
pub trait DriverConnector: Send + Sync {
    /// Connect and register `callback`, returning the driver and its device id
    fn connect(&self, callback: DriverCallback) -> Option<(Arc<dyn IrisDriver>, DeviceId)>;
}

/// Driver handle as seen by a session
pub trait DriverAccess: Send + Sync {
    /// Live driver, connecting lazily; `None` when the hardware is unavailable
    fn driver(&self) -> Option<Arc<dyn IrisDriver>>;

    /// Device id of the live connection, 0 when disconnected
    fn device_id(&self) -> DeviceId;
}

struct ConnectionSlot {
    driver: Option<Arc<dyn IrisDriver>>,
    device_id: DeviceId,
    fresh: bool,
}

/// The single live connection to the hardware
pub struct HardwareConnection {
    connector: Arc<dyn DriverConnector>,
    callback: DriverCallback,
    slot: Mutex<ConnectionSlot>,
}

impl HardwareConnection {
    pub fn new(connector: Arc<dyn DriverConnector>, callback: DriverCallback) -> Self {
        Self {
            connector,
            callback,
            slot: Mutex::new(ConnectionSlot {
                driver: None,
                device_id: 0,
                fresh: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().driver.is_some()
    }

    /// Drop the cached handle; the next use reconnects
    pub fn reset(&self) {
        let mut slot = self.lock();
        if slot.driver.take().is_some() {
            warn!("Dropping hardware connection (device {})", slot.device_id);
        }
        slot.device_id = 0;
        slot.fresh = false;
    }

    /// Whether a connection was opened since the last call
    pub fn take_fresh(&self) -> bool {
        std::mem::take(&mut self.lock().fresh)
    }
}

impl DriverAccess for HardwareConnection {
    fn driver(&self) -> Option<Arc<dyn IrisDriver>> {
        let mut slot = self.lock();
        if let Some(driver) = &slot.driver {
            return Some(driver.clone());
        }

        match self.connector.connect(self.callback.clone()) {
            Some((driver, device_id)) => {
                info!("Connected to iris hardware, device {}", device_id);
                slot.driver = Some(driver.clone());
                slot.device_id = device_id;
                slot.fresh = true;
                Some(driver)
            }
            None => {
                warn!("Iris hardware unavailable");
                None
            }
        }
    }

    fn device_id(&self) -> DeviceId {
        self.lock().device_id
    }
}
