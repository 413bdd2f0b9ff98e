//! Software stand-in for the iris hardware
//!
//! Keeps templates per group in memory. In automatic mode every request is
//! answered immediately with the callbacks real hardware would send; in
//! manual mode requests are only recorded and tests inject results with
//! [`SimulatedDriver::emit`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use tracing::debug;
use zeroize::Zeroizing;

use iris_core::{AcquiredInfo, DeviceId, ErrorCode, GroupId, TemplateId};

use super::{DriverCallback, DriverConnector, DriverEvent, IrisDriver};

/// Device id reported by [`SimulatedConnector`]
pub const SIMULATED_DEVICE_ID: DeviceId = 0x1815;

/// A request the driver received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    PreEnroll,
    PostEnroll,
    Enroll { group_id: GroupId, timeout_secs: u32 },
    Authenticate { operation_id: u64, group_id: GroupId },
    Remove { group_id: GroupId, template_id: TemplateId },
    Enumerate,
    Cancel,
    SetActiveGroup { group_id: GroupId },
}

struct SimState {
    callback: Option<DriverCallback>,
    device_id: DeviceId,
    templates: HashMap<GroupId, Vec<TemplateId>>,
    active_group: GroupId,
    authenticator_id: u64,
    calls: Vec<DriverCall>,
}

/// In-memory iris hardware
pub struct SimulatedDriver {
    auto_respond: bool,
    enroll_steps: u32,
    acknowledge_cancel: AtomicBool,
    failing: AtomicBool,
    state: Mutex<SimState>,
}

impl SimulatedDriver {
    fn with_mode(auto_respond: bool) -> Self {
        Self {
            auto_respond,
            enroll_steps: 3,
            acknowledge_cancel: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            state: Mutex::new(SimState {
                callback: None,
                device_id: 0,
                templates: HashMap::new(),
                active_group: 0,
                authenticator_id: 0,
                calls: Vec::new(),
            }),
        }
    }

    /// Driver that answers every request on its own
    pub fn automatic() -> Self {
        Self::with_mode(true)
    }

    /// Driver that records requests and waits for [`emit`](Self::emit)
    pub fn manual() -> Self {
        Self::with_mode(false)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attach(&self, callback: DriverCallback, device_id: DeviceId) {
        let mut state = self.lock();
        state.callback = Some(callback);
        state.device_id = device_id;
    }

    /// Whether a cancel is acknowledged with `ErrorCode::Canceled`
    pub fn set_acknowledge_cancel(&self, acknowledge: bool) {
        self.acknowledge_cancel.store(acknowledge, Ordering::SeqCst);
    }

    /// Make every operation request return a nonzero status
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Store a template in hardware without a matching record
    pub fn insert_template(&self, group_id: GroupId, template_id: TemplateId) {
        self.lock()
            .templates
            .entry(group_id)
            .or_default()
            .push(template_id);
    }

    /// Templates stored for a group
    pub fn templates(&self, group_id: GroupId) -> Vec<TemplateId> {
        self.lock()
            .templates
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Requests received so far
    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Device id of the attached connection
    pub fn device_id(&self) -> DeviceId {
        self.lock().device_id
    }

    /// Deliver an event as if the hardware sent it
    pub fn emit(&self, event: DriverEvent) {
        let callback = self.lock().callback.clone();
        if let Some(callback) = callback {
            callback.post(event);
        }
    }

    /// Report loss of the connection
    pub fn die(&self) {
        self.emit(DriverEvent::Died);
    }

    fn record(&self, call: DriverCall) -> (MutexGuard<'_, SimState>, i32) {
        let mut state = self.lock();
        debug!("Simulated driver: {:?}", call);
        state.calls.push(call);
        let status = if self.failing.load(Ordering::SeqCst) { -1 } else { 0 };
        (state, status)
    }

    fn post(state: &SimState, event: DriverEvent) {
        if let Some(callback) = &state.callback {
            callback.post(event);
        }
    }

    fn acquired_good(state: &SimState) {
        Self::post(
            state,
            DriverEvent::Acquired {
                device_id: state.device_id,
                info: AcquiredInfo::Good,
                vendor_code: 0,
            },
        );
    }
}

impl IrisDriver for SimulatedDriver {
    fn pre_enroll(&self) -> u64 {
        let _ = self.record(DriverCall::PreEnroll);
        rand::thread_rng().gen_range(1..u64::MAX)
    }

    fn post_enroll(&self) -> i32 {
        self.record(DriverCall::PostEnroll).1
    }

    fn enroll(&self, _challenge: &[u8], group_id: GroupId, timeout_secs: u32) -> i32 {
        let (mut state, status) = self.record(DriverCall::Enroll {
            group_id,
            timeout_secs,
        });
        if status != 0 || !self.auto_respond {
            return status;
        }

        let mut rng = rand::thread_rng();
        let template_id: TemplateId = rng.gen_range(1..i32::MAX);
        state.templates.entry(group_id).or_default().push(template_id);
        state.authenticator_id = rng.gen_range(1..u64::MAX);

        for remaining in (0..self.enroll_steps).rev() {
            Self::acquired_good(&state);
            Self::post(
                &state,
                DriverEvent::EnrollResult {
                    device_id: state.device_id,
                    template_id,
                    group_id,
                    remaining,
                },
            );
        }
        status
    }

    fn authenticate(&self, operation_id: u64, group_id: GroupId) -> i32 {
        let (state, status) = self.record(DriverCall::Authenticate {
            operation_id,
            group_id,
        });
        if status != 0 || !self.auto_respond {
            return status;
        }

        let matched = state
            .templates
            .get(&group_id)
            .and_then(|t| t.first().copied())
            .unwrap_or(0);
        let token = if matched != 0 {
            let mut bytes = vec![0u8; 32];
            rand::thread_rng().fill(&mut bytes[..]);
            Zeroizing::new(bytes)
        } else {
            Zeroizing::new(Vec::new())
        };

        Self::acquired_good(&state);
        Self::post(
            &state,
            DriverEvent::Authenticated {
                device_id: state.device_id,
                template_id: matched,
                group_id,
                token,
            },
        );
        status
    }

    fn remove(&self, group_id: GroupId, template_id: TemplateId) -> i32 {
        let (mut state, status) = self.record(DriverCall::Remove {
            group_id,
            template_id,
        });
        if status != 0 || !self.auto_respond {
            return status;
        }

        let device_id = state.device_id;
        let stored = state.templates.entry(group_id).or_default();
        let removed: Vec<TemplateId> = if template_id == 0 {
            std::mem::take(stored)
        } else if let Some(pos) = stored.iter().position(|&t| t == template_id) {
            vec![stored.remove(pos)]
        } else {
            Self::post(
                &state,
                DriverEvent::Error {
                    device_id,
                    error: ErrorCode::UnableToRemove,
                    vendor_code: 0,
                },
            );
            return status;
        };

        if !removed.is_empty() {
            state.authenticator_id = rand::thread_rng().gen_range(1..u64::MAX);
        }
        if removed.is_empty() {
            Self::post(
                &state,
                DriverEvent::Removed {
                    device_id,
                    template_id: 0,
                    group_id,
                    remaining: 0,
                },
            );
        }
        let total = removed.len() as u32;
        for (i, id) in removed.into_iter().enumerate() {
            Self::post(
                &state,
                DriverEvent::Removed {
                    device_id,
                    template_id: id,
                    group_id,
                    remaining: total - 1 - i as u32,
                },
            );
        }
        status
    }

    fn enumerate(&self) -> i32 {
        let (state, status) = self.record(DriverCall::Enumerate);
        if status != 0 || !self.auto_respond {
            return status;
        }

        let group_id = state.active_group;
        let stored = state.templates.get(&group_id).cloned().unwrap_or_default();
        if stored.is_empty() {
            Self::post(
                &state,
                DriverEvent::Enumerate {
                    device_id: state.device_id,
                    template_id: 0,
                    group_id,
                    remaining: 0,
                },
            );
        }
        let total = stored.len() as u32;
        for (i, id) in stored.into_iter().enumerate() {
            Self::post(
                &state,
                DriverEvent::Enumerate {
                    device_id: state.device_id,
                    template_id: id,
                    group_id,
                    remaining: total - 1 - i as u32,
                },
            );
        }
        status
    }

    fn cancel(&self) -> i32 {
        let (state, status) = self.record(DriverCall::Cancel);
        if self.acknowledge_cancel.load(Ordering::SeqCst) {
            Self::post(
                &state,
                DriverEvent::Error {
                    device_id: state.device_id,
                    error: ErrorCode::Canceled,
                    vendor_code: 0,
                },
            );
        }
        status
    }

    fn set_active_group(&self, group_id: GroupId, _storage_path: &Path) -> i32 {
        let (mut state, status) = self.record(DriverCall::SetActiveGroup { group_id });
        if status == 0 {
            state.active_group = group_id;
        }
        status
    }

    fn authenticator_id(&self) -> u64 {
        self.lock().authenticator_id
    }
}

/// Connector handing out a shared [`SimulatedDriver`]
pub struct SimulatedConnector {
    driver: Arc<SimulatedDriver>,
    available: AtomicBool,
    connects: AtomicUsize,
}

impl SimulatedConnector {
    pub fn new(driver: Arc<SimulatedDriver>) -> Self {
        Self {
            driver,
            available: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
        }
    }

    /// The driver behind this connector
    pub fn driver(&self) -> Arc<SimulatedDriver> {
        self.driver.clone()
    }

    /// Whether the next connection attempt succeeds
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Successful connections so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl DriverConnector for SimulatedConnector {
    fn connect(&self, callback: DriverCallback) -> Option<(Arc<dyn IrisDriver>, DeviceId)> {
        if !self.available.load(Ordering::SeqCst) {
            return None;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.driver.attach(callback, SIMULATED_DEVICE_ID);
        Some((self.driver.clone() as Arc<dyn IrisDriver>, SIMULATED_DEVICE_ID))
    }
}
