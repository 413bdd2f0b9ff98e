//! Enrollment records
//!
//! A record is the software-side twin of a template stored in hardware.
//! Records are owned by a single user's record store and identified by the
//! template id the hardware reported when enrollment finished.

use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, GroupId, TemplateId};

/// Prefix used when naming new records
pub const DEFAULT_NAME_PREFIX: &str = "Iris";

/// One enrolled template as known to software
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    /// Hardware template id, unique within a user's store
    pub id: TemplateId,

    /// User-visible name
    pub name: String,

    /// Group the template was enrolled under
    pub group_id: GroupId,

    /// Device the template lives on (0 when unknown)
    pub device_id: DeviceId,
}

impl EnrollmentRecord {
    /// Create a new record
    pub fn new(id: TemplateId, name: impl Into<String>, group_id: GroupId, device_id: DeviceId) -> Self {
        Self {
            id,
            name: name.into(),
            group_id,
            device_id,
        }
    }

    /// Record with no name, as reported back to restricted callers or by enumeration
    pub fn anonymous(id: TemplateId, group_id: GroupId, device_id: DeviceId) -> Self {
        Self::new(id, "", group_id, device_id)
    }
}

/// Pick the first "Iris N" name not used by any of `records`
pub fn unique_name(records: &[EnrollmentRecord]) -> String {
    let mut guess = 1u32;
    loop {
        let name = format!("{} {}", DEFAULT_NAME_PREFIX, guess);
        if !records.iter().any(|r| r.name == name) {
            return name;
        }
        guess += 1;
    }
}
