//! Reconciliation of enrollment records against hardware templates
//!
//! A pass enumerates each queued user's templates, drops records the
//! hardware no longer has and removes templates no record refers to. The
//! workflow only plans steps; the scheduler runs each one as an internal
//! session so reconciliation never overlaps a client operation.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

use iris_core::{EnrollmentRecord, TemplateId, UserId};

/// Next internal session to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationStep {
    /// Enumerate a user's templates against its records
    Enumerate { user_id: UserId },
    /// Remove a template that has no record
    Remove {
        user_id: UserId,
        template: EnrollmentRecord,
    },
}

/// Mismatch found during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Discrepancy {
    /// Record without a hardware template; deleted from the store
    DanglingRecord {
        user_id: UserId,
        template_id: TemplateId,
    },
    /// Hardware template without a record; removed from hardware
    OrphanTemplate {
        user_id: UserId,
        template_id: TemplateId,
    },
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// Users enumerated, in order
    pub users: Vec<UserId>,

    /// Mismatches found and repaired
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    /// Whether records and hardware already agreed
    pub fn passed(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

/// Queue of users awaiting reconciliation plus orphans awaiting removal
#[derive(Debug, Default)]
pub struct ReconciliationWorkflow {
    pending_users: VecDeque<UserId>,
    orphans: VecDeque<(UserId, EnrollmentRecord)>,
    report: Option<ReconciliationReport>,
    last_report: Option<ReconciliationReport>,
}

impl ReconciliationWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a user; a user already waiting is not queued twice
    pub fn begin(&mut self, user_id: UserId) {
        if !self.pending_users.contains(&user_id) {
            self.pending_users.push_back(user_id);
        }
        self.report.get_or_insert_with(ReconciliationReport::default);
    }

    /// Whether a pass has work queued or in flight
    pub fn in_progress(&self) -> bool {
        self.report.is_some()
    }

    /// Plan the next session; `None` ends the pass
    pub fn next_step(&mut self) -> Option<ReconciliationStep> {
        if let Some((user_id, template)) = self.orphans.pop_front() {
            return Some(ReconciliationStep::Remove { user_id, template });
        }
        if let Some(user_id) = self.pending_users.pop_front() {
            if let Some(report) = self.report.as_mut() {
                report.users.push(user_id);
            }
            return Some(ReconciliationStep::Enumerate { user_id });
        }
        if let Some(report) = self.report.take() {
            info!(
                "Reconciliation complete: {} users, {} discrepancies",
                report.users.len(),
                report.discrepancies.len()
            );
            self.last_report = Some(report);
        }
        None
    }

    /// Record the outcome of a user's enumeration and queue its orphans
    pub fn on_enumerated(
        &mut self,
        user_id: UserId,
        dangling: Vec<EnrollmentRecord>,
        orphans: Vec<EnrollmentRecord>,
    ) {
        let report = self.report.get_or_insert_with(ReconciliationReport::default);
        for record in &dangling {
            report.discrepancies.push(Discrepancy::DanglingRecord {
                user_id,
                template_id: record.id,
            });
        }
        for template in orphans {
            report.discrepancies.push(Discrepancy::OrphanTemplate {
                user_id,
                template_id: template.id,
            });
            self.orphans.push_back((user_id, template));
        }
    }

    /// Abandon the pass after a failed internal session
    pub fn reset(&mut self) {
        if self.report.take().is_some() {
            warn!(
                "Abandoning reconciliation ({} users, {} orphans outstanding)",
                self.pending_users.len(),
                self.orphans.len()
            );
        }
        self.pending_users.clear();
        self.orphans.clear();
    }

    /// Report of the last completed pass
    pub fn last_report(&self) -> Option<&ReconciliationReport> {
        self.last_report.as_ref()
    }
}

/// Generate a human-readable reconciliation report
pub fn generate_report(report: &ReconciliationReport) -> String {
    let mut out = String::new();

    out.push_str("=== Reconciliation Report ===\n\n");
    out.push_str(&format!("Users checked: {:?}\n", report.users));

    if report.passed() {
        out.push_str("\n✓ Records match hardware\n");
    } else {
        out.push_str(&format!(
            "\n✗ {} discrepancies repaired:\n",
            report.discrepancies.len()
        ));
        for (i, discrepancy) in report.discrepancies.iter().enumerate() {
            out.push_str(&format!("  {}. {:?}\n", i + 1, discrepancy));
        }
    }

    out
}
