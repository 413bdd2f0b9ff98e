//! Iris Daemon - single-session scheduler for iris biometrics
//!
//! This crate provides:
//! - Serialized enroll, authenticate, remove and enumerate sessions
//! - Cancel-then-start preemption with a cancel watchdog
//! - Failed-attempt lockout with timed reset
//! - Per-user enrollment records with write-behind persistence
//! - Reconciliation of records against hardware templates

pub mod config;
pub mod driver;
pub mod error;
pub mod lockout;
pub mod platform;
pub mod receiver;
pub mod reconciliation;
pub mod record_store;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod stats;
pub mod timer;
pub mod users;

pub use config::IrisConfig;
pub use driver::{DriverConnector, DriverEvent, IrisDriver};
pub use error::{DaemonError, Result};
pub use lockout::LockoutStatus;
pub use platform::Platform;
pub use receiver::{ChannelReceiver, SessionEvent, SessionReceiver};
pub use reconciliation::{generate_report, ReconciliationReport};
pub use service::IrisService;
pub use session::ClientBinding;
pub use users::{StaticUserDirectory, UserDirectory};
