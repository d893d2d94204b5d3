//! In-process booking engine for student/teacher lessons.
//!
//! Each tenant owns an [`Engine`]: per-teacher state behind async locks,
//! made durable by a group-commit write-ahead log. Slots are recomputed on
//! demand from weekly availability, blocked intervals and existing bookings.

pub mod audit;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod tenant;
pub mod wal;

pub use config::Config;
pub use engine::{BookingRequest, Engine, EngineError, OnConflict, RejectReason, RuleProposal};
pub use model::*;
pub use notify::{Notification, NotificationKind, NotifyHub};
pub use tenant::TenantManager;
