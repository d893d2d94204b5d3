use std::fmt;

use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Appointment, AppointmentStatus, Ms};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Booked,
    Approved,
    Rejected,
    Cancelled,
    Expired,
    Completed,
    NoShow,
    WaitlistPromoted,
}

impl NotificationKind {
    /// Kind for an appointment that just reached `status` through a lifecycle transition.
    pub fn for_transition(status: AppointmentStatus) -> Self {
        match status {
            AppointmentStatus::Pending => NotificationKind::Booked,
            AppointmentStatus::Approved => NotificationKind::Approved,
            AppointmentStatus::Rejected => NotificationKind::Rejected,
            AppointmentStatus::Cancelled => NotificationKind::Cancelled,
            AppointmentStatus::Completed => NotificationKind::Completed,
            AppointmentStatus::NoShow => NotificationKind::NoShow,
            AppointmentStatus::Expired => NotificationKind::Expired,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Booked => "booked",
            NotificationKind::Approved => "approved",
            NotificationKind::Rejected => "rejected",
            NotificationKind::Cancelled => "cancelled",
            NotificationKind::Expired => "expired",
            NotificationKind::Completed => "completed",
            NotificationKind::NoShow => "no_show",
            NotificationKind::WaitlistPromoted => "waitlist_promoted",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-commit message about one appointment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub appointment_id: Ulid,
    pub teacher_id: Ulid,
    pub student_id: Ulid,
    pub slot: Ms,
    pub status: AppointmentStatus,
}

impl Notification {
    pub fn new(kind: NotificationKind, appointment: &Appointment) -> Self {
        Self {
            kind,
            appointment_id: appointment.id,
            teacher_id: appointment.teacher_id,
            student_id: appointment.student_id,
            slot: appointment.start,
            status: appointment.status,
        }
    }
}

/// Broadcast hub: one channel per teacher plus a firehose for every notification.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to notifications for one teacher. Creates the channel if needed.
    pub fn subscribe(&self, teacher_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(teacher_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notification: Notification) {
        if let Some(sender) = self.channels.get(&notification.teacher_id) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.all.send(notification);
    }
}
