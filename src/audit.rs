use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::notify::Notification;

/// Write one structured record per notification until the hub goes away.
/// Returns the number of notifications recorded.
pub async fn run_audit_sink(mut rx: broadcast::Receiver<Notification>) -> u64 {
    let mut recorded = 0u64;
    loop {
        match rx.recv().await {
            Ok(n) => {
                info!(
                    target: "lessonslot::audit",
                    kind = n.kind.as_str(),
                    appointment_id = %n.appointment_id,
                    teacher_id = %n.teacher_id,
                    student_id = %n.student_id,
                    slot = n.slot,
                    status = n.status.as_str(),
                    "appointment event"
                );
                recorded += 1;
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(target: "lessonslot::audit", missed, "audit sink lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    recorded
}
