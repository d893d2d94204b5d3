use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

// ── RED metrics (operation-driven) ──────────────────────────────

/// Counter: appointment creation attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "lessonslot_bookings_total";

/// Counter: promotion calls. Labels: outcome (promoted, empty, past, occupied,
/// subject_mismatch, blocked, lost_race, exhausted).
pub const PROMOTIONS_TOTAL: &str = "lessonslot_promotions_total";

/// Histogram: loop iterations used by one promotion call.
pub const PROMOTION_ATTEMPTS: &str = "lessonslot_promotion_attempts";

/// Counter: pending appointments expired by the sweeper.
pub const APPOINTMENTS_EXPIRED_TOTAL: &str = "lessonslot_appointments_expired_total";

/// Counter: waitlist entries dropped because their slot has passed.
pub const WAITLIST_PRUNED_TOTAL: &str = "lessonslot_waitlist_pruned_total";

/// Histogram: slot generation latency in seconds.
pub const SLOT_GENERATION_SECONDS: &str = "lessonslot_slot_generation_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "lessonslot_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lessonslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lessonslot_wal_flush_batch_size";

/// Install the global tracing subscriber. Later calls are no-ops.
///
/// `RUST_LOG` wins over the configured filter when it is set.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn install_prometheus(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
