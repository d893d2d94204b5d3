use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::config::Config;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::{audit, reaper};

/// Per-tenant engines. Each tenant gets its own Engine, WAL, expiry sweeper,
/// compactor and audit sink.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    expiry_sweep: Duration,
    max_promotion_attempts: u32,
}

impl TenantManager {
    pub fn new(config: &Config) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir: config.data_dir.clone(),
            compact_threshold: config.compact_threshold,
            expiry_sweep: Duration::from_secs(config.expiry_sweep_secs),
            max_promotion_attempts: config.max_promotion_attempts,
        }
    }

    /// Get or lazily create the engine for a tenant, replaying its WAL.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // the name becomes a file name under data_dir
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        std::fs::create_dir_all(&self.data_dir)?;
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(
            Engine::new(wal_path, notify)?.with_max_promotion_attempts(self.max_promotion_attempts),
        );

        tokio::spawn(reaper::run_expiry_sweeper(engine.clone(), self.expiry_sweep));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));
        tokio::spawn(audit::run_audit_sink(engine.notify.subscribe_all()));

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant = %safe_name, "tenant loaded");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}
