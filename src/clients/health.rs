use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    cache::CoordinationCache,
    clients::database::DatabaseClient,
    models::health::{ComponentHealth, HealthCheckResponse, HealthStatus},
};

pub struct HealthChecker {
    database: Arc<DatabaseClient>,
    cache: Arc<dyn CoordinationCache>,
    worker_id: String,
}

impl HealthChecker {
    pub fn new(
        database: Arc<DatabaseClient>,
        cache: Arc<dyn CoordinationCache>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            database,
            cache,
            worker_id: worker_id.into(),
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("database".to_string(), self.check_database().await);
        checks.insert("cache".to_string(), self.check_cache().await);

        let status = if checks
            .values()
            .any(|health| health.status == HealthStatus::Unhealthy)
        {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };

        HealthCheckResponse {
            status,
            worker_id: self.worker_id.clone(),
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_database(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.database.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ComponentHealth::unhealthy(e.to_string())
            }
        }
    }

    async fn check_cache(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.cache.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Cache health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Cache health check failed");
                ComponentHealth::unhealthy(e.to_string())
            }
        }
    }
}
