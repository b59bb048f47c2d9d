use std::{sync::Arc, time::Duration};

use anyhow::{Context, Error, Result, anyhow};
use metrics_exporter_prometheus::PrometheusBuilder;
use outbox_dispatcher::{
    api::{AppState, run_api_server},
    cache::CoordinationCache,
    clients::{
        adapter::AdapterRegistry, circuit_breaker::CircuitBreaker, database::DatabaseClient,
        health::HealthChecker, redis::RedisCache, webhook::WebhookAdapter,
    },
    clock::{Clock, SystemClock},
    config::{Config, LogFormat},
    dispatcher::Dispatcher,
    egress::EgressFilter,
    metrics::DeliveryMetrics,
    models::retry::RetryConfig,
    signing::ReplayGuard,
    store::EventStore,
    utils::retry_with_backoff,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(&config.log_format)?;

    let worker_id = config.worker_id();
    info!(
        worker_id = %worker_id,
        poll_interval_seconds = config.poll_interval_seconds,
        max_delivery_attempts = config.max_delivery_attempts,
        signing_enabled = config.webhook_signing_secret.is_some(),
        "Configuration loaded"
    );

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow!("Failed to install Prometheus recorder: {}", e))?;
    DeliveryMetrics::describe();

    let retry_config = RetryConfig::from_config(&config);

    let database = Arc::new(
        retry_with_backoff(&retry_config, || DatabaseClient::connect(&config.database_url))
            .await
            .context("Database unavailable at startup")?,
    );
    database.ensure_schema().await?;

    let cache: Arc<dyn CoordinationCache> = Arc::new(
        retry_with_backoff(&retry_config, || RedisCache::connect(&config.redis_url))
            .await
            .context("Redis unavailable at startup")?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let allowed_hosts = config.allowed_hosts();
    if allowed_hosts.is_empty() {
        warn!("EGRESS_ALLOWED_HOSTS is empty; every webhook destination will be rejected");
    }
    if config.egress_allow_private {
        warn!("EGRESS_ALLOW_PRIVATE is set; private and loopback destinations are reachable");
    }

    let egress = EgressFilter::new(&allowed_hosts, &config.denied_cidrs())?
        .allow_private(config.egress_allow_private);

    let webhook = WebhookAdapter::new(
        Arc::new(egress),
        config.signing_secrets()?,
        Arc::clone(&clock),
        Duration::from_secs(config.delivery_timeout_seconds),
    )
    .with_replay_guard(ReplayGuard::new(
        Arc::clone(&cache),
        config.signature_max_skew(),
    ));

    let breaker = CircuitBreaker::new(
        Arc::clone(&cache),
        Arc::clone(&clock),
        config.circuit_breaker_config(),
        worker_id.clone(),
    );

    let store: Arc<dyn EventStore> = Arc::clone(&database) as Arc<dyn EventStore>;
    let dispatcher = Dispatcher::new(
        store,
        breaker,
        AdapterRegistry::standard(webhook),
        clock,
        config.dispatcher_config()?,
        worker_id.clone(),
    );

    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(database, cache, worker_id),
        metrics: prometheus,
    });

    let port = config.server_port;
    tokio::spawn(async move {
        if let Err(e) = run_api_server(state, port).await {
            error!(error = %e, "API server failed");
        }
    });

    tokio::select! {
        _ = dispatcher.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received, stopping dispatcher");
        }
    }

    Ok(())
}

fn init_tracing(format: &LogFormat) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow!("Invalid RUST_LOG: {}", e))?;

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    }
    .map_err(|e| anyhow!("Failed to initialize tracing: {}", e))
}
