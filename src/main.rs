//! KKT Adapter: edge fiscal gateway.
//!
//! Phase 1 keeps the cashier selling: validate, stamp, persist, print.
//! Phase 2 keeps the regulator fed: drain the buffer to the OFD through the
//! circuit breaker, exactly once per receipt, whenever the network allows.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kkt_adapter::api::{self, AppState};
use kkt_adapter::breaker::CircuitBreaker;
use kkt_adapter::buffer::BufferDb;
use kkt_adapter::config::{self, AdapterConfig};
use kkt_adapter::fiscal::FiscalizationService;
use kkt_adapter::heartbeat::{spawn_gauge_refresher, HeartbeatEmitter};
use kkt_adapter::hlc::HybridLogicalClock;
use kkt_adapter::kkt::{HttpKktDriver, KktDriver, NullKktDriver};
use kkt_adapter::lock::{HttpLeaseLock, InProcessLease, SyncLock};
use kkt_adapter::metrics::AdapterMetrics;
use kkt_adapter::models::now_secs;
use kkt_adapter::ofd::{OfdClient, OfdDelivery};
use kkt_adapter::sync::SyncWorker;

const SYNC_LOCK_KEY: &str = "kkt-adapter:sync";

#[tokio::main]
async fn main() -> Result<()> {
    config::load_env();
    init_tracing();

    let cfg = AdapterConfig::from_env();
    info!(
        pos_id = %cfg.pos_id,
        db_path = %cfg.db_path,
        buffer_capacity = cfg.buffer.capacity,
        "KKT Adapter starting"
    );

    let metrics = Arc::new(AdapterMetrics::new());
    let hlc = Arc::new(HybridLogicalClock::new());
    let buffer = Arc::new(
        BufferDb::open(&cfg.db_path, cfg.buffer.capacity).context("Failed to open buffer")?,
    );
    let breaker = Arc::new(CircuitBreaker::new(cfg.breaker.clone(), metrics.clone()));

    let kkt: Arc<dyn KktDriver> = match &cfg.kkt.driver_url {
        Some(url) => {
            info!(url, "KKT driver attached");
            Arc::new(HttpKktDriver::new(url, cfg.kkt.timeout)?)
        }
        None => {
            warn!("KKT_DRIVER_URL not set, receipts will be buffered without paper");
            Arc::new(NullKktDriver)
        }
    };

    let delivery = match &cfg.ofd.base_url {
        Some(url) => {
            info!(url, "OFD delivery enabled");
            let client = Arc::new(OfdClient::new(url, cfg.ofd.timeout)?);
            Some(Arc::new(OfdDelivery::new(
                client,
                breaker.clone(),
                buffer.clone(),
                hlc.clone(),
                metrics.clone(),
                cfg.sync.max_retries,
            )))
        }
        None => {
            warn!("OFD_BASE_URL not set, receipts will accumulate as pending");
            None
        }
    };

    let fiscal = Arc::new(FiscalizationService::new(
        buffer.clone(),
        hlc.clone(),
        kkt,
        delivery.clone(),
        metrics.clone(),
        cfg.buffer.alert_percent,
        cfg.buffer.block_percent,
    ));

    // Sync worker only runs with an OFD to deliver to.
    let sync_handle = match delivery {
        Some(delivery) => {
            let lock: Arc<dyn SyncLock> = match &cfg.sync.lock_url {
                Some(url) => {
                    info!(url, "Cluster sync lock via lease store");
                    Arc::new(HttpLeaseLock::new(url, SYNC_LOCK_KEY, cfg.sync.lock_ttl)?)
                }
                None => Arc::new(InProcessLease::new(cfg.sync.lock_ttl)),
            };
            let (worker, handle) = SyncWorker::new(
                buffer.clone(),
                delivery,
                lock,
                metrics.clone(),
                cfg.sync.clone(),
                cfg.stale_claim_age().as_secs() as i64,
            );
            worker.spawn();
            Some(handle)
        }
        None => None,
    };

    // Heartbeat to the ERP, or just keep the local gauges warm.
    match &cfg.heartbeat.url {
        Some(url) => {
            let emitter = HeartbeatEmitter::new(
                url,
                &cfg.pos_id,
                cfg.heartbeat.clone(),
                buffer.clone(),
                breaker.clone(),
                hlc.clone(),
                metrics.clone(),
            )?;
            emitter.spawn();
            info!(url, "Heartbeat emitter started");
        }
        None => {
            spawn_gauge_refresher(
                buffer.clone(),
                hlc.clone(),
                metrics.clone(),
                cfg.heartbeat.interval,
            );
        }
    }

    spawn_archival(buffer.clone(), cfg.clone());

    let state = AppState {
        fiscal,
        buffer,
        breaker,
        hlc,
        metrics,
        sync_handle,
        started_at: now_secs(),
    };
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("KKT Adapter stopped");
    Ok(())
}

/// Periodically archive synced receipts past retention and prune the event
/// log on the same schedule. Never touches a receipt that has not synced;
/// the refund rule relies on that.
fn spawn_archival(buffer: Arc<BufferDb>, cfg: AdapterConfig) {
    tokio::spawn(async move {
        let retention_secs = cfg.buffer.archive_retention_days.max(1) * 86_400;
        let mut ticker = interval(cfg.buffer.archive_poll_interval);
        loop {
            ticker.tick().await;
            let cutoff = now_secs() - retention_secs;

            match buffer.archive_synced_before(cutoff) {
                Ok(0) => {}
                Ok(n) => info!(
                    archived = n,
                    retention_days = cfg.buffer.archive_retention_days,
                    "Archived synced receipts"
                ),
                Err(e) => warn!(error = %e, "Receipt archival failed"),
            }
            if let Err(e) = buffer.prune_events_before(cutoff) {
                warn!(error = %e, "Event log pruning failed");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested, draining in-flight requests");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kkt_adapter=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
