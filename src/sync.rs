//! Background sync worker.
//!
//! One logical worker drains pending receipts to the OFD on a fixed
//! interval, or immediately on a forced-sync trigger. The cluster lease
//! makes it a singleton across processes; the claim makes each receipt's
//! fate owned by exactly one cycle. A crash mid-cycle strands at most one
//! batch in `syncing`, which startup recovery reverts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::buffer::BufferDb;
use crate::config::SyncConfig;
use crate::error::AdapterError;
use crate::metrics::AdapterMetrics;
use crate::models::{now_secs, BufferEventKind};
use crate::ofd::{DeliveryResult, OfdDelivery};
use crate::lock::SyncLock;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub claimed: usize,
    pub synced: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Claims released because the breaker opened mid-batch.
    pub released: usize,
    pub lock_denied: bool,
}

/// Shared handle for the forced-sync endpoint.
#[derive(Clone)]
pub struct SyncHandle {
    trigger: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl SyncHandle {
    /// Request an immediate cycle. Refused while one is already running.
    pub fn request_sync(&self) -> Result<(), AdapterError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AdapterError::LockContention);
        }
        self.trigger.notify_one();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct SyncWorker {
    buffer: Arc<BufferDb>,
    delivery: Arc<OfdDelivery>,
    lock: Arc<dyn SyncLock>,
    metrics: Arc<AdapterMetrics>,
    cfg: SyncConfig,
    stale_claim_age_secs: i64,
    trigger: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl SyncWorker {
    pub fn new(
        buffer: Arc<BufferDb>,
        delivery: Arc<OfdDelivery>,
        lock: Arc<dyn SyncLock>,
        metrics: Arc<AdapterMetrics>,
        cfg: SyncConfig,
        stale_claim_age_secs: i64,
    ) -> (Self, SyncHandle) {
        let trigger = Arc::new(Notify::new());
        let running = Arc::new(AtomicBool::new(false));
        let handle = SyncHandle {
            trigger: trigger.clone(),
            running: running.clone(),
        };
        (
            SyncWorker {
                buffer,
                delivery,
                lock,
                metrics,
                cfg,
                stale_claim_age_secs,
                trigger,
                running,
            },
            handle,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Crash recovery before the first cycle: anything claimed longer
            // ago than 5x the interval was abandoned by a dead worker.
            match self
                .buffer
                .revert_stale_syncing(now_secs() - self.stale_claim_age_secs)
            {
                Ok(0) => {}
                Ok(n) => info!(reverted = n, "Recovered receipts stranded in syncing"),
                Err(e) => warn!(error = %e, "Stale claim recovery failed"),
            }

            let mut ticker = interval(self.cfg.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.trigger.notified() => {
                        debug!("Forced sync requested");
                    }
                }

                self.running.store(true, Ordering::SeqCst);
                let report = self.run_cycle().await;
                self.running.store(false, Ordering::SeqCst);

                match report {
                    Ok(r) if r.lock_denied => {
                        debug!("Sync lock held elsewhere, cycle skipped");
                    }
                    Ok(r) if r.claimed > 0 => {
                        info!(
                            claimed = r.claimed,
                            synced = r.synced,
                            requeued = r.requeued,
                            dead_lettered = r.dead_lettered,
                            released = r.released,
                            "Sync cycle finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Sync cycle failed"),
                }
            }
        })
    }

    /// One full drain attempt. Public for tests and for the startup drain.
    pub async fn run_cycle(&self) -> anyhow::Result<SyncReport> {
        let mut report = SyncReport::default();

        let Some(lease) = self.lock.acquire().await? else {
            report.lock_denied = true;
            return Ok(report);
        };

        // Hold the lease for the whole cycle; release on every exit path.
        let result = self.drain_under_lock(&mut report).await;
        self.lock.release(lease).await?;
        result?;

        AdapterMetrics::inc(&self.metrics.sync_cycles_total);
        Ok(report)
    }

    async fn drain_under_lock(&self, report: &mut SyncReport) -> anyhow::Result<()> {
        if self.delivery.breaker().state() == crate::breaker::BreakerState::Open {
            debug!("Breaker OPEN, sync cycle skipped");
            return Ok(());
        }

        let claimed = self.buffer.claim_pending(self.cfg.batch_size)?;
        report.claimed = claimed.len();
        if claimed.is_empty() {
            return Ok(());
        }

        self.buffer.append_event(
            BufferEventKind::SyncStarted,
            None,
            Some(serde_json::json!({ "claimed": claimed.len() })),
        )?;

        let mut abandoned: Vec<String> = Vec::new();
        for (idx, receipt) in claimed.iter().enumerate() {
            match self.delivery.deliver_claimed(receipt).await? {
                DeliveryResult::Synced { .. } => report.synced += 1,
                DeliveryResult::Requeued => report.requeued += 1,
                DeliveryResult::DeadLettered => report.dead_lettered += 1,
                DeliveryResult::CircuitOpen => {
                    // The failed receipt's claim was already released; give
                    // back the rest of the batch untouched.
                    report.released += 1;
                    abandoned = claimed[idx + 1..]
                        .iter()
                        .map(|r| r.id.clone())
                        .collect();
                    break;
                }
                DeliveryResult::NotClaimable => {}
            }
        }

        for id in &abandoned {
            self.buffer.release_claim(id)?;
            report.released += 1;
        }

        self.buffer.append_event(
            BufferEventKind::SyncCompleted,
            None,
            Some(serde_json::json!({
                "claimed": report.claimed,
                "synced": report.synced,
                "requeued": report.requeued,
                "dead_lettered": report.dead_lettered,
                "released": report.released,
            })),
        )?;

        Ok(())
    }
}
