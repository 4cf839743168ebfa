//! End-to-end flow over the composed services: submit while the OFD is
//! down, survive a restart, drain once it recovers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

use kkt_adapter::breaker::{BreakerState, CircuitBreaker};
use kkt_adapter::buffer::BufferDb;
use kkt_adapter::config::{BreakerConfig, SyncConfig};
use kkt_adapter::fiscal::{FiscalizationService, SubmitRequest};
use kkt_adapter::hlc::HybridLogicalClock;
use kkt_adapter::kkt::{KktDriver, PrintOutcome};
use kkt_adapter::lock::InProcessLease;
use kkt_adapter::metrics::AdapterMetrics;
use kkt_adapter::models::{Receipt, ReceiptStatus, ReceiptType};
use kkt_adapter::ofd::{OfdAck, OfdApi, OfdDelivery, OfdOutcome};
use kkt_adapter::sync::SyncWorker;

/// OFD double with a switchable up/down state; assigns ascending server
/// times and records every call.
struct SwitchableOfd {
    up: Mutex<bool>,
    next_server_time: Mutex<i64>,
    calls: Mutex<Vec<String>>,
}

impl SwitchableOfd {
    fn new(up: bool) -> Arc<Self> {
        Arc::new(SwitchableOfd {
            up: Mutex::new(up),
            next_server_time: Mutex::new(10_000),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn set_up(&self, up: bool) {
        *self.up.lock() = up;
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl OfdApi for SwitchableOfd {
    async fn submit_receipt(&self, receipt: &Receipt) -> OfdOutcome {
        self.calls.lock().push(receipt.id.clone());
        if !*self.up.lock() {
            return OfdOutcome::Transient("connection refused".into());
        }
        let mut t = self.next_server_time.lock();
        *t += 1;
        OfdOutcome::Accepted(OfdAck {
            server_time: *t,
            ack_id: format!("ack-{}", *t),
        })
    }
}

struct SilentPrinter;

#[async_trait]
impl KktDriver for SilentPrinter {
    async fn print(&self, _payload: &serde_json::Value) -> PrintOutcome {
        PrintOutcome::Printed
    }
}

struct Stack {
    fiscal: Arc<FiscalizationService>,
    worker: SyncWorker,
    buffer: Arc<BufferDb>,
    ofd: Arc<SwitchableOfd>,
    breaker: Arc<CircuitBreaker>,
}

fn build_stack(db_path: &str, ofd: Arc<SwitchableOfd>, inline_phase2: bool) -> Stack {
    let buffer = Arc::new(BufferDb::open(db_path, 200).unwrap());
    let metrics = Arc::new(AdapterMetrics::new());
    let hlc = Arc::new(HybridLogicalClock::new());
    let breaker = Arc::new(CircuitBreaker::new(
        BreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(50),
            success_threshold: 2,
        },
        metrics.clone(),
    ));
    let delivery = Arc::new(OfdDelivery::new(
        ofd.clone(),
        breaker.clone(),
        buffer.clone(),
        hlc.clone(),
        metrics.clone(),
        20,
    ));
    let fiscal = Arc::new(FiscalizationService::new(
        buffer.clone(),
        hlc.clone(),
        Arc::new(SilentPrinter),
        inline_phase2.then(|| delivery.clone()),
        metrics.clone(),
        80,
        100,
    ));
    let (worker, _handle) = SyncWorker::new(
        buffer.clone(),
        delivery,
        Arc::new(InProcessLease::new(Duration::from_secs(300))),
        metrics,
        SyncConfig {
            interval: Duration::from_secs(60),
            batch_size: 50,
            max_retries: 20,
            lock_ttl: Duration::from_secs(300),
            lock_url: None,
        },
        300,
    );
    Stack {
        fiscal,
        worker,
        buffer,
        ofd,
        breaker,
    }
}

fn sale(key: &str, total: i64) -> SubmitRequest {
    SubmitRequest {
        pos_id: "POS-001".into(),
        receipt_type: ReceiptType::Sale,
        original_id: None,
        payload: json!({ "total": total }),
        idempotency_key: key.into(),
    }
}

#[tokio::test]
async fn test_offline_burst_then_recovery() {
    // Sales continue while the OFD is dark, the breaker opens,
    // and recovery drains everything in submission order.
    let temp = NamedTempFile::new().unwrap();
    let ofd = SwitchableOfd::new(false);
    let stack = build_stack(temp.path().to_str().unwrap(), ofd.clone(), false);

    let mut ids = Vec::new();
    for i in 0..50 {
        let out = stack.fiscal.submit(sale(&format!("k-{i}"), i)).await.unwrap();
        ids.push(out.id);
    }

    let status = stack.buffer.status().unwrap();
    assert_eq!(status.pending, 50);
    assert!((status.fullness - 0.25).abs() < 1e-9, "50/200 = 25% full");

    // First cycle: five transient failures open the breaker; no further
    // network calls happen while it stays open.
    stack.worker.run_cycle().await.unwrap();
    assert_eq!(stack.breaker.state(), BreakerState::Open);
    let calls_when_opened = stack.ofd.call_count();
    assert_eq!(calls_when_opened, 5);

    stack.worker.run_cycle().await.unwrap();
    assert_eq!(stack.ofd.call_count(), calls_when_opened);

    // OFD comes back; wait out recovery_timeout and the retry backoff.
    stack.ofd.set_up(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        stack.worker.run_cycle().await.unwrap();
        let status = stack.buffer.status().unwrap();
        if status.pending == 0 && status.syncing == 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "buffer did not drain in bounded time"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Everything synced, DLQ untouched, server order matches HLC order.
    let status = stack.buffer.status().unwrap();
    assert_eq!(status.synced, 50);
    assert_eq!(status.dlq_size, 0);

    let mut server_times = Vec::new();
    for id in &ids {
        let r = stack.buffer.get(id).unwrap().unwrap();
        assert_eq!(r.status, ReceiptStatus::Synced);
        server_times.push(r.hlc_server.unwrap());
    }
    let mut sorted = server_times.clone();
    sorted.sort();
    assert_eq!(server_times, sorted, "submission order preserved");
}

#[tokio::test]
async fn test_crash_between_phases_recovers() {
    // The process dies right after the durable insert; the receipt
    // is picked up by the next worker generation.
    let temp = NamedTempFile::new().unwrap();
    let path = temp.path().to_str().unwrap().to_string();

    let submitted_id = {
        let ofd = SwitchableOfd::new(false);
        let stack = build_stack(&path, ofd, false);
        let out = stack.fiscal.submit(sale("k-crash", 99)).await.unwrap();
        out.id
        // Stack dropped here: the "crash".
    };

    let ofd = SwitchableOfd::new(true);
    let stack = build_stack(&path, ofd, false);

    let recovered = stack.buffer.get(&submitted_id).unwrap().unwrap();
    assert_eq!(recovered.status, ReceiptStatus::Pending);

    stack.worker.run_cycle().await.unwrap();
    let recovered = stack.buffer.get(&submitted_id).unwrap().unwrap();
    assert_eq!(recovered.status, ReceiptStatus::Synced);
}

#[tokio::test]
async fn test_crash_mid_claim_reverts_and_redelivers_once() {
    // A worker that died holding claims must not strand receipts, and the
    // recovery delivery happens exactly once per receipt.
    let temp = NamedTempFile::new().unwrap();
    let path = temp.path().to_str().unwrap().to_string();

    {
        let ofd = SwitchableOfd::new(false);
        let stack = build_stack(&path, ofd, false);
        for i in 0..3 {
            stack.fiscal.submit(sale(&format!("k-{i}"), i)).await.unwrap();
        }
        // Claim, then "crash" before delivering.
        let claimed = stack.buffer.claim_pending(10).unwrap();
        assert_eq!(claimed.len(), 3);
    }

    let ofd = SwitchableOfd::new(true);
    let stack = build_stack(&path, ofd.clone(), false);

    // Startup recovery path: stale claims (here: any claim) revert.
    let now = kkt_adapter::models::now_secs();
    stack.buffer.revert_stale_syncing(now + 1).unwrap();

    stack.worker.run_cycle().await.unwrap();
    let status = stack.buffer.status().unwrap();
    assert_eq!(status.synced, 3);
    assert_eq!(ofd.call_count(), 3, "each receipt delivered exactly once");
}

#[tokio::test]
async fn test_inline_delivery_syncs_without_worker() {
    // With the OFD reachable, a submitted receipt syncs via the
    // inline Phase 2 trigger alone.
    let temp = NamedTempFile::new().unwrap();
    let ofd = SwitchableOfd::new(true);
    let stack = build_stack(temp.path().to_str().unwrap(), ofd, true);

    let out = stack.fiscal.submit(sale("k-A1", 1000)).await.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let r = stack.buffer.get(&out.id).unwrap().unwrap();
        if r.status == ReceiptStatus::Synced {
            assert!(r.hlc_server.is_some());
            break;
        }
        assert!(std::time::Instant::now() < deadline, "inline sync never landed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let status = stack.buffer.status().unwrap();
    assert_eq!(status.pending, 0);
}

#[tokio::test]
async fn test_refund_unblocks_after_drain() {
    let temp = NamedTempFile::new().unwrap();
    let ofd = SwitchableOfd::new(false);
    let stack = build_stack(temp.path().to_str().unwrap(), ofd, false);

    let original = stack.fiscal.submit(sale("k-orig", 10)).await.unwrap();

    let refund = SubmitRequest {
        pos_id: "POS-001".into(),
        receipt_type: ReceiptType::Refund,
        original_id: Some(original.id.clone()),
        payload: json!({ "total": -10 }),
        idempotency_key: "k-refund".into(),
    };
    assert!(stack.fiscal.submit(refund.clone()).await.is_err());

    stack.ofd.set_up(true);
    stack.worker.run_cycle().await.unwrap();

    let out = stack.fiscal.submit(refund).await.unwrap();
    let stored = stack.buffer.get(&out.id).unwrap().unwrap();
    assert_eq!(stored.receipt_type, ReceiptType::Refund);
}
