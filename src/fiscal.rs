//! Two-phase fiscalization.
//!
//! Phase 1 makes the sale durable: validate, stamp with HLC, insert as
//! `pending` (with its event, one transaction), then print. Phase 1 never
//! touches the OFD and never blocks on breaker state; a printing failure
//! raises a P2 alert but still answers success; the document is legally
//! captured by the fiscal storage chip regardless of paper.
//!
//! Phase 2 (remote delivery) is scheduled best-effort right after Phase 1
//! and owned by the sync worker otherwise.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::buffer::{BufferDb, BufferError, InsertOutcome};
use crate::error::AdapterError;
use crate::hlc::HybridLogicalClock;
use crate::kkt::{KktDriver, PrintOutcome};
use crate::metrics::AdapterMetrics;
use crate::models::{now_secs, Receipt, ReceiptStatus, ReceiptType};
use crate::ofd::OfdDelivery;
use uuid::Uuid;

/// Longest accepted Idempotency-Key value, bytes.
const MAX_IDEMPOTENCY_KEY_BYTES: usize = 128;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub pos_id: String,
    pub receipt_type: ReceiptType,
    pub original_id: Option<String>,
    pub payload: Value,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub id: String,
    /// "buffered" or "printed" for a fresh receipt; the stored status for a
    /// repeated idempotency key.
    pub status: String,
}

/// Answer for the advisory refund check.
#[derive(Debug, Clone)]
pub struct RefundCheck {
    pub allowed: bool,
    /// Status of the antecedent if it is still in the live buffer.
    pub sync_status: Option<ReceiptStatus>,
}

pub struct FiscalizationService {
    buffer: Arc<BufferDb>,
    hlc: Arc<HybridLogicalClock>,
    kkt: Arc<dyn KktDriver>,
    delivery: Option<Arc<OfdDelivery>>,
    metrics: Arc<AdapterMetrics>,
    alert_percent: u8,
    block_percent: u8,
    /// Last alert level raised: 0 none, 1 = P2, 2 = P1. Keeps threshold
    /// crossings from spamming the log on every insert.
    alert_level: Mutex<u8>,
}

impl FiscalizationService {
    pub fn new(
        buffer: Arc<BufferDb>,
        hlc: Arc<HybridLogicalClock>,
        kkt: Arc<dyn KktDriver>,
        delivery: Option<Arc<OfdDelivery>>,
        metrics: Arc<AdapterMetrics>,
        alert_percent: u8,
        block_percent: u8,
    ) -> Self {
        FiscalizationService {
            buffer,
            hlc,
            kkt,
            delivery,
            metrics,
            alert_percent,
            block_percent,
            alert_level: Mutex::new(0),
        }
    }

    /// Phase 1, plus the inline Phase 2 trigger.
    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitOutcome, AdapterError> {
        self.validate(&req)?;

        if req.receipt_type.requires_original() {
            let original_id = req.original_id.as_deref().unwrap_or_default();
            let check = self.check_refund(original_id)?;
            if !check.allowed {
                return Err(AdapterError::RefundBlocked {
                    original_id: original_id.to_string(),
                    // check.allowed == false implies a live, non-synced row.
                    status: check.sync_status.unwrap_or(ReceiptStatus::Pending),
                });
            }
        }

        let stamp = self.hlc.now();
        let receipt = Receipt {
            id: Uuid::new_v4().to_string(),
            pos_id: req.pos_id.clone(),
            created_at: now_secs(),
            hlc_local: stamp.local,
            hlc_counter: stamp.counter,
            hlc_server: None,
            receipt_type: req.receipt_type,
            original_id: req.original_id.clone(),
            payload: req.payload.clone(),
            idempotency_key: req.idempotency_key.clone(),
            status: ReceiptStatus::Pending,
            retry_count: 0,
            last_error: None,
            synced_at: None,
        };

        let fullness = match self.buffer.insert(&receipt) {
            Ok(InsertOutcome::Inserted { fullness }) => fullness,
            Ok(InsertOutcome::Duplicate { id, status }) => {
                AdapterMetrics::inc(&self.metrics.receipts_duplicate_total);
                info!(
                    idempotency_key = %req.idempotency_key,
                    existing_id = %id,
                    "Repeated idempotency key, returning original receipt"
                );
                return Ok(SubmitOutcome {
                    id,
                    status: status.as_str().to_string(),
                });
            }
            Err(BufferError::Full { in_flight, capacity }) => {
                error!(
                    severity = "P1",
                    in_flight, capacity, "Buffer full, sale refused"
                );
                AdapterMetrics::inc(&self.metrics.buffer_alerts_p1_total);
                return Err(AdapterError::BufferFull { in_flight, capacity });
            }
            Err(e) => return Err(AdapterError::Internal(e.into())),
        };

        AdapterMetrics::inc(&self.metrics.receipts_accepted_total);
        self.raise_capacity_alerts(fullness);

        // Paper. Failures are reconciled by the operator, not the cashier.
        let status = match self.kkt.print(&receipt.payload).await {
            PrintOutcome::Printed => "printed",
            PrintOutcome::Timeout => {
                AdapterMetrics::inc(&self.metrics.print_failures_total);
                warn!(severity = "P2", receipt_id = %receipt.id, "KKT print timed out");
                "buffered"
            }
            PrintOutcome::HardwareError(detail) => {
                AdapterMetrics::inc(&self.metrics.print_failures_total);
                warn!(severity = "P2", receipt_id = %receipt.id, error = %detail, "KKT print failed");
                "buffered"
            }
        };

        // Inline Phase 2, best effort. The worker owns the retry schedule.
        if let Some(delivery) = &self.delivery {
            let delivery = delivery.clone();
            let id = receipt.id.clone();
            tokio::spawn(async move {
                if let Err(e) = delivery.try_deliver_inline(&id).await {
                    warn!(receipt_id = %id, error = %e, "Inline delivery attempt errored");
                }
            });
        }

        Ok(SubmitOutcome {
            id: receipt.id,
            status: status.to_string(),
        })
    }

    /// The compensation rule: a refund may only proceed once its antecedent
    /// is confirmed delivered, or has already been archived out (archival
    /// only ever removes synced rows, so absence implies delivery).
    pub fn check_refund(&self, original_id: &str) -> Result<RefundCheck, AdapterError> {
        let antecedent = self
            .buffer
            .get(original_id)
            .map_err(|e| AdapterError::Internal(e.into()))?;

        Ok(match antecedent {
            None => RefundCheck {
                allowed: true,
                sync_status: None,
            },
            Some(r) if r.status == ReceiptStatus::Synced => RefundCheck {
                allowed: true,
                sync_status: Some(ReceiptStatus::Synced),
            },
            Some(r) => RefundCheck {
                allowed: false,
                sync_status: Some(r.status),
            },
        })
    }

    fn validate(&self, req: &SubmitRequest) -> Result<(), AdapterError> {
        if req.pos_id.trim().is_empty() {
            return Err(AdapterError::InvalidRequest("pos_id is required".into()));
        }
        if req.idempotency_key.is_empty() {
            return Err(AdapterError::InvalidRequest(
                "Idempotency-Key header is required".into(),
            ));
        }
        if req.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_BYTES {
            return Err(AdapterError::InvalidRequest(format!(
                "Idempotency-Key exceeds {MAX_IDEMPOTENCY_KEY_BYTES} bytes"
            )));
        }
        if !req.payload.is_object() {
            return Err(AdapterError::InvalidRequest(
                "payload must be a JSON object".into(),
            ));
        }
        if req.receipt_type.requires_original()
            && req
                .original_id
                .as_deref()
                .map(|s| s.trim().is_empty())
                .unwrap_or(true)
        {
            return Err(AdapterError::InvalidRequest(format!(
                "{} requires original_id",
                req.receipt_type.as_str()
            )));
        }
        Ok(())
    }

    fn raise_capacity_alerts(&self, fullness: f64) {
        let percent = (fullness * 100.0).round() as u8;
        let level = if percent >= self.block_percent {
            2
        } else if percent >= self.alert_percent {
            1
        } else {
            0
        };

        let mut last = self.alert_level.lock();
        if level > *last {
            if level == 2 {
                error!(severity = "P1", percent, "Buffer at capacity, further sales will be refused");
                AdapterMetrics::inc(&self.metrics.buffer_alerts_p1_total);
            } else {
                warn!(severity = "P2", percent, "Buffer filling up");
                AdapterMetrics::inc(&self.metrics.buffer_alerts_p2_total);
            }
        }
        *last = level;
    }
}
