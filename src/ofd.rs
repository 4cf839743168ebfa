//! OFD client and Phase 2 delivery.
//!
//! The client is a thin HTTP caller with one fixed timeout and zero retries
//! of its own; retry policy belongs to the sync worker. Every response is
//! classified into one of three outcomes, and the classification, not an
//! exception, drives what happens to the receipt.
//!
//! `OfdDelivery` is the shared Phase 2 coordinator injected into both the
//! fiscalization service (inline best-effort) and the sync worker: it owns
//! the breaker bookkeeping, the buffer transition for each outcome, and the
//! HLC observation of server time.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerTransition, CircuitBreaker};
use crate::buffer::{BufferDb, RetryDisposition};
use crate::hlc::HybridLogicalClock;
use crate::metrics::AdapterMetrics;
use crate::models::{BufferEventKind, DlqReason, Receipt};

/// Acknowledgement fields the Adapter actually needs; everything else in the
/// operator's response is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct OfdAck {
    pub server_time: i64,
    pub ack_id: String,
}

/// Classified result of one OFD call.
#[derive(Debug)]
pub enum OfdOutcome {
    Accepted(OfdAck),
    /// Timeout, connection error, HTTP 5xx or 429. Worth retrying.
    Transient(String),
    /// Any other 4xx, or a 2xx whose body fails ack validation. Retrying
    /// cannot help; the receipt goes to the DLQ.
    Permanent(String),
}

#[async_trait]
pub trait OfdApi: Send + Sync {
    async fn submit_receipt(&self, receipt: &Receipt) -> OfdOutcome;
}

/// HTTP implementation against `POST {base}/receipts`.
pub struct OfdClient {
    http: reqwest::Client,
    base_url: String,
}

impl OfdClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(OfdClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl OfdApi for OfdClient {
    async fn submit_receipt(&self, receipt: &Receipt) -> OfdOutcome {
        let url = format!("{}/receipts", self.base_url);
        let body = serde_json::json!({
            "receipt_id": receipt.id,
            "pos_id": receipt.pos_id,
            "type": receipt.receipt_type.as_str(),
            "created_at": receipt.created_at,
            "document": receipt.payload,
        });

        let response = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                let kind = if e.is_timeout() { "timeout" } else { "connect" };
                return OfdOutcome::Transient(format!("{kind}: {e}"));
            }
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<OfdAck>().await {
                Ok(ack) => OfdOutcome::Accepted(ack),
                Err(e) => OfdOutcome::Permanent(format!("malformed acknowledgement: {e}")),
            };
        }

        let detail = response.text().await.unwrap_or_default();
        let short = detail.chars().take(200).collect::<String>();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            OfdOutcome::Transient(format!("HTTP {status}: {short}"))
        } else {
            OfdOutcome::Permanent(format!("HTTP {status}: {short}"))
        }
    }
}

/// Outcome of one Phase 2 attempt, after the buffer transition was applied.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryResult {
    Synced { server_time: i64 },
    Requeued,
    DeadLettered,
    /// Breaker refused the call; the claim was released untouched.
    CircuitOpen,
    /// The row was not claimable (another path owns it, or it already left
    /// `pending`).
    NotClaimable,
}

pub struct OfdDelivery {
    client: Arc<dyn OfdApi>,
    breaker: Arc<CircuitBreaker>,
    buffer: Arc<BufferDb>,
    hlc: Arc<HybridLogicalClock>,
    metrics: Arc<AdapterMetrics>,
    max_retries: u32,
}

impl OfdDelivery {
    pub fn new(
        client: Arc<dyn OfdApi>,
        breaker: Arc<CircuitBreaker>,
        buffer: Arc<BufferDb>,
        hlc: Arc<HybridLogicalClock>,
        metrics: Arc<AdapterMetrics>,
        max_retries: u32,
    ) -> Self {
        OfdDelivery {
            client,
            breaker,
            buffer,
            hlc,
            metrics,
            max_retries,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Deliver a receipt the caller has already claimed (status `syncing`).
    pub async fn deliver_claimed(&self, receipt: &Receipt) -> anyhow::Result<DeliveryResult> {
        if !self.breaker.try_acquire() {
            AdapterMetrics::inc(&self.metrics.circuit_open_rejections_total);
            self.buffer.release_claim(&receipt.id)?;
            return Ok(DeliveryResult::CircuitOpen);
        }

        AdapterMetrics::inc(&self.metrics.ofd_attempts_total);
        let outcome = self.client.submit_receipt(receipt).await;

        match outcome {
            OfdOutcome::Accepted(ack) => {
                self.record_transition(self.breaker.on_success());
                self.hlc.observe(ack.server_time);
                self.buffer.mark_synced(&receipt.id, ack.server_time)?;
                AdapterMetrics::inc(&self.metrics.receipts_synced_total);
                debug!(
                    receipt_id = %receipt.id,
                    server_time = ack.server_time,
                    ack_id = %ack.ack_id,
                    "Receipt acknowledged by OFD"
                );
                Ok(DeliveryResult::Synced {
                    server_time: ack.server_time,
                })
            }
            OfdOutcome::Transient(err) => {
                AdapterMetrics::inc(&self.metrics.ofd_transient_failures_total);
                self.record_transition(self.breaker.on_transient_failure());
                match self
                    .buffer
                    .increment_retry(&receipt.id, &err, self.max_retries)?
                {
                    RetryDisposition::Requeued { retry_count, .. } => {
                        debug!(receipt_id = %receipt.id, retry_count, error = %err, "OFD transient failure, requeued");
                        Ok(DeliveryResult::Requeued)
                    }
                    RetryDisposition::DeadLettered => {
                        AdapterMetrics::inc(&self.metrics.receipts_dead_lettered_total);
                        warn!(receipt_id = %receipt.id, error = %err, "Retry budget exhausted, receipt dead-lettered");
                        Ok(DeliveryResult::DeadLettered)
                    }
                }
            }
            OfdOutcome::Permanent(err) => {
                AdapterMetrics::inc(&self.metrics.ofd_permanent_failures_total);
                self.breaker.on_permanent_failure();
                self.buffer
                    .move_to_dlq(&receipt.id, DlqReason::PermanentReject, &err)?;
                AdapterMetrics::inc(&self.metrics.receipts_dead_lettered_total);
                warn!(receipt_id = %receipt.id, error = %err, "OFD rejected receipt permanently");
                Ok(DeliveryResult::DeadLettered)
            }
        }
    }

    /// Best-effort inline Phase 2, triggered right after Phase 1. Claims the
    /// row first so the sync worker can never double-deliver it.
    pub async fn try_deliver_inline(&self, id: &str) -> anyhow::Result<DeliveryResult> {
        if self.breaker.state() == crate::breaker::BreakerState::Open {
            return Ok(DeliveryResult::CircuitOpen);
        }
        if !self.buffer.claim_one(id)? {
            return Ok(DeliveryResult::NotClaimable);
        }
        let receipt = match self.buffer.get(id)? {
            Some(r) => r,
            None => return Ok(DeliveryResult::NotClaimable),
        };
        self.deliver_claimed(&receipt).await
    }

    fn record_transition(&self, transition: Option<BreakerTransition>) {
        let Some(transition) = transition else {
            return;
        };
        let kind = match transition {
            BreakerTransition::Opened => BufferEventKind::CircuitOpened,
            BreakerTransition::Closed => BufferEventKind::CircuitClosed,
        };
        if let Err(e) = self.buffer.append_event(kind, None, None) {
            warn!(error = %e, "Failed to record breaker transition event");
        }
        info!(event = kind.as_str(), "Circuit breaker posture changed");
    }
}
