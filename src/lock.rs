//! Cluster-wide sync lock.
//!
//! Two workers draining the same buffer is a correctness hazard: the OFD's
//! own idempotency is not assumed, so the claim must be exclusive across
//! processes. The lease store does atomic check-and-set acquire with a TTL
//! and authenticated release via a fencing token.
//!
//! Single-node deployments (the common edge install) use the in-process
//! lease; clusters point `SYNC_LOCK_URL` at a shared lease store.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LockLease {
    pub token: String,
}

#[async_trait]
pub trait SyncLock: Send + Sync {
    /// `None` means another holder has the lease; skip the cycle.
    async fn acquire(&self) -> anyhow::Result<Option<LockLease>>;
    async fn release(&self, lease: LockLease) -> anyhow::Result<()>;
}

/// Lease held in process memory. Exclusive within this Adapter, which is all
/// a single-node install needs; the TTL still applies so an abandoned lease
/// (panicked cycle) expires rather than wedging sync forever.
pub struct InProcessLease {
    ttl: Duration,
    state: Mutex<Option<(String, Instant)>>,
}

impl InProcessLease {
    pub fn new(ttl: Duration) -> Self {
        InProcessLease {
            ttl,
            state: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SyncLock for InProcessLease {
    async fn acquire(&self) -> anyhow::Result<Option<LockLease>> {
        let mut state = self.state.lock();
        if let Some((_, expires)) = state.as_ref() {
            if Instant::now() < *expires {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        *state = Some((token.clone(), Instant::now() + self.ttl));
        Ok(Some(LockLease { token }))
    }

    async fn release(&self, lease: LockLease) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        // Fencing: only the current holder may clear the lease.
        if matches!(state.as_ref(), Some((token, _)) if *token == lease.token) {
            *state = None;
        }
        Ok(())
    }
}

/// Lease client for a shared HTTP lease store.
pub struct HttpLeaseLock {
    http: reqwest::Client,
    base_url: String,
    key: String,
    ttl: Duration,
}

#[derive(Debug, Deserialize)]
struct AcquireResponse {
    token: String,
}

impl HttpLeaseLock {
    pub fn new(base_url: &str, key: &str, ttl: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(HttpLeaseLock {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            ttl,
        })
    }
}

#[async_trait]
impl SyncLock for HttpLeaseLock {
    async fn acquire(&self) -> anyhow::Result<Option<LockLease>> {
        let url = format!("{}/acquire", self.base_url);
        let body = serde_json::json!({
            "key": self.key,
            "ttl_s": self.ttl.as_secs(),
        });

        let response = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                // Denied, not fatal: the next cycle retries acquisition.
                warn!(error = %e, "Lease store unreachable, skipping sync cycle");
                return Ok(None);
            }
        };

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(None);
        }
        if !response.status().is_success() {
            warn!(status = %response.status(), "Lease acquire refused");
            return Ok(None);
        }

        let ack: AcquireResponse = response.json().await?;
        Ok(Some(LockLease { token: ack.token }))
    }

    async fn release(&self, lease: LockLease) -> anyhow::Result<()> {
        let url = format!("{}/release", self.base_url);
        let body = serde_json::json!({
            "key": self.key,
            "token": lease.token,
        });
        // Best effort: an unreleased lease expires with its TTL.
        if let Err(e) = self.http.post(&url).json(&body).send().await {
            warn!(error = %e, "Lease release failed, relying on TTL expiry");
        }
        Ok(())
    }
}
