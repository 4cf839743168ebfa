//! Heartbeat push to the ERP.
//!
//! Every interval the Adapter reports terminal identity, buffer fullness,
//! breaker posture and clock drift. Connectivity classification is damped:
//! a terminal goes "offline" only after 3 consecutive failed pushes and
//! comes back "online" after 2 consecutive successes, so a blinking uplink
//! doesn't flap alerts. Heartbeat trouble never touches fiscalization.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::buffer::BufferDb;
use crate::config::HeartbeatConfig;
use crate::hlc::HybridLogicalClock;
use crate::metrics::AdapterMetrics;

/// Damped online/offline classification.
#[derive(Debug)]
pub struct ConnectivityTracker {
    online: bool,
    consecutive_successes: u32,
    consecutive_failures: u32,
    online_successes: u32,
    offline_failures: u32,
}

impl ConnectivityTracker {
    pub fn new(online_successes: u32, offline_failures: u32) -> Self {
        ConnectivityTracker {
            online: true,
            consecutive_successes: 0,
            consecutive_failures: 0,
            online_successes,
            offline_failures,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Record one push result. Returns the new classification if it changed.
    pub fn record(&mut self, success: bool) -> Option<bool> {
        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
            if !self.online && self.consecutive_successes >= self.online_successes {
                self.online = true;
                return Some(true);
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            if self.online && self.consecutive_failures >= self.offline_failures {
                self.online = false;
                return Some(false);
            }
        }
        None
    }
}

#[derive(Debug, Serialize)]
struct HeartbeatPayload<'a> {
    pos_id: &'a str,
    buffer_fullness: f64,
    circuit_breaker_state: &'a str,
    clock_drift: i64,
}

pub struct HeartbeatEmitter {
    http: reqwest::Client,
    url: String,
    pos_id: String,
    cfg: HeartbeatConfig,
    buffer: Arc<BufferDb>,
    breaker: Arc<CircuitBreaker>,
    hlc: Arc<HybridLogicalClock>,
    metrics: Arc<AdapterMetrics>,
}

impl HeartbeatEmitter {
    pub fn new(
        url: &str,
        pos_id: &str,
        cfg: HeartbeatConfig,
        buffer: Arc<BufferDb>,
        breaker: Arc<CircuitBreaker>,
        hlc: Arc<HybridLogicalClock>,
        metrics: Arc<AdapterMetrics>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(HeartbeatEmitter {
            http,
            url: format!("{}/api/v1/kkt/heartbeat", url.trim_end_matches('/')),
            pos_id: pos_id.to_string(),
            cfg,
            buffer,
            breaker,
            hlc,
            metrics,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tracker =
                ConnectivityTracker::new(self.cfg.online_successes, self.cfg.offline_failures);
            self.metrics.set_heartbeat_online(tracker.is_online());

            let mut ticker = interval(self.cfg.interval);
            loop {
                ticker.tick().await;

                let success = self.push_once().await;
                if let Some(online) = tracker.record(success) {
                    self.metrics.set_heartbeat_online(online);
                    if online {
                        info!(pos_id = %self.pos_id, "Terminal back online (ERP reachable)");
                    } else {
                        warn!(pos_id = %self.pos_id, "Terminal classified offline (ERP unreachable)");
                    }
                }
            }
        })
    }

    async fn push_once(&self) -> bool {
        let fullness = match self.buffer.status() {
            Ok(status) => {
                // Refresh the buffer gauges while the numbers are fresh.
                self.metrics
                    .set_buffer_levels(status.in_flight(), status.fullness, status.dlq_size);
                status.fullness
            }
            Err(e) => {
                warn!(error = %e, "Heartbeat could not read buffer status");
                return false;
            }
        };

        let drift = self.hlc.drift_secs();
        self.metrics.set_hlc_drift(drift);

        let payload = HeartbeatPayload {
            pos_id: &self.pos_id,
            buffer_fullness: fullness,
            circuit_breaker_state: self.breaker.state().as_str(),
            clock_drift: drift,
        };

        match self.http.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(fullness, drift, "Heartbeat delivered");
                true
            }
            Ok(response) => {
                debug!(status = %response.status(), "Heartbeat rejected by ERP");
                false
            }
            Err(e) => {
                debug!(error = %e, "Heartbeat push failed");
                false
            }
        }
    }
}

/// Keep the derived gauges warm even when no ERP sink is configured.
pub fn spawn_gauge_refresher(
    buffer: Arc<BufferDb>,
    hlc: Arc<HybridLogicalClock>,
    metrics: Arc<AdapterMetrics>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            if let Ok(status) = buffer.status() {
                metrics.set_buffer_levels(status.in_flight(), status.fullness, status.dlq_size);
            }
            metrics.set_hlc_drift(hlc.drift_secs());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_after_three_consecutive_failures() {
        let mut t = ConnectivityTracker::new(2, 3);
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), Some(false));
        assert!(!t.is_online());

        // Further failures don't re-announce.
        assert_eq!(t.record(false), None);
    }

    #[test]
    fn test_online_after_two_consecutive_successes() {
        let mut t = ConnectivityTracker::new(2, 3);
        for _ in 0..3 {
            t.record(false);
        }
        assert_eq!(t.record(true), None);
        assert_eq!(t.record(true), Some(true));
        assert!(t.is_online());
    }

    #[test]
    fn test_brief_glitch_does_not_flap() {
        let mut t = ConnectivityTracker::new(2, 3);
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(true), None);
        assert_eq!(t.record(false), None);
        assert!(t.is_online(), "two failures then recovery stays online");
    }

    #[test]
    fn test_recovery_requires_consecutive_successes() {
        let mut t = ConnectivityTracker::new(2, 3);
        for _ in 0..3 {
            t.record(false);
        }
        t.record(true);
        t.record(false);
        assert_eq!(t.record(true), None, "streak restarted by the failure");
        assert_eq!(t.record(true), Some(true));
    }
}
