//! Prometheus metrics for the Adapter.
//!
//! A small atomic registry rendered as Prometheus text by `GET /metrics`.
//! Gauges that have a live source of truth (buffer fullness, HLC drift) are
//! refreshed by the scrape handler right before rendering.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Circuit breaker gauge encoding: CLOSED=0, OPEN=1, HALF_OPEN=2.
pub const BREAKER_CLOSED: i64 = 0;
pub const BREAKER_OPEN: i64 = 1;
pub const BREAKER_HALF_OPEN: i64 = 2;

#[derive(Debug, Default)]
pub struct AdapterMetrics {
    /// CLOSED=0, OPEN=1, HALF_OPEN=2.
    pub circuit_breaker_state: AtomicI64,
    /// Receipts currently pending + syncing.
    pub buffer_in_flight: AtomicU64,
    /// Buffer fullness in percent, 0..=100.
    pub buffer_fullness_percent: AtomicU64,
    /// Dead letters awaiting operator resolution.
    pub dlq_unresolved: AtomicU64,
    /// HLC local minus wall clock, seconds.
    pub hlc_drift_seconds: AtomicI64,
    /// ERP connectivity after hysteresis: 1 online, 0 offline.
    pub heartbeat_online: AtomicI64,

    pub receipts_accepted_total: AtomicU64,
    pub receipts_duplicate_total: AtomicU64,
    pub receipts_synced_total: AtomicU64,
    pub receipts_dead_lettered_total: AtomicU64,
    pub print_failures_total: AtomicU64,
    pub ofd_attempts_total: AtomicU64,
    pub ofd_transient_failures_total: AtomicU64,
    pub ofd_permanent_failures_total: AtomicU64,
    pub circuit_open_rejections_total: AtomicU64,
    pub sync_cycles_total: AtomicU64,
    pub buffer_alerts_p1_total: AtomicU64,
    pub buffer_alerts_p2_total: AtomicU64,
}

impl AdapterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_breaker_state(&self, encoded: i64) {
        self.circuit_breaker_state.store(encoded, Ordering::Relaxed);
    }

    pub fn set_buffer_levels(&self, in_flight: usize, fullness: f64, dlq: usize) {
        self.buffer_in_flight
            .store(in_flight as u64, Ordering::Relaxed);
        self.buffer_fullness_percent
            .store((fullness * 100.0).round().clamp(0.0, 100.0) as u64, Ordering::Relaxed);
        self.dlq_unresolved.store(dlq as u64, Ordering::Relaxed);
    }

    pub fn set_hlc_drift(&self, drift_secs: i64) {
        self.hlc_drift_seconds.store(drift_secs, Ordering::Relaxed);
    }

    pub fn set_heartbeat_online(&self, online: bool) {
        self.heartbeat_online
            .store(if online { 1 } else { 0 }, Ordering::Relaxed);
    }

    /// Render the whole registry in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        gauge_i64(
            &mut out,
            "kkt_adapter_circuit_breaker_state",
            "Circuit breaker state: 0=closed, 1=open, 2=half_open",
            self.circuit_breaker_state.load(Ordering::Relaxed),
        );
        gauge_u64(
            &mut out,
            "kkt_adapter_buffer_in_flight",
            "Receipts currently pending or syncing",
            self.buffer_in_flight.load(Ordering::Relaxed),
        );
        gauge_u64(
            &mut out,
            "kkt_adapter_buffer_fullness_percent",
            "Buffer fullness percentage",
            self.buffer_fullness_percent.load(Ordering::Relaxed),
        );
        gauge_u64(
            &mut out,
            "kkt_adapter_dlq_unresolved",
            "Unresolved dead-letter entries",
            self.dlq_unresolved.load(Ordering::Relaxed),
        );
        gauge_i64(
            &mut out,
            "kkt_adapter_hlc_drift_seconds",
            "HLC local component minus wall clock",
            self.hlc_drift_seconds.load(Ordering::Relaxed),
        );
        gauge_i64(
            &mut out,
            "kkt_adapter_heartbeat_online",
            "ERP connectivity after hysteresis: 1=online",
            self.heartbeat_online.load(Ordering::Relaxed),
        );

        counter(&mut out, "kkt_adapter_receipts_accepted_total", &self.receipts_accepted_total);
        counter(&mut out, "kkt_adapter_receipts_duplicate_total", &self.receipts_duplicate_total);
        counter(&mut out, "kkt_adapter_receipts_synced_total", &self.receipts_synced_total);
        counter(
            &mut out,
            "kkt_adapter_receipts_dead_lettered_total",
            &self.receipts_dead_lettered_total,
        );
        counter(&mut out, "kkt_adapter_print_failures_total", &self.print_failures_total);
        counter(&mut out, "kkt_adapter_ofd_attempts_total", &self.ofd_attempts_total);
        counter(
            &mut out,
            "kkt_adapter_ofd_transient_failures_total",
            &self.ofd_transient_failures_total,
        );
        counter(
            &mut out,
            "kkt_adapter_ofd_permanent_failures_total",
            &self.ofd_permanent_failures_total,
        );
        counter(
            &mut out,
            "kkt_adapter_circuit_open_rejections_total",
            &self.circuit_open_rejections_total,
        );
        counter(&mut out, "kkt_adapter_sync_cycles_total", &self.sync_cycles_total);
        counter(&mut out, "kkt_adapter_buffer_alerts_p1_total", &self.buffer_alerts_p1_total);
        counter(&mut out, "kkt_adapter_buffer_alerts_p2_total", &self.buffer_alerts_p2_total);

        out
    }
}

fn gauge_u64(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
    ));
}

fn gauge_i64(out: &mut String, name: &str, help: &str, value: i64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
    ));
}

fn counter(out: &mut String, name: &str, value: &AtomicU64) {
    out.push_str(&format!(
        "# TYPE {name} counter\n{name} {}\n",
        value.load(Ordering::Relaxed)
    ));
}
