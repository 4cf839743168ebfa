//! Adapter configuration.
//!
//! Everything comes from the environment (plus `.env` via dotenv), with the
//! defaults mandated for on-edge deployments. Relative data paths are
//! anchored to the crate directory so running from a different working
//! directory never creates a stray empty database.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Max receipts in {pending, syncing} before inserts fail fast.
    pub capacity: usize,
    /// Fullness percentage that raises a P2 alert.
    pub alert_percent: u8,
    /// Fullness percentage that raises a P1 alert (and blocks inserts).
    pub block_percent: u8,
    /// Synced receipts older than this are archived out of the live buffer.
    pub archive_retention_days: i64,
    pub archive_poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct OfdConfig {
    /// Base URL of the fiscal data operator. None disables Phase 2 delivery
    /// entirely (receipts accumulate as pending).
    pub base_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct KktConfig {
    /// URL of the printer driver shim. None means no printer attached.
    pub driver_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
    pub lock_ttl: Duration,
    /// Lease store endpoint. None selects the in-process lease, which is
    /// correct for single-node deployments.
    pub lock_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// ERP heartbeat sink. None disables the emitter.
    pub url: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub online_successes: u32,
    pub offline_failures: u32,
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Identifier of this terminal, reported in heartbeats.
    pub pos_id: String,
    pub db_path: String,
    pub port: u16,
    pub buffer: BufferConfig,
    pub breaker: BreakerConfig,
    pub ofd: OfdConfig,
    pub kkt: KktConfig,
    pub sync: SyncConfig,
    pub heartbeat: HeartbeatConfig,
}

impl AdapterConfig {
    pub fn from_env() -> Self {
        let db_path = resolve_data_path(env::var("DB_PATH").ok(), "kkt_adapter.db");

        AdapterConfig {
            pos_id: env_string("POS_ID", "POS-000"),
            db_path,
            port: env_parse("PORT", 8080u16),
            buffer: BufferConfig {
                capacity: env_parse("BUFFER_CAPACITY", 200usize),
                alert_percent: env_parse("BUFFER_ALERT_PERCENT", 80u8),
                block_percent: env_parse("BUFFER_BLOCK_PERCENT", 100u8),
                archive_retention_days: env_parse("ARCHIVE_RETENTION_DAYS", 90i64),
                archive_poll_interval: Duration::from_secs(env_parse("ARCHIVE_POLL_S", 3_600u64)),
            },
            breaker: BreakerConfig {
                failure_threshold: env_parse("CB_FAILURE_THRESHOLD", 5u32),
                recovery_timeout: Duration::from_secs(env_parse("CB_RECOVERY_TIMEOUT_S", 60u64)),
                success_threshold: env_parse("CB_SUCCESS_THRESHOLD", 2u32),
            },
            ofd: OfdConfig {
                base_url: env_url("OFD_BASE_URL"),
                timeout: Duration::from_secs(env_parse("OFD_TIMEOUT_S", 10u64)),
            },
            kkt: KktConfig {
                driver_url: env_url("KKT_DRIVER_URL"),
                timeout: Duration::from_secs(env_parse("KKT_TIMEOUT_S", 10u64)),
            },
            sync: SyncConfig {
                interval: Duration::from_secs(env_parse("SYNC_INTERVAL_S", 60u64)),
                batch_size: env_parse("SYNC_BATCH_SIZE", 50usize),
                max_retries: env_parse("SYNC_MAX_RETRIES", 20u32),
                lock_ttl: Duration::from_secs(env_parse("SYNC_LOCK_TTL_S", 300u64)),
                lock_url: env_url("SYNC_LOCK_URL"),
            },
            heartbeat: HeartbeatConfig {
                url: env_url("ERP_HEARTBEAT_URL"),
                interval: Duration::from_secs(env_parse("HEARTBEAT_INTERVAL_S", 30u64)),
                timeout: Duration::from_secs(env_parse("HEARTBEAT_TIMEOUT_S", 5u64)),
                online_successes: env_parse("HEARTBEAT_ONLINE_SUCCESSES", 2u32),
                offline_failures: env_parse("HEARTBEAT_OFFLINE_FAILURES", 3u32),
            },
        }
    }

    /// Age beyond which a `syncing` row is considered abandoned and reverted
    /// to `pending` on worker startup.
    pub fn stale_claim_age(&self) -> Duration {
        self.sync.interval * 5
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_url(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn default_data_path(filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    // Relative paths are relative to the crate dir, not the caller's cwd.
    base.join(p).to_string_lossy().to_string()
}

pub fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
