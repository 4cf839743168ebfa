//! Durable receipt buffer.
//!
//! An embedded SQLite relation configured for maximum durability: WAL
//! journaling with `synchronous = FULL`, foreign keys on, and every state
//! change committed together with its lifecycle event in one transaction.
//! The only post-crash cleanup the store ever needs is reverting stale
//! `syncing` claims back to `pending`.

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{
    now_secs, BufferEvent, BufferEventKind, BufferStatus, DlqEntry, DlqReason, Receipt,
    ReceiptStatus, ReceiptType,
};

/// Retry backoff ceiling between delivery attempts, seconds.
const MAX_BACKOFF_SECS: i64 = 60;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS receipts (
    id               TEXT PRIMARY KEY,
    pos_id           TEXT NOT NULL,
    created_at       INTEGER NOT NULL,
    hlc_local        INTEGER NOT NULL,
    hlc_counter      INTEGER NOT NULL,
    hlc_server       INTEGER,
    receipt_type     TEXT NOT NULL,
    original_id      TEXT,
    payload_json     TEXT NOT NULL,
    idempotency_key  TEXT NOT NULL UNIQUE,
    status           TEXT NOT NULL,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    last_error       TEXT,
    synced_at        INTEGER,
    claimed_at       INTEGER,
    next_attempt_at  INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_receipts_status
    ON receipts(status);

CREATE INDEX IF NOT EXISTS idx_receipts_pos_hlc
    ON receipts(pos_id, hlc_local, hlc_counter);

CREATE TABLE IF NOT EXISTS dead_letters (
    id                   TEXT PRIMARY KEY,
    original_receipt_id  TEXT NOT NULL REFERENCES receipts(id),
    failed_at            INTEGER NOT NULL,
    reason               TEXT NOT NULL,
    payload_json         TEXT NOT NULL,
    retry_attempts       INTEGER NOT NULL,
    last_error           TEXT,
    resolved_at          INTEGER,
    resolved_by          TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS buffer_events (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type    TEXT NOT NULL,
    receipt_id    TEXT,
    at            INTEGER NOT NULL,
    metadata_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_buffer_events_at
    ON buffer_events(at DESC);

CREATE TABLE IF NOT EXISTS metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

const LAST_SYNC_KEY: &str = "last_successful_sync_at";

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer full: {in_flight}/{capacity} receipts pending or syncing")]
    Full { in_flight: usize, capacity: usize },

    #[error("receipt {id} not found")]
    NotFound { id: String },

    #[error("receipt {id} is {} but {expected} was required", .actual.as_str())]
    InvalidTransition {
        id: String,
        actual: ReceiptStatus,
        expected: &'static str,
    },

    #[error("stored row for {id} is corrupt: {detail}")]
    Corrupt { id: String, detail: String },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// Result of `insert`: either a fresh row or the pre-existing one for a
/// repeated idempotency key (idempotent create, not an error).
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted { fullness: f64 },
    Duplicate { id: String, status: ReceiptStatus },
}

/// What `increment_retry` decided: back to the queue, or out of budget and
/// into the DLQ.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDisposition {
    Requeued { retry_count: i64, next_attempt_at: i64 },
    DeadLettered,
}

/// Handle to the on-disk buffer. Cheap to clone via `Arc`; the connection is
/// serialized behind a mutex, which is plenty for one edge terminal.
pub struct BufferDb {
    conn: Arc<Mutex<Connection>>,
    capacity: usize,
}

impl BufferDb {
    pub fn open(db_path: &str, capacity: usize) -> anyhow::Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .with_context(|| format!("Failed to open buffer database at {db_path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize buffer schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let live: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM receipts WHERE status IN ('pending','syncing')",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        info!(db_path, in_flight = live, capacity, "Receipt buffer opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a new receipt in `pending` state, or return the existing row
    /// for a repeated idempotency key. Fails fast with `BufferError::Full`
    /// when pending + syncing has reached capacity.
    pub fn insert(&self, receipt: &Receipt) -> Result<InsertOutcome, BufferError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some((id, status)) = find_by_key_tx(&tx, &receipt.idempotency_key)? {
            tx.commit()?;
            return Ok(InsertOutcome::Duplicate { id, status });
        }

        let in_flight = in_flight_count(&tx)?;
        if in_flight >= self.capacity {
            // Nothing written; roll back the implicit read transaction.
            return Err(BufferError::Full {
                in_flight,
                capacity: self.capacity,
            });
        }

        tx.execute(
            "INSERT INTO receipts (
                id, pos_id, created_at, hlc_local, hlc_counter, hlc_server,
                receipt_type, original_id, payload_json, idempotency_key,
                status, retry_count, last_error, synced_at, claimed_at, next_attempt_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8, ?9, 'pending', 0, NULL, NULL, NULL, 0)",
            params![
                receipt.id,
                receipt.pos_id,
                receipt.created_at,
                receipt.hlc_local,
                receipt.hlc_counter,
                receipt.receipt_type.as_str(),
                receipt.original_id,
                receipt.payload.to_string(),
                receipt.idempotency_key,
            ],
        )?;

        append_event_tx(
            &tx,
            BufferEventKind::ReceiptAdded,
            Some(&receipt.id),
            Some(serde_json::json!({
                "pos_id": receipt.pos_id,
                "type": receipt.receipt_type.as_str(),
            })),
        )?;

        tx.commit()?;

        let fullness = (in_flight + 1) as f64 / self.capacity.max(1) as f64;
        Ok(InsertOutcome::Inserted { fullness })
    }

    /// Atomically claim up to `limit` pending receipts in HLC order, moving
    /// them to `syncing`.
    ///
    /// Only the due prefix is taken: claiming stops at the first receipt
    /// still inside its retry backoff, and at anything newer than a receipt
    /// already in `syncing`. Delivery order therefore always respects the
    /// HLC order within (and across) terminals, at the cost of head-of-line
    /// blocking while the oldest receipt backs off.
    pub fn claim_pending(&self, limit: usize) -> Result<Vec<Receipt>, BufferError> {
        let now = now_secs();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        // A syncing row is mid-delivery on another path (inline Phase 2 or a
        // previous claim); receipts newer than it must wait their turn.
        let syncing_floor: Option<(i64, i64)> = tx
            .query_row(
                "SELECT hlc_local, hlc_counter FROM receipts
                 WHERE status = 'syncing'
                 ORDER BY hlc_local, hlc_counter LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let candidates: Vec<(String, i64, i64, i64)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, next_attempt_at, hlc_local, hlc_counter FROM receipts
                 WHERE status = 'pending'
                 ORDER BY hlc_local, hlc_counter
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<_, _>>()?;
            rows
        };

        let mut ids = Vec::new();
        for (id, next_attempt_at, local, counter) in candidates {
            if next_attempt_at > now {
                break;
            }
            if let Some(floor) = syncing_floor {
                if (local, counter) > floor {
                    break;
                }
            }
            ids.push(id);
        }

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE receipts SET status = 'syncing', claimed_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
            claimed.push(get_receipt_tx(&tx, id)?.ok_or_else(|| BufferError::NotFound {
                id: id.clone(),
            })?);
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Claim one specific pending receipt (the inline Phase 2 path). Returns
    /// false if the row is not claimable: the sync worker already owns it,
    /// its backoff has not elapsed, or an older receipt is still in flight
    /// (delivering out of order would break per-terminal ordering).
    pub fn claim_one(&self, id: &str) -> Result<bool, BufferError> {
        let now = now_secs();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE receipts SET status = 'syncing', claimed_at = ?2
             WHERE id = ?1 AND status = 'pending' AND next_attempt_at <= ?2
               AND NOT EXISTS (
                   SELECT 1 FROM receipts older
                   WHERE older.status IN ('pending','syncing')
                     AND older.id <> receipts.id
                     AND (older.hlc_local < receipts.hlc_local
                          OR (older.hlc_local = receipts.hlc_local
                              AND older.hlc_counter < receipts.hlc_counter))
               )",
            params![id, now],
        )?;
        Ok(changed == 1)
    }

    /// syncing -> synced. Records the server HLC component and the sync time.
    pub fn mark_synced(&self, id: &str, hlc_server: i64) -> Result<(), BufferError> {
        let now = now_secs();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        expect_status(&tx, id, ReceiptStatus::Syncing, "syncing")?;
        tx.execute(
            "UPDATE receipts
             SET status = 'synced', hlc_server = ?2, synced_at = ?3,
                 claimed_at = NULL, last_error = NULL
             WHERE id = ?1",
            params![id, hlc_server, now],
        )?;
        tx.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_SYNC_KEY, now.to_string()],
        )?;
        append_event_tx(
            &tx,
            BufferEventKind::ReceiptSynced,
            Some(id),
            Some(serde_json::json!({ "hlc_server": hlc_server })),
        )?;

        tx.commit()?;
        Ok(())
    }

    /// syncing -> pending with an incremented retry counter and exponential
    /// backoff (capped at 60s). At `max_retries` the receipt is diverted to
    /// the DLQ instead of requeued.
    pub fn increment_retry(
        &self,
        id: &str,
        error: &str,
        max_retries: u32,
    ) -> Result<RetryDisposition, BufferError> {
        let retry_count = {
            let conn = self.conn.lock();
            let receipt = get_receipt_tx(&conn, id)?.ok_or_else(|| BufferError::NotFound {
                id: id.to_string(),
            })?;
            if receipt.status != ReceiptStatus::Syncing {
                return Err(BufferError::InvalidTransition {
                    id: id.to_string(),
                    actual: receipt.status,
                    expected: "syncing",
                });
            }
            receipt.retry_count + 1
        };

        if retry_count >= max_retries as i64 {
            self.move_to_dlq(id, DlqReason::MaxRetries, error)?;
            return Ok(RetryDisposition::DeadLettered);
        }

        let now = now_secs();
        let backoff = (1i64 << retry_count.min(6)).min(MAX_BACKOFF_SECS);
        let next_attempt_at = now + backoff;

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE receipts
             SET status = 'pending', retry_count = ?2, last_error = ?3,
                 claimed_at = NULL, next_attempt_at = ?4
             WHERE id = ?1 AND status = 'syncing'",
            params![id, retry_count, error, next_attempt_at],
        )?;

        Ok(RetryDisposition::Requeued {
            retry_count,
            next_attempt_at,
        })
    }

    /// syncing -> failed, with the DLQ row inserted in the same transaction.
    pub fn move_to_dlq(
        &self,
        id: &str,
        reason: DlqReason,
        error: &str,
    ) -> Result<(), BufferError> {
        let now = now_secs();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let receipt = get_receipt_tx(&tx, id)?.ok_or_else(|| BufferError::NotFound {
            id: id.to_string(),
        })?;
        if receipt.status != ReceiptStatus::Syncing {
            return Err(BufferError::InvalidTransition {
                id: id.to_string(),
                actual: receipt.status,
                expected: "syncing",
            });
        }

        tx.execute(
            "UPDATE receipts
             SET status = 'failed', last_error = ?2, claimed_at = NULL
             WHERE id = ?1",
            params![id, error],
        )?;
        tx.execute(
            "INSERT INTO dead_letters (
                id, original_receipt_id, failed_at, reason, payload_json,
                retry_attempts, last_error, resolved_at, resolved_by
             ) VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL)",
            params![
                id,
                now,
                reason.as_str(),
                receipt.payload.to_string(),
                receipt.retry_count,
                error,
            ],
        )?;
        append_event_tx(
            &tx,
            BufferEventKind::ReceiptFailed,
            Some(id),
            Some(serde_json::json!({ "reason": reason.as_str(), "error": error })),
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Counts by status plus derived gauges.
    pub fn status(&self) -> Result<BufferStatus, BufferError> {
        let conn = self.conn.lock();

        let mut pending = 0usize;
        let mut syncing = 0usize;
        let mut synced = 0usize;
        let mut failed = 0usize;
        {
            let mut stmt =
                conn.prepare_cached("SELECT status, COUNT(*) FROM receipts GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                match status.as_str() {
                    "pending" => pending = count as usize,
                    "syncing" => syncing = count as usize,
                    "synced" => synced = count as usize,
                    "failed" => failed = count as usize,
                    _ => {}
                }
            }
        }

        let dlq_size: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dead_letters WHERE resolved_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        let last_successful_sync_at: Option<i64> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                [LAST_SYNC_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|v| v.parse().ok());

        let in_flight = pending + syncing;
        Ok(BufferStatus {
            pending,
            syncing,
            synced,
            failed,
            capacity: self.capacity,
            fullness: (in_flight as f64 / self.capacity.max(1) as f64).min(1.0),
            dlq_size: dlq_size as usize,
            last_successful_sync_at,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Receipt>, BufferError> {
        let conn = self.conn.lock();
        get_receipt_tx(&conn, id)
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Receipt>, BufferError> {
        let conn = self.conn.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM receipts WHERE idempotency_key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => get_receipt_tx(&conn, &id),
            None => Ok(None),
        }
    }

    /// Give a claim back untouched: syncing -> pending with no retry charge.
    /// Used when the breaker opens mid-batch and the rest of the claim is
    /// abandoned without an attempt.
    pub fn release_claim(&self, id: &str) -> Result<(), BufferError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE receipts SET status = 'pending', claimed_at = NULL
             WHERE id = ?1 AND status = 'syncing'",
            params![id],
        )?;
        Ok(())
    }

    /// Revert `syncing` rows claimed at or before `cutoff_secs` back to
    /// `pending`. Run at worker startup; handles crashes mid-cycle.
    pub fn revert_stale_syncing(&self, cutoff_secs: i64) -> Result<usize, BufferError> {
        let conn = self.conn.lock();
        let reverted = conn.execute(
            "UPDATE receipts
             SET status = 'pending', claimed_at = NULL
             WHERE status = 'syncing' AND claimed_at IS NOT NULL AND claimed_at <= ?1",
            params![cutoff_secs],
        )?;
        if reverted > 0 {
            warn!(reverted, "Reverted stale syncing receipts to pending");
        }
        Ok(reverted)
    }

    /// Append a lifecycle event outside any receipt mutation (breaker
    /// transitions, sync cycle markers).
    pub fn append_event(
        &self,
        kind: BufferEventKind,
        receipt_id: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<(), BufferError> {
        let conn = self.conn.lock();
        append_event_tx(&conn, kind, receipt_id, metadata)
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<BufferEvent>, BufferError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT seq, event_type, receipt_id, at, metadata_json
             FROM buffer_events ORDER BY seq DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map([limit as i64], |row| {
                let kind_str: String = row.get(1)?;
                let metadata_json: Option<String> = row.get(4)?;
                Ok(BufferEvent {
                    seq: row.get(0)?,
                    kind: BufferEventKind::from_str(&kind_str)
                        .unwrap_or(BufferEventKind::ReceiptAdded),
                    receipt_id: row.get(2)?,
                    at: row.get(3)?,
                    metadata: metadata_json.and_then(|m| serde_json::from_str(&m).ok()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn list_dlq(&self, unresolved_only: bool, limit: usize) -> Result<Vec<DlqEntry>, BufferError> {
        let conn = self.conn.lock();
        let sql = if unresolved_only {
            "SELECT id, original_receipt_id, failed_at, reason, payload_json,
                    retry_attempts, last_error, resolved_at, resolved_by
             FROM dead_letters WHERE resolved_at IS NULL
             ORDER BY failed_at DESC LIMIT ?1"
        } else {
            "SELECT id, original_receipt_id, failed_at, reason, payload_json,
                    retry_attempts, last_error, resolved_at, resolved_by
             FROM dead_letters ORDER BY failed_at DESC LIMIT ?1"
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let entries = stmt
            .query_map([limit as i64], row_to_dlq_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Operator acknowledgement. No replay: a resolved entry stays resolved.
    pub fn resolve_dlq(&self, id: &str, resolved_by: &str) -> Result<bool, BufferError> {
        let now = now_secs();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE dead_letters SET resolved_at = ?2, resolved_by = ?3
             WHERE id = ?1 AND resolved_at IS NULL",
            params![id, now, resolved_by],
        )?;
        Ok(changed == 1)
    }

    /// Remove synced receipts older than `cutoff_secs`. Never touches a row
    /// that has not reached `synced`; the refund rule depends on that.
    pub fn archive_synced_before(&self, cutoff_secs: i64) -> Result<usize, BufferError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM receipts
             WHERE status = 'synced' AND synced_at IS NOT NULL AND synced_at <= ?1
               AND id NOT IN (SELECT original_receipt_id FROM dead_letters)",
            params![cutoff_secs],
        )?;
        Ok(deleted)
    }

    pub fn prune_events_before(&self, cutoff_secs: i64) -> Result<usize, BufferError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM buffer_events WHERE at <= ?1",
            params![cutoff_secs],
        )?;
        Ok(deleted)
    }

    /// Cheap readiness probe: one read, no writes.
    pub fn ping(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

fn in_flight_count(conn: &Connection) -> Result<usize, BufferError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM receipts WHERE status IN ('pending','syncing')",
        [],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn find_by_key_tx(
    conn: &Connection,
    key: &str,
) -> Result<Option<(String, ReceiptStatus)>, BufferError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, status FROM receipts WHERE idempotency_key = ?1",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((id, status)) => {
            let status = ReceiptStatus::from_str(&status).ok_or_else(|| BufferError::Corrupt {
                id: id.clone(),
                detail: format!("unknown status {status}"),
            })?;
            Ok(Some((id, status)))
        }
        None => Ok(None),
    }
}

fn expect_status(
    conn: &Connection,
    id: &str,
    expected: ReceiptStatus,
    expected_name: &'static str,
) -> Result<(), BufferError> {
    let receipt = get_receipt_tx(conn, id)?.ok_or_else(|| BufferError::NotFound {
        id: id.to_string(),
    })?;
    if receipt.status != expected {
        return Err(BufferError::InvalidTransition {
            id: id.to_string(),
            actual: receipt.status,
            expected: expected_name,
        });
    }
    Ok(())
}

fn get_receipt_tx(conn: &Connection, id: &str) -> Result<Option<Receipt>, BufferError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, pos_id, created_at, hlc_local, hlc_counter, hlc_server,
                receipt_type, original_id, payload_json, idempotency_key,
                status, retry_count, last_error, synced_at
         FROM receipts WHERE id = ?1",
    )?;
    let receipt = stmt.query_row([id], row_to_receipt).optional()?;
    match receipt {
        Some(Ok(r)) => Ok(Some(r)),
        Some(Err(detail)) => Err(BufferError::Corrupt {
            id: id.to_string(),
            detail,
        }),
        None => Ok(None),
    }
}

type DecodedReceipt = Result<Receipt, String>;

fn row_to_receipt(row: &Row) -> rusqlite::Result<DecodedReceipt> {
    let type_str: String = row.get(6)?;
    let payload_json: String = row.get(8)?;
    let status_str: String = row.get(10)?;

    let receipt_type = match ReceiptType::from_str(&type_str) {
        Some(t) => t,
        None => return Ok(Err(format!("unknown receipt type {type_str}"))),
    };
    let status = match ReceiptStatus::from_str(&status_str) {
        Some(s) => s,
        None => return Ok(Err(format!("unknown status {status_str}"))),
    };
    let payload: Value = match serde_json::from_str(&payload_json) {
        Ok(p) => p,
        Err(e) => return Ok(Err(format!("payload not JSON: {e}"))),
    };

    Ok(Ok(Receipt {
        id: row.get(0)?,
        pos_id: row.get(1)?,
        created_at: row.get(2)?,
        hlc_local: row.get(3)?,
        hlc_counter: row.get(4)?,
        hlc_server: row.get(5)?,
        receipt_type,
        original_id: row.get(7)?,
        payload,
        idempotency_key: row.get(9)?,
        status,
        retry_count: row.get(11)?,
        last_error: row.get(12)?,
        synced_at: row.get(13)?,
    }))
}

fn row_to_dlq_entry(row: &Row) -> rusqlite::Result<DlqEntry> {
    let reason_str: String = row.get(3)?;
    let payload_json: String = row.get(4)?;
    Ok(DlqEntry {
        id: row.get(0)?,
        original_receipt_id: row.get(1)?,
        failed_at: row.get(2)?,
        reason: DlqReason::from_str(&reason_str).unwrap_or(DlqReason::PermanentReject),
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        retry_attempts: row.get(5)?,
        last_error: row.get(6)?,
        resolved_at: row.get(7)?,
        resolved_by: row.get(8)?,
    })
}

fn append_event_tx(
    conn: &Connection,
    kind: BufferEventKind,
    receipt_id: Option<&str>,
    metadata: Option<Value>,
) -> Result<(), BufferError> {
    conn.execute(
        "INSERT INTO buffer_events (event_type, receipt_id, at, metadata_json)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            kind.as_str(),
            receipt_id,
            now_secs(),
            metadata.map(|m| m.to_string()),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::HybridLogicalClock;
    use tempfile::NamedTempFile;

    fn open_buffer(capacity: usize) -> (BufferDb, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let db = BufferDb::open(temp.path().to_str().unwrap(), capacity).unwrap();
        (db, temp)
    }

    fn receipt(id: &str, key: &str, hlc: &HybridLogicalClock) -> Receipt {
        let stamp = hlc.now();
        Receipt {
            id: id.to_string(),
            pos_id: "POS-001".to_string(),
            created_at: now_secs(),
            hlc_local: stamp.local,
            hlc_counter: stamp.counter,
            hlc_server: None,
            receipt_type: ReceiptType::Sale,
            original_id: None,
            payload: serde_json::json!({ "total": 1000 }),
            idempotency_key: key.to_string(),
            status: ReceiptStatus::Pending,
            retry_count: 0,
            last_error: None,
            synced_at: None,
        }
    }

    #[test]
    fn test_insert_then_get_roundtrip() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        let r = receipt("r1", "k1", &hlc);

        assert!(matches!(
            db.insert(&r).unwrap(),
            InsertOutcome::Inserted { .. }
        ));

        let stored = db.get("r1").unwrap().unwrap();
        assert_eq!(stored.status, ReceiptStatus::Pending);
        assert_eq!(stored.payload, serde_json::json!({ "total": 1000 }));
        assert_eq!(stored.idempotency_key, "k1");
    }

    #[test]
    fn test_duplicate_key_returns_existing_id() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();

        // Same key, different payload and id: original row wins.
        let mut other = receipt("r2", "k1", &hlc);
        other.payload = serde_json::json!({ "total": 9999 });
        match db.insert(&other).unwrap() {
            InsertOutcome::Duplicate { id, status } => {
                assert_eq!(id, "r1");
                assert_eq!(status, ReceiptStatus::Pending);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }

        assert!(db.get("r2").unwrap().is_none());
        let stored = db.get("r1").unwrap().unwrap();
        assert_eq!(stored.payload, serde_json::json!({ "total": 1000 }));
    }

    #[test]
    fn test_capacity_boundary() {
        // Exactly capacity succeeds; one more fails fast.
        let (db, _t) = open_buffer(3);
        let hlc = HybridLogicalClock::new();
        for i in 0..3 {
            db.insert(&receipt(&format!("r{i}"), &format!("k{i}"), &hlc))
                .unwrap();
        }

        let err = db.insert(&receipt("r3", "k3", &hlc)).unwrap_err();
        match err {
            BufferError::Full { in_flight, capacity } => {
                assert_eq!(in_flight, 3);
                assert_eq!(capacity, 3);
            }
            other => panic!("expected Full, got {other:?}"),
        }

        // A repeated key is still answered while full (idempotent create).
        assert!(matches!(
            db.insert(&receipt("rX", "k0", &hlc)).unwrap(),
            InsertOutcome::Duplicate { .. }
        ));
    }

    #[test]
    fn test_claim_respects_hlc_order() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        for i in 0..5 {
            db.insert(&receipt(&format!("r{i}"), &format!("k{i}"), &hlc))
                .unwrap();
        }

        let claimed = db.claim_pending(3).unwrap();
        let ids: Vec<&str> = claimed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r0", "r1", "r2"]);
        for r in &claimed {
            assert_eq!(r.status, ReceiptStatus::Syncing);
        }

        // Younger rows wait while the first batch is mid-delivery.
        assert!(db.claim_pending(10).unwrap().is_empty());

        for r in &claimed {
            db.mark_synced(&r.id, 1).unwrap();
        }
        let rest = db.claim_pending(10).unwrap();
        let ids: Vec<&str> = rest.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r3", "r4"]);
    }

    #[test]
    fn test_mark_synced_sets_server_fields() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();
        db.claim_pending(1).unwrap();

        db.mark_synced("r1", 777).unwrap();
        let stored = db.get("r1").unwrap().unwrap();
        assert_eq!(stored.status, ReceiptStatus::Synced);
        assert_eq!(stored.hlc_server, Some(777));
        assert!(stored.synced_at.is_some());

        let status = db.status().unwrap();
        assert!(status.last_successful_sync_at.is_some());
    }

    #[test]
    fn test_mark_synced_requires_claim() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();

        let err = db.mark_synced("r1", 777).unwrap_err();
        assert!(matches!(err, BufferError::InvalidTransition { .. }));
    }

    #[test]
    fn test_retry_requeues_with_backoff() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();
        db.claim_pending(1).unwrap();

        match db.increment_retry("r1", "connect timeout", 20).unwrap() {
            RetryDisposition::Requeued {
                retry_count,
                next_attempt_at,
            } => {
                assert_eq!(retry_count, 1);
                assert!(next_attempt_at > now_secs());
            }
            other => panic!("expected requeue, got {other:?}"),
        }

        let stored = db.get("r1").unwrap().unwrap();
        assert_eq!(stored.status, ReceiptStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("connect timeout"));

        // Backoff deadline keeps it out of the next claim.
        assert!(db.claim_pending(10).unwrap().is_empty());
    }

    #[test]
    fn test_backoff_head_blocks_younger_receipts() {
        // The oldest receipt backing off holds up the ones behind it, so
        // server-confirmed order can never invert submission order.
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r0", "k0", &hlc)).unwrap();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();

        db.claim_pending(1).unwrap();
        db.increment_retry("r0", "down", 20).unwrap();

        assert!(db.claim_pending(10).unwrap().is_empty());
    }

    #[test]
    fn test_claim_one_only_takes_the_head() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r0", "k0", &hlc)).unwrap();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();

        assert!(!db.claim_one("r1").unwrap(), "r0 is older and still pending");
        assert!(db.claim_one("r0").unwrap());
        assert!(!db.claim_one("r1").unwrap(), "r0 is older and mid-delivery");

        db.mark_synced("r0", 1).unwrap();
        assert!(db.claim_one("r1").unwrap());
    }

    #[test]
    fn test_max_retries_diverts_to_dlq() {
        // The final allowed failure dead-letters instead of requeueing.
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();
        db.claim_pending(1).unwrap();

        // retry_count is already max - 1: next failure exhausts the budget.
        {
            let conn = db.conn.lock();
            conn.execute("UPDATE receipts SET retry_count = 19 WHERE id = 'r1'", [])
                .unwrap();
        }

        assert_eq!(
            db.increment_retry("r1", "still down", 20).unwrap(),
            RetryDisposition::DeadLettered
        );

        let stored = db.get("r1").unwrap().unwrap();
        assert_eq!(stored.status, ReceiptStatus::Failed);

        let dlq = db.list_dlq(true, 10).unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].reason, DlqReason::MaxRetries);
        assert_eq!(dlq[0].retry_attempts, 19);
    }

    #[test]
    fn test_move_to_dlq_is_atomic_and_frees_capacity() {
        let (db, _t) = open_buffer(2);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();
        db.insert(&receipt("r2", "k2", &hlc)).unwrap();
        db.claim_pending(1).unwrap();

        db.move_to_dlq("r1", DlqReason::PermanentReject, "400 bad document")
            .unwrap();

        // failed rows no longer count against capacity.
        assert!(matches!(
            db.insert(&receipt("r3", "k3", &hlc)).unwrap(),
            InsertOutcome::Inserted { .. }
        ));

        let status = db.status().unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.dlq_size, 1);
    }

    #[test]
    fn test_duplicate_key_shadowed_by_dlq_row() {
        // A key whose receipt dead-lettered still refuses a new insert.
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();
        db.claim_pending(1).unwrap();
        db.move_to_dlq("r1", DlqReason::PermanentReject, "rejected")
            .unwrap();

        match db.insert(&receipt("r2", "k1", &hlc)).unwrap() {
            InsertOutcome::Duplicate { id, status } => {
                assert_eq!(id, "r1");
                assert_eq!(status, ReceiptStatus::Failed);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[test]
    fn test_release_claim_does_not_charge_retry() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();
        db.claim_pending(1).unwrap();

        db.release_claim("r1").unwrap();
        let stored = db.get("r1").unwrap().unwrap();
        assert_eq!(stored.status, ReceiptStatus::Pending);
        assert_eq!(stored.retry_count, 0);

        // Immediately claimable again (no backoff applied).
        assert_eq!(db.claim_pending(10).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_syncing_reverts() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();
        db.insert(&receipt("r2", "k2", &hlc)).unwrap();
        db.claim_pending(2).unwrap();

        // Cutoff in the future covers both claims; both revert.
        let reverted = db.revert_stale_syncing(now_secs() + 10).unwrap();
        assert_eq!(reverted, 2);
        let status = db.status().unwrap();
        assert_eq!(status.pending, 2);
        assert_eq!(status.syncing, 0);

        // Reverted rows are claimable again.
        assert_eq!(db.claim_pending(10).unwrap().len(), 2);
    }

    #[test]
    fn test_events_logged_with_mutations() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();
        db.claim_pending(1).unwrap();
        db.mark_synced("r1", 1).unwrap();
        db.append_event(BufferEventKind::SyncCompleted, None, None)
            .unwrap();

        let events = db.recent_events(10).unwrap();
        let kinds: Vec<BufferEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [
                BufferEventKind::SyncCompleted,
                BufferEventKind::ReceiptSynced,
                BufferEventKind::ReceiptAdded,
            ]
        );
    }

    #[test]
    fn test_archive_never_touches_unsynced() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("gone-synced", "k2", &hlc)).unwrap();
        assert!(db.claim_one("gone-synced").unwrap());
        db.mark_synced("gone-synced", 1).unwrap();
        db.insert(&receipt("keep-pending", "k1", &hlc)).unwrap();

        let archived = db.archive_synced_before(now_secs() + 10).unwrap();
        assert_eq!(archived, 1);
        assert!(db.get("gone-synced").unwrap().is_none());
        assert!(db.get("keep-pending").unwrap().is_some());
    }

    #[test]
    fn test_resolve_dlq_once() {
        let (db, _t) = open_buffer(10);
        let hlc = HybridLogicalClock::new();
        db.insert(&receipt("r1", "k1", &hlc)).unwrap();
        db.claim_pending(1).unwrap();
        db.move_to_dlq("r1", DlqReason::SchemaInvalid, "missing total")
            .unwrap();

        assert!(db.resolve_dlq("r1", "operator-7").unwrap());
        assert!(!db.resolve_dlq("r1", "operator-8").unwrap());

        assert!(db.list_dlq(true, 10).unwrap().is_empty());
        let all = db.list_dlq(false, 10).unwrap();
        assert_eq!(all[0].resolved_by.as_deref(), Some("operator-7"));
    }

    #[test]
    fn test_reopen_preserves_rows() {
        // Rows survive a process restart.
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap().to_string();
        {
            let db = BufferDb::open(&path, 10).unwrap();
            let hlc = HybridLogicalClock::new();
            db.insert(&receipt("r1", "k1", &hlc)).unwrap();
        }

        let db = BufferDb::open(&path, 10).unwrap();
        let stored = db.get("r1").unwrap().unwrap();
        assert_eq!(stored.status, ReceiptStatus::Pending);
    }
}
