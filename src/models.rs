//! Core persisted entities: receipts, dead letters, and the buffer event log.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fiscal document kind. Refunds and corrections compensate an earlier
/// receipt and carry its id in `original_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptType {
    Sale,
    Refund,
    Correction,
}

impl ReceiptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptType::Sale => "sale",
            ReceiptType::Refund => "refund",
            ReceiptType::Correction => "correction",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sale" => Some(ReceiptType::Sale),
            "refund" => Some(ReceiptType::Refund),
            "correction" => Some(ReceiptType::Correction),
            _ => None,
        }
    }

    /// Compensating documents must name their antecedent.
    pub fn requires_original(&self) -> bool {
        matches!(self, ReceiptType::Refund | ReceiptType::Correction)
    }
}

/// Receipt lifecycle. Transitions form a DAG:
/// pending -> syncing -> {pending, synced, failed}; synced and failed are
/// terminal in the receipts table (failed rows are mirrored into the DLQ).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Syncing => "syncing",
            ReceiptStatus::Synced => "synced",
            ReceiptStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReceiptStatus::Pending),
            "syncing" => Some(ReceiptStatus::Syncing),
            "synced" => Some(ReceiptStatus::Synced),
            "failed" => Some(ReceiptStatus::Failed),
            _ => None,
        }
    }
}

/// The central entity: one fiscal document captured at Phase 1 and owed to
/// the OFD until it reaches `synced` (or dead-letters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub pos_id: String,
    /// Wall-clock seconds at Phase 1. Informational only; ordering uses HLC.
    pub created_at: i64,
    pub hlc_local: i64,
    pub hlc_counter: i64,
    /// Assigned by the OFD acknowledgement; None until synced.
    pub hlc_server: Option<i64>,
    pub receipt_type: ReceiptType,
    pub original_id: Option<String>,
    /// Opaque fiscal document, byte-preserving. Schema owned by the POS.
    pub payload: Value,
    pub idempotency_key: String,
    pub status: ReceiptStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub synced_at: Option<i64>,
}

impl Receipt {
    /// Ordering key within a `pos_id`: server-confirmed receipts dominate,
    /// pending ones stay sortable by local origin.
    pub fn sort_key(&self) -> (i64, i64, i64) {
        (
            self.hlc_server.unwrap_or(i64::MAX),
            self.hlc_local,
            self.hlc_counter,
        )
    }
}

/// Why a receipt was diverted to the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MaxRetries,
    PermanentReject,
    SchemaInvalid,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqReason::MaxRetries => "max_retries",
            DlqReason::PermanentReject => "permanent_reject",
            DlqReason::SchemaInvalid => "schema_invalid",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "max_retries" => Some(DlqReason::MaxRetries),
            "permanent_reject" => Some(DlqReason::PermanentReject),
            "schema_invalid" => Some(DlqReason::SchemaInvalid),
            _ => None,
        }
    }
}

/// Operator-facing view of a receipt that exhausted its retry budget or was
/// permanently rejected. The original row stays in the receipts table in
/// `failed` state for audit; this entry is the authoritative one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub original_receipt_id: String,
    pub failed_at: i64,
    pub reason: DlqReason,
    pub payload: Value,
    pub retry_attempts: i64,
    pub last_error: Option<String>,
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
}

/// Closed set of lifecycle events recorded in the append-only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferEventKind {
    ReceiptAdded,
    ReceiptSynced,
    ReceiptFailed,
    CircuitOpened,
    CircuitClosed,
    SyncStarted,
    SyncCompleted,
}

impl BufferEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferEventKind::ReceiptAdded => "receipt_added",
            BufferEventKind::ReceiptSynced => "receipt_synced",
            BufferEventKind::ReceiptFailed => "receipt_failed",
            BufferEventKind::CircuitOpened => "circuit_opened",
            BufferEventKind::CircuitClosed => "circuit_closed",
            BufferEventKind::SyncStarted => "sync_started",
            BufferEventKind::SyncCompleted => "sync_completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "receipt_added" => Some(BufferEventKind::ReceiptAdded),
            "receipt_synced" => Some(BufferEventKind::ReceiptSynced),
            "receipt_failed" => Some(BufferEventKind::ReceiptFailed),
            "circuit_opened" => Some(BufferEventKind::CircuitOpened),
            "circuit_closed" => Some(BufferEventKind::CircuitClosed),
            "sync_started" => Some(BufferEventKind::SyncStarted),
            "sync_completed" => Some(BufferEventKind::SyncCompleted),
            _ => None,
        }
    }
}

/// One row of the append-only lifecycle log.
#[derive(Debug, Clone, Serialize)]
pub struct BufferEvent {
    pub seq: i64,
    pub kind: BufferEventKind,
    pub receipt_id: Option<String>,
    pub at: i64,
    pub metadata: Option<Value>,
}

/// Counts and gauges reported by `GET /v1/kkt/buffer/status`.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
    pub capacity: usize,
    /// (pending + syncing) / capacity, clamped to [0, 1].
    pub fullness: f64,
    pub dlq_size: usize,
    pub last_successful_sync_at: Option<i64>,
}

impl BufferStatus {
    pub fn in_flight(&self) -> usize {
        self.pending + self.syncing
    }
}

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}
