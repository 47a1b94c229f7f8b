//! Append-only instance log.
//!
//! Everything that happens to an instance is a `LogRecord`. Records are
//! appended in batches; a batch is atomic and receives consecutive sequence
//! numbers. The log is never rewritten: rollback appends a `Rollback` record
//! and leaves the superseded branch in place for audit.

pub mod memory;
pub mod redb_log;

use crate::checkpoint::Checkpoint;
use crate::dispatch::ActionInvocation;
use crate::error::Result;
use crate::gate::GateResult;
use crate::template::WorkflowTemplate;
use crate::types::{Lifecycle, PhaseStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use self::memory::MemoryLog;
pub use self::redb_log::RedbLog;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    /// First record of every instance; carries the template snapshot.
    Started { template: WorkflowTemplate },
    PhaseStatus { phase: String, status: PhaseStatus },
    GateResult(GateResult),
    /// Optional gate left unsatisfied when its phase completed.
    GateSkipped { phase: String, gate_id: String },
    Invocation(ActionInvocation),
    Checkpoint(Checkpoint),
    PhaseAdvanced { from: String, to: String },
    Override {
        from: String,
        to: String,
        actor: String,
        reason: String,
    },
    Rollback { checkpoint_id: Uuid },
    Closed {
        lifecycle: Lifecycle,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl LogRecord {
    /// Short label used in logs and audit output.
    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::Started { .. } => "started",
            LogRecord::PhaseStatus { .. } => "phase_status",
            LogRecord::GateResult(_) => "gate_result",
            LogRecord::GateSkipped { .. } => "gate_skipped",
            LogRecord::Invocation(_) => "invocation",
            LogRecord::Checkpoint(_) => "checkpoint",
            LogRecord::PhaseAdvanced { .. } => "phase_advanced",
            LogRecord::Override { .. } => "override",
            LogRecord::Rollback { .. } => "rollback",
            LogRecord::Closed { .. } => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Per-instance sequence number, starting at 1.
    pub seq: u64,
    pub instance_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub record: LogRecord,
}

/// Index row kept per instance for listing without reading whole logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHeader {
    pub id: Uuid,
    pub template_id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// InstanceLog
// ---------------------------------------------------------------------------

/// Durable, append-only storage for instance logs.
pub trait InstanceLog: Send + Sync {
    /// Register a new instance and write its `Started` record (seq 1).
    fn create(&self, header: &InstanceHeader, template: &WorkflowTemplate) -> Result<LogEntry>;

    /// Append a batch of records atomically. Either every record is stored
    /// or none is. Fails with `InstanceNotFound` for unknown instances.
    fn append(&self, instance: Uuid, records: Vec<LogRecord>) -> Result<Vec<LogEntry>>;

    /// Every entry of an instance, in sequence order.
    fn entries(&self, instance: Uuid) -> Result<Vec<LogEntry>>;

    /// All known instances, oldest first.
    fn instances(&self) -> Result<Vec<InstanceHeader>>;

    /// Ids of all known instances, in no particular order.
    fn ids(&self) -> Result<Vec<Uuid>> {
        Ok(self.instances()?.into_iter().map(|h| h.id).collect())
    }
}

pub(crate) fn stamp(instance: Uuid, first_seq: u64, records: Vec<LogRecord>) -> Vec<LogEntry> {
    let now = Utc::now();
    records
        .into_iter()
        .zip(first_seq..)
        .map(|(record, seq)| LogEntry {
            seq,
            instance_id: instance,
            recorded_at: now,
            record,
        })
        .collect()
}
