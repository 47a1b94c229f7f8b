//! Immutable checkpoints of instance state.
//!
//! A checkpoint is a `Checkpoint` record in the instance log holding a full
//! `InstanceState` snapshot. Restoring appends a `Rollback` record; every
//! checkpoint taken after the restored one stays in the log, marked
//! superseded in the history.

use crate::error::{Result, WorkflowError};
use crate::instance::{InstanceState, WorkflowInstance};
use crate::store::{InstanceLog, LogEntry, LogRecord};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    PhaseComplete,
    OnDemand,
    Override,
}

impl fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckpointReason::PhaseComplete => "phase_complete",
            CheckpointReason::OnDemand => "on_demand",
            CheckpointReason::Override => "override",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub instance_id: Uuid,
    /// Current phase at the time of the snapshot.
    pub phase: String,
    pub reason: CheckpointReason,
    /// Previous checkpoint on the active branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Uuid>,
    pub snapshot: InstanceState,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct HistoryItem<'a> {
    /// Log sequence number of the checkpoint record.
    pub seq: u64,
    pub checkpoint: &'a Checkpoint,
    /// Taken after a checkpoint that was later restored.
    pub superseded: bool,
}

/// Every checkpoint of an instance, including superseded ones, in creation
/// order. Iteration is lazy and may be restarted any number of times.
#[derive(Debug, Clone)]
pub struct CheckpointHistory {
    entries: Vec<LogEntry>,
    active: HashSet<Uuid>,
}

impl CheckpointHistory {
    fn from_entries(entries: Vec<LogEntry>) -> Self {
        let mut branch: Vec<Uuid> = Vec::new();
        for entry in &entries {
            match &entry.record {
                LogRecord::Checkpoint(cp) => branch.push(cp.id),
                LogRecord::Rollback { checkpoint_id } => {
                    if let Some(pos) = branch.iter().position(|id| id == checkpoint_id) {
                        branch.truncate(pos + 1);
                    }
                }
                _ => {}
            }
        }
        Self {
            entries,
            active: branch.into_iter().collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = HistoryItem<'_>> + '_ {
        self.entries.iter().filter_map(|entry| match &entry.record {
            LogRecord::Checkpoint(cp) => Some(HistoryItem {
                seq: entry.seq,
                checkpoint: cp,
                superseded: !self.active.contains(&cp.id),
            }),
            _ => None,
        })
    }

    /// Latest checkpoint on the active branch.
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.iter()
            .filter(|item| !item.superseded)
            .last()
            .map(|item| item.checkpoint)
    }

    pub fn find(&self, id: Uuid) -> Option<&Checkpoint> {
        self.iter()
            .map(|item| item.checkpoint)
            .find(|cp| cp.id == id)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CheckpointStore {
    log: Arc<dyn InstanceLog>,
}

impl CheckpointStore {
    pub fn new(log: Arc<dyn InstanceLog>) -> Self {
        Self { log }
    }

    /// Persist a snapshot as a new checkpoint.
    pub fn save(
        &self,
        instance_id: Uuid,
        snapshot: &InstanceState,
        reason: CheckpointReason,
    ) -> Result<Checkpoint> {
        self.save_with(instance_id, snapshot, reason, Vec::new())
    }

    /// Persist a checkpoint together with the records that produced its
    /// snapshot, in one atomic batch: if the checkpoint cannot be stored,
    /// neither can they.
    pub fn save_with(
        &self,
        instance_id: Uuid,
        snapshot: &InstanceState,
        reason: CheckpointReason,
        mut preceding: Vec<LogRecord>,
    ) -> Result<Checkpoint> {
        let entries = self.log.entries(instance_id)?;
        let previous = entries
            .iter()
            .filter_map(|e| match &e.record {
                LogRecord::Checkpoint(cp) => Some(cp.created_at),
                _ => None,
            })
            .max();
        // Strictly increasing even when the clock stalls or steps back.
        let now = Utc::now();
        let created_at = match previous {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };

        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            instance_id,
            phase: snapshot.current_phase.clone(),
            reason,
            parent: snapshot.checkpoints.last().copied(),
            snapshot: snapshot.clone(),
            created_at,
        };
        preceding.push(LogRecord::Checkpoint(checkpoint.clone()));
        self.log.append(instance_id, preceding)?;
        tracing::debug!(
            instance = %instance_id,
            checkpoint = %checkpoint.id,
            phase = %checkpoint.phase,
            reason = %reason,
            "checkpoint saved"
        );
        Ok(checkpoint)
    }

    pub fn latest(&self, instance_id: Uuid) -> Result<Option<Checkpoint>> {
        Ok(self.list_all(instance_id)?.latest().cloned())
    }

    pub fn list_all(&self, instance_id: Uuid) -> Result<CheckpointHistory> {
        Ok(CheckpointHistory::from_entries(
            self.log.entries(instance_id)?,
        ))
    }

    /// Make `checkpoint_id` the instance's state again.
    ///
    /// Returns the instance exactly as it was when the checkpoint was taken.
    /// Superseded checkpoints may be restored too.
    pub fn restore(&self, instance_id: Uuid, checkpoint_id: Uuid) -> Result<WorkflowInstance> {
        let entries = self.log.entries(instance_id)?;
        let history = CheckpointHistory::from_entries(entries);
        let checkpoint = history
            .find(checkpoint_id)
            .cloned()
            .ok_or_else(|| WorkflowError::CheckpointNotFound {
                instance: instance_id,
                checkpoint: checkpoint_id.to_string(),
            })?;

        let mut instance = WorkflowInstance::replay(&history.entries)?;
        let appended = self
            .log
            .append(instance_id, vec![LogRecord::Rollback { checkpoint_id }])?;
        instance.apply(&LogRecord::Checkpoint(checkpoint));
        instance.last_seq = appended.last().map_or(instance.last_seq, |e| e.seq);
        tracing::info!(instance = %instance_id, checkpoint = %checkpoint_id, "rolled back");
        Ok(instance)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InstanceHeader, MemoryLog};
    use crate::template::{SourceFormat, WorkflowTemplate};
    use crate::types::PhaseStatus;

    fn setup() -> (CheckpointStore, WorkflowInstance) {
        let template = WorkflowTemplate::parse(
            "id: two\nphases:\n  - name: first\n  - name: second\n",
            SourceFormat::Yaml,
        )
        .unwrap();
        let log: Arc<dyn InstanceLog> = Arc::new(MemoryLog::new());
        let header = InstanceHeader {
            id: Uuid::new_v4(),
            template_id: template.id.clone(),
            created_at: Utc::now(),
        };
        let entry = log.create(&header, &template).unwrap();
        let instance = WorkflowInstance::replay(&[entry]).unwrap();
        (CheckpointStore::new(log), instance)
    }

    #[test]
    fn saved_checkpoint_restores_identical_state() {
        let (store, mut instance) = setup();
        instance.apply(&LogRecord::PhaseStatus {
            phase: "first".to_string(),
            status: PhaseStatus::InProgress,
        });
        let cp = store
            .save(instance.id, &instance.state, CheckpointReason::OnDemand)
            .unwrap();

        let restored = store.restore(instance.id, cp.id).unwrap();
        assert_eq!(restored.state.phases, instance.state.phases);
        assert_eq!(restored.state.current_phase, "first");
        assert_eq!(restored.state.checkpoints, [cp.id]);
    }

    #[test]
    fn created_at_is_strictly_increasing() {
        let (store, instance) = setup();
        let mut last = None;
        for _ in 0..5 {
            let cp = store
                .save(instance.id, &instance.state, CheckpointReason::OnDemand)
                .unwrap();
            if let Some(prev) = last {
                assert!(cp.created_at > prev);
            }
            last = Some(cp.created_at);
        }
    }

    #[test]
    fn restore_marks_later_checkpoints_superseded() {
        let (store, instance) = setup();
        let c1 = store
            .save(instance.id, &instance.state, CheckpointReason::OnDemand)
            .unwrap();
        let mut state = instance.state.clone();
        state.checkpoints.push(c1.id);
        let c2 = store
            .save(instance.id, &state, CheckpointReason::OnDemand)
            .unwrap();
        assert_eq!(c2.parent, Some(c1.id));

        store.restore(instance.id, c1.id).unwrap();

        let history = store.list_all(instance.id).unwrap();
        let flags: Vec<(Uuid, bool)> = history
            .iter()
            .map(|item| (item.checkpoint.id, item.superseded))
            .collect();
        assert_eq!(flags, [(c1.id, false), (c2.id, true)]);
        assert_eq!(store.latest(instance.id).unwrap().unwrap().id, c1.id);
        // Restartable iteration.
        assert_eq!(history.iter().count(), history.len());
    }

    #[test]
    fn restore_of_unknown_checkpoint_fails() {
        let (store, instance) = setup();
        let err = store.restore(instance.id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, WorkflowError::CheckpointNotFound { .. }));
    }
}
