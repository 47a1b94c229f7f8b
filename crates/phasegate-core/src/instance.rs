//! Workflow instances and log replay.
//!
//! An instance never stores itself: every change is a `LogRecord` appended to
//! the instance log, and the current instance is rebuilt by replaying the log
//! from the latest checkpoint (or rollback) onward. `apply` is the single
//! place a record changes state, used both live and during replay.

use crate::dispatch::ActionInvocation;
use crate::error::{Result, TemplateError, WorkflowError};
use crate::gate::GateResults;
use crate::store::{LogEntry, LogRecord};
use crate::template::{PhaseDefinition, WorkflowTemplate};
use crate::types::{Lifecycle, PhaseStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PhaseProgress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub name: String,
    pub status: PhaseStatus,
    /// Completed by administrative override rather than by its gates.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub overridden: bool,
}

// ---------------------------------------------------------------------------
// InstanceState
// ---------------------------------------------------------------------------

/// The part of an instance captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub current_phase: String,
    /// Every phase of the template, in template order.
    pub phases: Vec<PhaseProgress>,
    /// Current gate result per phase, per gate id.
    #[serde(default)]
    pub gate_results: BTreeMap<String, GateResults>,
    /// Optional gates left unsatisfied when their phase completed.
    #[serde(default)]
    pub skipped: BTreeMap<String, BTreeSet<String>>,
    /// Checkpoint ids on the active branch, oldest first.
    #[serde(default)]
    pub checkpoints: Vec<Uuid>,
    #[serde(default)]
    pub invocations: Vec<ActionInvocation>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

impl InstanceState {
    pub fn initial(template: &WorkflowTemplate) -> Result<Self> {
        let entry = template.entry_phase().ok_or_else(|| {
            TemplateError::MalformedDefinition(format!(
                "template '{}' declares no phases",
                template.id
            ))
        })?;
        Ok(Self {
            current_phase: entry.name.clone(),
            phases: template
                .phases
                .iter()
                .map(|p| PhaseProgress {
                    name: p.name.clone(),
                    status: PhaseStatus::NotStarted,
                    overridden: false,
                })
                .collect(),
            gate_results: BTreeMap::new(),
            skipped: BTreeMap::new(),
            checkpoints: Vec::new(),
            invocations: Vec::new(),
            lifecycle: Lifecycle::Active,
        })
    }

    pub fn status_of(&self, phase: &str) -> PhaseStatus {
        self.phases
            .iter()
            .find(|p| p.name == phase)
            .map(|p| p.status)
            .unwrap_or_default()
    }

    fn set_status(&mut self, phase: &str, status: PhaseStatus) {
        if let Some(p) = self.phases.iter_mut().find(|p| p.name == phase) {
            p.status = status;
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    /// The template as it was when the instance started.
    pub template: WorkflowTemplate,
    pub created_at: DateTime<Utc>,
    pub state: InstanceState,
    /// Sequence number of the last log entry folded into this view.
    pub last_seq: u64,
}

impl WorkflowInstance {
    pub fn new(id: Uuid, template: WorkflowTemplate, created_at: DateTime<Utc>) -> Result<Self> {
        let state = InstanceState::initial(&template)?;
        Ok(Self {
            id,
            template,
            created_at,
            state,
            last_seq: 0,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn template_id(&self) -> &str {
        &self.template.id
    }

    pub fn current_phase(&self) -> &str {
        &self.state.current_phase
    }

    /// Status of the current phase.
    pub fn phase_status(&self) -> PhaseStatus {
        self.state.status_of(&self.state.current_phase)
    }

    pub fn current_phase_def(&self) -> Result<&PhaseDefinition> {
        self.template
            .phase(&self.state.current_phase)
            .ok_or_else(|| WorkflowError::UnknownPhase {
                template: self.template.id.clone(),
                phase: self.state.current_phase.clone(),
            })
    }

    pub fn results_for(&self, phase: &str) -> Option<&GateResults> {
        self.state.gate_results.get(phase)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle
    }

    pub fn is_active(&self) -> bool {
        self.state.lifecycle == Lifecycle::Active
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(WorkflowError::InstanceClosed {
                id: self.id,
                lifecycle: self.state.lifecycle,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Record application
    // -----------------------------------------------------------------------

    /// Fold one record into the instance.
    ///
    /// `Started` and `Rollback` are positional: replay handles them when it
    /// picks its starting point, so they do not change state here.
    pub fn apply(&mut self, record: &LogRecord) {
        match record {
            LogRecord::Started { .. } | LogRecord::Rollback { .. } => {}
            LogRecord::PhaseStatus { phase, status } => self.state.set_status(phase, *status),
            LogRecord::GateResult(result) => {
                let results = self
                    .state
                    .gate_results
                    .entry(result.phase.clone())
                    .or_default();
                let replace = results
                    .get(&result.gate_id)
                    .map_or(true, |current| result.supersedes(current));
                if replace {
                    results.insert(result.gate_id.clone(), result.clone());
                }
            }
            LogRecord::GateSkipped { phase, gate_id } => {
                self.state
                    .skipped
                    .entry(phase.clone())
                    .or_default()
                    .insert(gate_id.clone());
            }
            LogRecord::Invocation(invocation) => self.state.invocations.push(invocation.clone()),
            LogRecord::Checkpoint(checkpoint) => {
                self.state = checkpoint.snapshot.clone();
                self.state.checkpoints.push(checkpoint.id);
            }
            LogRecord::PhaseAdvanced { to, .. } => self.state.current_phase = to.clone(),
            LogRecord::Override { from, to, .. } => {
                let start = self.template.phase_index(from);
                let end = self.template.phase_index(to);
                if let (Some(start), Some(end)) = (start, end) {
                    for progress in &mut self.state.phases[start..end] {
                        progress.status = PhaseStatus::Complete;
                        progress.overridden = true;
                    }
                }
                self.state.current_phase = to.clone();
            }
            LogRecord::Closed { lifecycle, .. } => self.state.lifecycle = *lifecycle,
        }
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Rebuild an instance from its full log.
    ///
    /// Starts from the latest `Checkpoint` or `Rollback` record (whose target
    /// checkpoint's snapshot becomes the base state) and applies everything
    /// after it. Without either, replays from the `Started` record.
    pub fn replay(entries: &[LogEntry]) -> Result<Self> {
        let first = entries
            .first()
            .ok_or_else(|| WorkflowError::StorageUnavailable("empty instance log".to_string()))?;
        let LogRecord::Started { template } = &first.record else {
            return Err(WorkflowError::StorageUnavailable(format!(
                "log of instance {} does not begin with a start record",
                first.instance_id
            )));
        };
        let mut instance = Self::new(first.instance_id, template.clone(), first.recorded_at)?;

        let base = entries.iter().rposition(|e| {
            matches!(
                e.record,
                LogRecord::Checkpoint(_) | LogRecord::Rollback { .. }
            )
        });

        let rest = match base {
            Some(i) => {
                let checkpoint = match &entries[i].record {
                    LogRecord::Checkpoint(cp) => cp,
                    LogRecord::Rollback { checkpoint_id } => entries[..i]
                        .iter()
                        .find_map(|e| match &e.record {
                            LogRecord::Checkpoint(cp) if cp.id == *checkpoint_id => Some(cp),
                            _ => None,
                        })
                        .ok_or_else(|| WorkflowError::CheckpointNotFound {
                            instance: instance.id,
                            checkpoint: checkpoint_id.to_string(),
                        })?,
                    _ => unreachable!("base index only matches checkpoint or rollback records"),
                };
                instance.apply(&LogRecord::Checkpoint(checkpoint.clone()));
                &entries[i + 1..]
            }
            None => &entries[1..],
        };

        for entry in rest {
            instance.apply(&entry.record);
        }
        instance.last_seq = entries.last().map(|e| e.seq).unwrap_or(0);
        Ok(instance)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, CheckpointReason};
    use crate::gate::GateResult;
    use crate::template::SourceFormat;
    use chrono::Duration;

    fn template() -> WorkflowTemplate {
        let yaml = "
id: simple
phases:
  - name: design
    gates:
      - id: D3
        criteria: [doc_approved]
  - name: build
  - name: ship
";
        WorkflowTemplate::parse(yaml, SourceFormat::Yaml).unwrap()
    }

    fn entry(id: Uuid, seq: u64, record: LogRecord) -> LogEntry {
        LogEntry {
            seq,
            instance_id: id,
            recorded_at: Utc::now(),
            record,
        }
    }

    #[test]
    fn new_instance_starts_in_entry_phase() {
        let instance = WorkflowInstance::new(Uuid::new_v4(), template(), Utc::now()).unwrap();
        assert_eq!(instance.current_phase(), "design");
        assert_eq!(instance.phase_status(), PhaseStatus::NotStarted);
        assert_eq!(instance.state.phases.len(), 3);
        assert!(instance.is_active());
    }

    #[test]
    fn older_gate_result_does_not_replace_newer() {
        let mut instance = WorkflowInstance::new(Uuid::new_v4(), template(), Utc::now()).unwrap();
        let newer = GateResult::new("design", "D3", ["doc_approved"], "alice");
        let mut older = GateResult::new("design", "D3", Vec::<String>::new(), "bob");
        older.timestamp = newer.timestamp - Duration::seconds(5);

        instance.apply(&LogRecord::GateResult(newer.clone()));
        instance.apply(&LogRecord::GateResult(older));
        assert_eq!(instance.results_for("design").unwrap()["D3"], newer);
    }

    #[test]
    fn override_marks_skipped_phases_complete() {
        let mut instance = WorkflowInstance::new(Uuid::new_v4(), template(), Utc::now()).unwrap();
        instance.apply(&LogRecord::Override {
            from: "design".to_string(),
            to: "ship".to_string(),
            actor: "ops".to_string(),
            reason: "hotfix".to_string(),
        });
        assert_eq!(instance.current_phase(), "ship");
        assert_eq!(instance.state.status_of("design"), PhaseStatus::Complete);
        assert_eq!(instance.state.status_of("build"), PhaseStatus::Complete);
        assert!(instance.state.phases[1].overridden);
        assert_eq!(instance.phase_status(), PhaseStatus::NotStarted);
    }

    #[test]
    fn replay_starts_from_rollback_target() {
        let id = Uuid::new_v4();
        let tpl = template();
        let mut live = WorkflowInstance::new(id, tpl.clone(), Utc::now()).unwrap();
        live.apply(&LogRecord::PhaseStatus {
            phase: "design".to_string(),
            status: PhaseStatus::Complete,
        });
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            instance_id: id,
            phase: "design".to_string(),
            reason: CheckpointReason::PhaseComplete,
            parent: None,
            snapshot: live.state.clone(),
            created_at: Utc::now(),
        };

        let entries = vec![
            entry(id, 1, LogRecord::Started { template: tpl }),
            entry(
                id,
                2,
                LogRecord::PhaseStatus {
                    phase: "design".to_string(),
                    status: PhaseStatus::Complete,
                },
            ),
            entry(id, 3, LogRecord::Checkpoint(checkpoint.clone())),
            entry(
                id,
                4,
                LogRecord::PhaseAdvanced {
                    from: "design".to_string(),
                    to: "build".to_string(),
                },
            ),
            entry(
                id,
                5,
                LogRecord::Rollback {
                    checkpoint_id: checkpoint.id,
                },
            ),
        ];

        let replayed = WorkflowInstance::replay(&entries).unwrap();
        assert_eq!(replayed.current_phase(), "design");
        assert_eq!(replayed.phase_status(), PhaseStatus::Complete);
        assert_eq!(replayed.state.checkpoints, [checkpoint.id]);
        assert_eq!(replayed.last_seq, 5);
    }

    #[test]
    fn replay_rejects_log_without_start_record() {
        let id = Uuid::new_v4();
        let entries = vec![entry(
            id,
            1,
            LogRecord::Closed {
                lifecycle: Lifecycle::Abandoned,
                reason: None,
            },
        )];
        assert!(matches!(
            WorkflowInstance::replay(&entries),
            Err(WorkflowError::StorageUnavailable(_))
        ));
    }
}
