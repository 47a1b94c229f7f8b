//! Gate state machine.
//!
//! Pure transition logic over a `WorkflowInstance`. Every transition is
//! expressed as `LogRecord`s: each record is applied to the instance and
//! pushed onto `out`, and the caller decides when (and whether) to persist
//! them. Nothing here touches storage.

use crate::error::{Result, WorkflowError};
use crate::gate::{self, GateEvaluation, GateResult};
use crate::instance::WorkflowInstance;
use crate::store::LogRecord;
use crate::template::WorkflowTemplate;
use crate::types::{Lifecycle, PhaseStatus};

pub struct GateMachine<'a> {
    template: &'a WorkflowTemplate,
}

fn emit(instance: &mut WorkflowInstance, out: &mut Vec<LogRecord>, record: LogRecord) {
    instance.apply(&record);
    out.push(record);
}

impl<'a> GateMachine<'a> {
    pub fn new(template: &'a WorkflowTemplate) -> Self {
        Self { template }
    }

    /// Move the current phase to IN_PROGRESS once its entry conditions hold.
    /// A phase that is already open is left alone.
    pub fn start_phase(&self, instance: &mut WorkflowInstance, out: &mut Vec<LogRecord>) -> Result<()> {
        instance.ensure_active()?;
        let phase = instance.current_phase_def()?;
        match instance.phase_status() {
            PhaseStatus::InProgress | PhaseStatus::Blocked => return Ok(()),
            PhaseStatus::Complete => {
                return Err(WorkflowError::PhaseOrderViolation {
                    phase: phase.name.clone(),
                    reason: "phase is already complete".to_string(),
                })
            }
            PhaseStatus::NotStarted => {}
        }

        let pending: Vec<&str> = phase
            .predecessors()
            .iter()
            .filter(|p| instance.state.status_of(p) != PhaseStatus::Complete)
            .map(String::as_str)
            .collect();
        if !pending.is_empty() {
            return Err(WorkflowError::PhaseOrderViolation {
                phase: phase.name.clone(),
                reason: format!("entry conditions not complete: {}", pending.join(", ")),
            });
        }

        let name = phase.name.clone();
        tracing::debug!(instance = %instance.id, phase = %name, "phase started");
        emit(
            instance,
            out,
            LogRecord::PhaseStatus {
                phase: name,
                status: PhaseStatus::InProgress,
            },
        );
        Ok(())
    }

    /// Record a gate result for the current phase and re-derive the phase
    /// status from the full set of results.
    ///
    /// Resubmitting a gate's current result changes nothing. A result older
    /// than the gate's current one is logged but does not replace it.
    pub fn submit(
        &self,
        instance: &mut WorkflowInstance,
        result: GateResult,
        out: &mut Vec<LogRecord>,
    ) -> Result<()> {
        instance.ensure_active()?;
        if result.phase != instance.state.current_phase {
            return Err(WorkflowError::PhaseOrderViolation {
                phase: result.phase,
                reason: format!(
                    "gate results are accepted only for the current phase '{}'",
                    instance.state.current_phase
                ),
            });
        }
        let phase = instance.current_phase_def()?;
        if phase.gate(&result.gate_id).is_none() {
            return Err(WorkflowError::UnknownGate {
                phase: result.phase,
                gate: result.gate_id,
            });
        }
        if instance.phase_status() == PhaseStatus::Complete {
            return Err(WorkflowError::PhaseOrderViolation {
                phase: result.phase,
                reason: "phase is already complete".to_string(),
            });
        }

        let unchanged = instance
            .results_for(&result.phase)
            .and_then(|r| r.get(&result.gate_id))
            .is_some_and(|current| *current == result);
        if unchanged {
            return Ok(());
        }

        self.start_phase(instance, out)?;
        emit(instance, out, LogRecord::GateResult(result));
        self.unblock(instance, out)
    }

    /// Evaluate the current phase's gates against its current results.
    pub fn evaluate(&self, instance: &WorkflowInstance) -> Result<GateEvaluation> {
        let phase = instance.current_phase_def()?;
        Ok(gate::evaluate(
            phase,
            instance.results_for(&instance.state.current_phase),
        ))
    }

    /// BLOCKED phases whose mandatory gates are now met reopen as IN_PROGRESS.
    pub fn unblock(&self, instance: &mut WorkflowInstance, out: &mut Vec<LogRecord>) -> Result<()> {
        if instance.phase_status() == PhaseStatus::Blocked && self.evaluate(instance)?.is_satisfied() {
            let phase = instance.state.current_phase.clone();
            emit(
                instance,
                out,
                LogRecord::PhaseStatus {
                    phase,
                    status: PhaseStatus::InProgress,
                },
            );
        }
        Ok(())
    }

    pub fn block(&self, instance: &mut WorkflowInstance, out: &mut Vec<LogRecord>) {
        if instance.phase_status() != PhaseStatus::Blocked {
            let phase = instance.state.current_phase.clone();
            tracing::debug!(instance = %instance.id, phase = %phase, "phase blocked");
            emit(
                instance,
                out,
                LogRecord::PhaseStatus {
                    phase,
                    status: PhaseStatus::Blocked,
                },
            );
        }
    }

    /// Mark the current phase COMPLETE. Optional gates without a satisfying
    /// result are recorded as skipped. Fails with `GateNotSatisfied` while
    /// any mandatory gate is unmet.
    pub fn complete(
        &self,
        instance: &mut WorkflowInstance,
        out: &mut Vec<LogRecord>,
    ) -> Result<Vec<String>> {
        instance.ensure_active()?;
        let evaluation = self.evaluate(instance)?;
        let phase = instance.state.current_phase.clone();
        if !evaluation.is_satisfied() {
            return Err(WorkflowError::GateNotSatisfied {
                phase,
                unmet: evaluation.unmet,
                action_failure: None,
            });
        }
        if instance.phase_status() != PhaseStatus::InProgress {
            return Err(WorkflowError::PhaseOrderViolation {
                phase,
                reason: format!("cannot complete a phase that is {}", instance.phase_status()),
            });
        }

        for gate_id in &evaluation.unsatisfied_optional {
            let already = instance
                .state
                .skipped
                .get(&phase)
                .is_some_and(|s| s.contains(gate_id));
            if !already {
                emit(
                    instance,
                    out,
                    LogRecord::GateSkipped {
                        phase: phase.clone(),
                        gate_id: gate_id.clone(),
                    },
                );
            }
        }
        emit(
            instance,
            out,
            LogRecord::PhaseStatus {
                phase,
                status: PhaseStatus::Complete,
            },
        );
        Ok(evaluation.unsatisfied_optional)
    }

    /// Step off a COMPLETE current phase: point at the next phase, or close
    /// the instance as COMPLETED after the last one. Returns the new current
    /// phase, if any.
    pub fn advance_pointer(
        &self,
        instance: &mut WorkflowInstance,
        out: &mut Vec<LogRecord>,
    ) -> Result<Option<String>> {
        instance.ensure_active()?;
        let current = instance.state.current_phase.clone();
        if instance.phase_status() != PhaseStatus::Complete {
            return Err(WorkflowError::PhaseOrderViolation {
                phase: current,
                reason: "phase is not complete".to_string(),
            });
        }
        match self.template.next_phase(&current) {
            Some(next) => {
                let to = next.name.clone();
                emit(
                    instance,
                    out,
                    LogRecord::PhaseAdvanced {
                        from: current,
                        to: to.clone(),
                    },
                );
                Ok(Some(to))
            }
            None => {
                emit(
                    instance,
                    out,
                    LogRecord::Closed {
                        lifecycle: Lifecycle::Completed,
                        reason: None,
                    },
                );
                Ok(None)
            }
        }
    }

    /// Jump ahead to `target`, marking the current phase and every phase in
    /// between COMPLETE regardless of their gates.
    pub fn override_to(
        &self,
        instance: &mut WorkflowInstance,
        target: &str,
        actor: &str,
        reason: &str,
        out: &mut Vec<LogRecord>,
    ) -> Result<()> {
        instance.ensure_active()?;
        let current = instance.state.current_phase.clone();
        let target_index =
            self.template
                .phase_index(target)
                .ok_or_else(|| WorkflowError::UnknownPhase {
                    template: self.template.id.clone(),
                    phase: target.to_string(),
                })?;
        let current_index = self.template.phase_index(&current).unwrap_or(0);
        if target_index <= current_index {
            return Err(WorkflowError::PhaseOrderViolation {
                phase: target.to_string(),
                reason: format!("override can only move forward from '{current}'"),
            });
        }
        if reason.trim().is_empty() {
            return Err(WorkflowError::PhaseOrderViolation {
                phase: target.to_string(),
                reason: "override requires a reason".to_string(),
            });
        }

        tracing::warn!(
            instance = %instance.id,
            from = %current,
            to = %target,
            actor = %actor,
            "phase override"
        );
        emit(
            instance,
            out,
            LogRecord::Override {
                from: current,
                to: target.to_string(),
                actor: actor.to_string(),
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    /// Close the instance without completing it.
    pub fn abandon(
        &self,
        instance: &mut WorkflowInstance,
        reason: Option<String>,
        out: &mut Vec<LogRecord>,
    ) -> Result<()> {
        instance.ensure_active()?;
        emit(
            instance,
            out,
            LogRecord::Closed {
                lifecycle: Lifecycle::Abandoned,
                reason,
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
