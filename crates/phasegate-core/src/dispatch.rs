//! Phase dispatcher: runs a phase's actions and turns their evidence into
//! gate results.
//!
//! Actions run in declared order. Consecutive actions marked `parallel`
//! form one group and run concurrently; the group finishes when all of its
//! members have. Results are always settled in declared order, so the
//! audit trail and the merged evidence do not depend on scheduling.

use crate::action::shell::cap_output;
use crate::action::{ActionRegistry, ActionResult, InstanceContext};
use crate::error::{Result, WorkflowError};
use crate::gate::GateResult;
use crate::instance::WorkflowInstance;
use crate::template::{ActionRef, PhaseDefinition};
use crate::types::{Criteria, Outcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Audit record of one action invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInvocation {
    pub action_ref: String,
    pub phase: String,
    pub mandatory: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    #[serde(default)]
    pub output: String,
}

/// The mandatory action that stopped a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub action: String,
    pub outcome: Outcome,
    pub cause: String,
}

impl ActionFailure {
    pub fn into_error(self) -> WorkflowError {
        WorkflowError::ActionFailed {
            action: self.action,
            cause: format!("{}: {}", self.outcome, self.cause),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dispatch {
    /// Every invocation, in declared order.
    pub invocations: Vec<ActionInvocation>,
    /// One result per gate that received evidence.
    pub gate_results: Vec<GateResult>,
    /// Set when a mandatory action did not succeed; later groups were not run.
    pub failure: Option<ActionFailure>,
}

/// Cooperative cancellation, checked before each action group starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// PhaseDispatcher
// ---------------------------------------------------------------------------

pub struct PhaseDispatcher<'a> {
    actions: &'a ActionRegistry,
    default_timeout: Duration,
    timeout_override: Option<Duration>,
    max_output: usize,
    root: Option<&'a Path>,
}

struct Settled {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    result: ActionResult,
}

impl<'a> PhaseDispatcher<'a> {
    pub fn new(actions: &'a ActionRegistry, default_timeout: Duration, max_output: usize) -> Self {
        Self {
            actions,
            default_timeout,
            timeout_override: None,
            max_output,
            root: None,
        }
    }

    /// Replace every action's timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_override = timeout;
        self
    }

    pub fn with_root(mut self, root: Option<&'a Path>) -> Self {
        self.root = root;
        self
    }

    fn timeout_for(&self, action: &ActionRef) -> Duration {
        self.timeout_override
            .or(action.timeout_seconds.map(Duration::from_secs))
            .unwrap_or(self.default_timeout)
    }

    /// Run the actions of `phase` for `instance`.
    ///
    /// `record` is called with each invocation as soon as it settles so the
    /// audit trail survives a later failure or cancellation. A failing
    /// `record` aborts the dispatch.
    pub fn dispatch(
        &self,
        instance: &WorkflowInstance,
        phase: &PhaseDefinition,
        cancel: Option<&CancelToken>,
        record: &mut dyn FnMut(&ActionInvocation) -> Result<()>,
    ) -> Result<Dispatch> {
        let ctx = InstanceContext::new(instance, &phase.name, self.root);
        let mut out = Dispatch::default();
        let mut evidence: BTreeMap<String, (Criteria, Vec<String>)> = BTreeMap::new();

        for group in groups(&phase.actions) {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                tracing::info!(instance = %instance.id, phase = %phase.name, "dispatch cancelled");
                return Err(WorkflowError::Cancelled(instance.id));
            }

            let settled: Vec<Settled> = if group.len() == 1 {
                vec![self.run_one(&group[0], &ctx)]
            } else {
                let ctx = &ctx;
                std::thread::scope(|s| {
                    let handles: Vec<_> = group
                        .iter()
                        .map(|action| s.spawn(move || self.run_one(action, ctx)))
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| {
                            h.join().unwrap_or_else(|_| Settled {
                                started_at: Utc::now(),
                                finished_at: Utc::now(),
                                result: ActionResult::failure("action worker panicked"),
                            })
                        })
                        .collect()
                })
            };

            for (action, done) in group.iter().zip(settled) {
                let invocation = ActionInvocation {
                    action_ref: action.name.clone(),
                    phase: phase.name.clone(),
                    mandatory: action.mandatory,
                    started_at: done.started_at,
                    finished_at: done.finished_at,
                    outcome: done.result.outcome,
                    output: done.result.output.clone(),
                };
                record(&invocation)?;
                out.invocations.push(invocation);

                if done.result.outcome.is_success() {
                    tracing::debug!(action = %action.name, phase = %phase.name, "action succeeded");
                    let mut credited = action.grants.clone();
                    for (gate, criteria) in done.result.evidence {
                        credited.entry(gate).or_default().extend(criteria);
                    }
                    for (gate, criteria) in credited {
                        if phase.gate(&gate).is_none() {
                            tracing::warn!(
                                action = %action.name,
                                gate = %gate,
                                "evidence for a gate the phase does not declare; ignored"
                            );
                            continue;
                        }
                        let slot = evidence.entry(gate).or_default();
                        slot.0.extend(criteria);
                        if !slot.1.contains(&action.name) {
                            slot.1.push(action.name.clone());
                        }
                    }
                } else if action.mandatory {
                    tracing::warn!(
                        action = %action.name,
                        phase = %phase.name,
                        outcome = %done.result.outcome,
                        "mandatory action did not succeed"
                    );
                    if out.failure.is_none() {
                        out.failure = Some(ActionFailure {
                            action: action.name.clone(),
                            outcome: done.result.outcome,
                            cause: done.result.output,
                        });
                    }
                } else {
                    tracing::warn!(
                        action = %action.name,
                        phase = %phase.name,
                        outcome = %done.result.outcome,
                        "optional action did not succeed"
                    );
                }
            }

            if out.failure.is_some() {
                break;
            }
        }

        let now = Utc::now();
        out.gate_results = evidence
            .into_iter()
            .map(|(gate_id, (criteria, by))| GateResult {
                phase: phase.name.clone(),
                gate_id,
                satisfied_criteria: criteria,
                timestamp: now,
                evaluated_by: by.join(","),
            })
            .collect();
        Ok(out)
    }

    fn run_one(&self, action: &ActionRef, ctx: &InstanceContext) -> Settled {
        let started_at = Utc::now();
        let timeout = self.timeout_for(action);
        let mut result = match self.actions.get(&action.name) {
            None => ActionResult::failure(format!("no backend configured for '{}'", action.name)),
            Some(backend) => {
                let (tx, rx) = mpsc::channel();
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    let _ = tx.send(backend.invoke(&ctx.phase, &ctx, timeout));
                });
                match rx.recv_timeout(timeout) {
                    Ok(result) => result,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        ActionResult::timeout(format!("timed out after {}s", timeout.as_secs()))
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        ActionResult::failure("action exited without a result")
                    }
                }
            }
        };
        result.output = cap_output(&result.output, self.max_output);
        Settled {
            started_at,
            finished_at: Utc::now(),
            result,
        }
    }
}

/// Split actions into run groups: each run of consecutive `parallel`
/// actions is one group, every other action is a group of its own.
fn groups(actions: &[ActionRef]) -> Vec<&[ActionRef]> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < actions.len() {
        let mut end = start + 1;
        if actions[start].parallel {
            while end < actions.len() && actions[end].parallel {
                end += 1;
            }
        }
        out.push(&actions[start..end]);
        start = end;
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
