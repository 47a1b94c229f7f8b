use crate::template::{GateDefinition, PhaseDefinition};
use crate::types::{Criteria, Criterion};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current gate results of one phase, keyed by gate id.
pub type GateResults = BTreeMap<String, GateResult>;

// ---------------------------------------------------------------------------
// GateResult
// ---------------------------------------------------------------------------

/// Evidence recorded against one gate. Never mutated: re-evaluating a gate
/// records a new result which replaces this one as the gate's current result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub phase: String,
    pub gate_id: String,
    pub satisfied_criteria: Criteria,
    pub timestamp: DateTime<Utc>,
    /// Actor or action ref that supplied the evidence.
    pub evaluated_by: String,
}

impl GateResult {
    pub fn new<I, S>(
        phase: impl Into<String>,
        gate_id: impl Into<String>,
        criteria: I,
        evaluated_by: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Criterion>,
    {
        Self {
            phase: phase.into(),
            gate_id: gate_id.into(),
            satisfied_criteria: criteria.into_iter().map(Into::into).collect(),
            timestamp: Utc::now(),
            evaluated_by: evaluated_by.into(),
        }
    }

    pub fn satisfies(&self, gate: &GateDefinition) -> bool {
        self.satisfied_criteria.is_superset(&gate.criteria)
    }

    pub fn missing(&self, gate: &GateDefinition) -> Vec<Criterion> {
        gate.criteria
            .difference(&self.satisfied_criteria)
            .cloned()
            .collect()
    }

    /// Whether `self` may replace `current` as the gate's result: the latest
    /// wall-clock evaluation wins, ties go to the later submission.
    pub fn supersedes(&self, current: &GateResult) -> bool {
        self.timestamp >= current.timestamp
    }
}

// ---------------------------------------------------------------------------
// UnmetGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmetGate {
    pub gate_id: String,
    pub missing: Vec<Criterion>,
    /// False when the gate has no result at all.
    pub evaluated: bool,
}

impl fmt::Display for UnmetGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let missing = self.missing.join(", ");
        if self.evaluated {
            write!(f, "{} missing [{missing}]", self.gate_id)
        } else {
            write!(f, "{} not evaluated (needs [{missing}])", self.gate_id)
        }
    }
}

// ---------------------------------------------------------------------------
// GateEvaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEvaluation {
    /// Mandatory gates whose current result does not cover their criteria.
    pub unmet: Vec<UnmetGate>,
    /// Optional gates that would be recorded as skipped on completion.
    pub unsatisfied_optional: Vec<String>,
}

impl GateEvaluation {
    pub fn is_satisfied(&self) -> bool {
        self.unmet.is_empty()
    }
}

/// Derive gate status for `phase` from its full current result map.
pub fn evaluate(phase: &PhaseDefinition, results: Option<&GateResults>) -> GateEvaluation {
    let mut evaluation = GateEvaluation::default();
    for gate in &phase.gates {
        let current = results.and_then(|r| r.get(&gate.id));
        let satisfied = current.is_some_and(|r| r.satisfies(gate));
        if satisfied {
            continue;
        }
        if gate.mandatory {
            evaluation.unmet.push(UnmetGate {
                gate_id: gate.id.clone(),
                missing: match current {
                    Some(r) => r.missing(gate),
                    None => gate.criteria.iter().cloned().collect(),
                },
                evaluated: current.is_some(),
            });
        } else {
            evaluation.unsatisfied_optional.push(gate.id.clone());
        }
    }
    evaluation
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
