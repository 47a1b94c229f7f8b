//! Workflow template definitions and load-time validation.
//!
//! A template is an ordered list of phases. Each phase declares the gates
//! that must pass before it completes, the actions dispatched while it is
//! open, and the predecessor phases that must be complete before it may
//! start. Templates are pure data: parsing and validation have no side
//! effects.

pub mod registry;

use crate::error::TemplateError;
use crate::paths::{is_valid_gate_id, is_valid_slug};
use crate::types::Criteria;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

pub use registry::{RejectedTemplate, TemplateRegistry, TemplateSource};

// ---------------------------------------------------------------------------
// GateDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub criteria: Criteria,
    #[serde(default = "default_true")]
    pub mandatory: bool,
}

// ---------------------------------------------------------------------------
// ActionRef
// ---------------------------------------------------------------------------

/// A reference to an external action invoked while a phase is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionRef {
    pub name: String,
    #[serde(default = "default_true")]
    pub mandatory: bool,
    /// Consecutive parallel-eligible actions run concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Overrides `default_action_timeout_seconds` from config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Criteria credited to each gate when the action succeeds.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub grants: BTreeMap<String, Criteria>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// PhaseDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub gates: Vec<GateDefinition>,
    #[serde(default)]
    pub actions: Vec<ActionRef>,
    /// Predecessor phases that must be complete. Omitted means "the phase
    /// declared immediately before this one".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_conditions: Option<Vec<String>>,
}

impl PhaseDefinition {
    pub fn predecessors(&self) -> &[String] {
        self.entry_conditions.as_deref().unwrap_or(&[])
    }

    pub fn gate(&self, id: &str) -> Option<&GateDefinition> {
        self.gates.iter().find(|g| g.id == id)
    }
}

// ---------------------------------------------------------------------------
// SourceFormat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Yaml,
    Json,
}

impl SourceFormat {
    /// `.json` files are JSON; everything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => SourceFormat::Json,
            _ => SourceFormat::Yaml,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowTemplate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub phases: Vec<PhaseDefinition>,
}

impl WorkflowTemplate {
    /// Parse, normalize and validate a template definition.
    pub fn parse(text: &str, format: SourceFormat) -> Result<Self, TemplateError> {
        let mut template: WorkflowTemplate = match format {
            SourceFormat::Yaml => serde_yaml::from_str(text)
                .map_err(|e| TemplateError::MalformedDefinition(e.to_string()))?,
            SourceFormat::Json => serde_json::from_str(text)
                .map_err(|e| TemplateError::MalformedDefinition(e.to_string()))?,
        };
        template.normalize();
        template.validate()?;
        Ok(template)
    }

    /// Fill in omitted entry conditions with the preceding phase.
    fn normalize(&mut self) {
        let mut previous: Option<String> = None;
        for phase in &mut self.phases {
            if phase.entry_conditions.is_none() {
                phase.entry_conditions = Some(previous.iter().cloned().collect());
            }
            previous = Some(phase.name.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn entry_phase(&self) -> Option<&PhaseDefinition> {
        self.phases.first()
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn next_phase(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phase_index(name).and_then(|i| self.phases.get(i + 1))
    }

    pub fn phase_names(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.name.as_str())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Result<(), TemplateError> {
        if !is_valid_slug(&self.id) {
            return Err(TemplateError::MalformedDefinition(format!(
                "template id '{}' must be a lowercase slug",
                self.id
            )));
        }
        if self.phases.is_empty() {
            return Err(TemplateError::MalformedDefinition(format!(
                "template '{}' declares no phases",
                self.id
            )));
        }

        let mut names = HashSet::new();
        for phase in &self.phases {
            if !is_valid_slug(&phase.name) {
                return Err(TemplateError::MalformedDefinition(format!(
                    "phase name '{}' must be a lowercase slug",
                    phase.name
                )));
            }
            if !names.insert(phase.name.as_str()) {
                return Err(TemplateError::DuplicateIdentifier {
                    id: phase.name.clone(),
                    scope: format!("template '{}'", self.id),
                });
            }
            validate_members(phase)?;
        }

        for phase in &self.phases {
            for pred in phase.predecessors() {
                if !names.contains(pred.as_str()) {
                    return Err(TemplateError::MalformedDefinition(format!(
                        "phase '{}' lists unknown entry condition '{pred}'",
                        phase.name
                    )));
                }
            }
        }

        self.check_acyclic()?;

        if self.phases.iter().all(|p| !p.predecessors().is_empty()) {
            return Err(TemplateError::CyclicPhaseOrder(
                "every phase has a predecessor; no entry phase".to_string(),
            ));
        }

        let index: HashMap<&str, usize> = self
            .phases
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.as_str(), i))
            .collect();
        for (i, phase) in self.phases.iter().enumerate() {
            for pred in phase.predecessors() {
                if index[pred.as_str()] >= i {
                    return Err(TemplateError::MalformedDefinition(format!(
                        "phase '{}' depends on later phase '{pred}'",
                        phase.name
                    )));
                }
            }
        }

        self.check_reachable(&index)
    }

    /// Depth-first search over predecessor edges.
    fn check_acyclic(&self) -> Result<(), TemplateError> {
        let index: HashMap<&str, usize> = self
            .phases
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.as_str(), i))
            .collect();
        let mut marks = vec![Mark::Unvisited; self.phases.len()];
        let mut path = Vec::new();
        for i in 0..self.phases.len() {
            self.visit(i, &index, &mut marks, &mut path)?;
        }
        Ok(())
    }

    fn visit(
        &self,
        i: usize,
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Result<(), TemplateError> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = path.iter().position(|&p| p == i).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..]
                    .iter()
                    .map(|&p| self.phases[p].name.as_str())
                    .collect();
                cycle.push(self.phases[i].name.as_str());
                return Err(TemplateError::CyclicPhaseOrder(cycle.join(" -> ")));
            }
            Mark::Unvisited => {}
        }
        marks[i] = Mark::Visiting;
        path.push(i);
        for pred in self.phases[i].predecessors() {
            if let Some(&j) = index.get(pred.as_str()) {
                self.visit(j, index, marks, path)?;
            }
        }
        path.pop();
        marks[i] = Mark::Done;
        Ok(())
    }

    /// Every phase must be reachable from the entry phase along successor edges.
    fn check_reachable(&self, index: &HashMap<&str, usize>) -> Result<(), TemplateError> {
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); self.phases.len()];
        for (i, phase) in self.phases.iter().enumerate() {
            for pred in phase.predecessors() {
                successors[index[pred.as_str()]].push(i);
            }
        }

        let mut seen = vec![false; self.phases.len()];
        let mut queue = VecDeque::from([0usize]);
        seen[0] = true;
        while let Some(i) = queue.pop_front() {
            for &next in &successors[i] {
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back(next);
                }
            }
        }

        match seen.iter().position(|s| !s) {
            Some(i) => Err(TemplateError::UnreachablePhase(self.phases[i].name.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

fn validate_members(phase: &PhaseDefinition) -> Result<(), TemplateError> {
    let mut gate_ids = HashSet::new();
    for gate in &phase.gates {
        if !is_valid_gate_id(&gate.id) {
            return Err(TemplateError::MalformedDefinition(format!(
                "gate id '{}' in phase '{}' is empty or contains whitespace",
                gate.id, phase.name
            )));
        }
        if !gate_ids.insert(gate.id.as_str()) {
            return Err(TemplateError::DuplicateIdentifier {
                id: gate.id.clone(),
                scope: format!("gates of phase '{}'", phase.name),
            });
        }
    }

    let mut action_names = HashSet::new();
    for action in &phase.actions {
        if !is_valid_slug(&action.name) {
            return Err(TemplateError::MalformedDefinition(format!(
                "action ref '{}' in phase '{}' must be a lowercase slug",
                action.name, phase.name
            )));
        }
        if !action_names.insert(action.name.as_str()) {
            return Err(TemplateError::DuplicateIdentifier {
                id: action.name.clone(),
                scope: format!("actions of phase '{}'", phase.name),
            });
        }
        if action.timeout_seconds == Some(0) {
            return Err(TemplateError::MalformedDefinition(format!(
                "action '{}' in phase '{}' has a zero timeout",
                action.name, phase.name
            )));
        }
        for (gate_id, criteria) in &action.grants {
            let Some(gate) = phase.gate(gate_id) else {
                return Err(TemplateError::MalformedDefinition(format!(
                    "action '{}' grants evidence to unknown gate '{gate_id}' in phase '{}'",
                    action.name, phase.name
                )));
            };
            if let Some(extra) = criteria.difference(&gate.criteria).next() {
                return Err(TemplateError::MalformedDefinition(format!(
                    "action '{}' grants criterion '{extra}' that gate '{gate_id}' does not declare",
                    action.name
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<WorkflowTemplate, TemplateError> {
        WorkflowTemplate::parse(yaml, SourceFormat::Yaml)
    }

    const TWO_PHASES: &str = "
id: simple
phases:
  - name: design
    gates:
      - id: D3
        criteria: [doc_approved]
  - name: build
";

    #[test]
    fn omitted_entry_conditions_default_to_previous_phase() {
        let t = parse(TWO_PHASES).unwrap();
        assert!(t.phases[0].predecessors().is_empty());
        assert_eq!(t.phases[1].predecessors(), ["design".to_string()]);
        assert_eq!(t.entry_phase().unwrap().name, "design");
        assert_eq!(t.next_phase("design").unwrap().name, "build");
        assert!(t.next_phase("build").is_none());
    }

    #[test]
    fn gates_default_to_mandatory() {
        let t = parse(TWO_PHASES).unwrap();
        assert!(t.phases[0].gates[0].mandatory);
    }

    #[test]
    fn json_source_is_accepted() {
        let json = r#"{"id":"j","phases":[{"name":"only","gates":[{"id":"G1","criteria":["x"],"mandatory":false}]}]}"#;
        let t = WorkflowTemplate::parse(json, SourceFormat::Json).unwrap();
        assert!(!t.phases[0].gates[0].mandatory);
    }

    #[test]
    fn unknown_fields_are_malformed() {
        let yaml = "id: t\nphases:\n  - name: a\n    gatez: []\n";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::MalformedDefinition(_))
        ));
    }

    #[test]
    fn empty_template_is_malformed() {
        assert!(matches!(
            parse("id: t\nphases: []\n"),
            Err(TemplateError::MalformedDefinition(_))
        ));
    }

    #[test]
    fn duplicate_phase_names_are_rejected() {
        let yaml = "id: t\nphases:\n  - name: a\n  - name: a\n";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::DuplicateIdentifier { id, .. }) if id == "a"
        ));
    }

    #[test]
    fn duplicate_gate_ids_within_a_phase_are_rejected() {
        let yaml = "id: t\nphases:\n  - name: a\n    gates:\n      - id: G1\n      - id: G1\n";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::DuplicateIdentifier { id, .. }) if id == "G1"
        ));
    }

    #[test]
    fn same_gate_id_in_different_phases_is_fine() {
        let yaml = "id: t\nphases:\n  - name: a\n    gates:\n      - id: G1\n  - name: b\n    gates:\n      - id: G1\n";
        assert!(parse(yaml).is_ok());
    }

    #[test]
    fn unknown_predecessor_is_malformed() {
        let yaml = "id: t\nphases:\n  - name: a\n  - name: b\n    entry_conditions: [nope]\n";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::MalformedDefinition(msg)) if msg.contains("nope")
        ));
    }

    #[test]
    fn cycles_are_detected() {
        let yaml = "
id: t
phases:
  - name: a
  - name: b
    entry_conditions: [c]
  - name: c
    entry_conditions: [b]
";
        let err = parse(yaml).unwrap_err();
        match err {
            TemplateError::CyclicPhaseOrder(path) => {
                assert!(path.contains("b") && path.contains("c"), "path: {path}");
            }
            other => panic!("expected CyclicPhaseOrder, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let yaml = "id: t\nphases:\n  - name: a\n    entry_conditions: [a]\n";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::CyclicPhaseOrder(_))
        ));
    }

    #[test]
    fn forward_dependency_is_malformed() {
        let yaml = "
id: t
phases:
  - name: a
  - name: b
    entry_conditions: [c]
  - name: c
    entry_conditions: [a]
";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::MalformedDefinition(msg)) if msg.contains("later phase")
        ));
    }

    #[test]
    fn second_root_is_unreachable() {
        let yaml = "id: t\nphases:\n  - name: a\n  - name: b\n    entry_conditions: []\n";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::UnreachablePhase(name)) if name == "b"
        ));
    }

    #[test]
    fn fan_in_predecessors_are_reachable() {
        let yaml = "
id: t
phases:
  - name: design
  - name: backend
  - name: frontend
    entry_conditions: [design]
  - name: release
    entry_conditions: [backend, frontend]
";
        let t = parse(yaml).unwrap();
        assert_eq!(t.phases[3].predecessors().len(), 2);
    }

    #[test]
    fn grants_must_target_declared_criteria() {
        let yaml = "
id: t
phases:
  - name: test
    gates:
      - id: G3
        criteria: [tests_passed]
    actions:
      - name: run-tests
        grants:
          G3: [coverage_met]
";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::MalformedDefinition(msg)) if msg.contains("coverage_met")
        ));
    }

    #[test]
    fn grants_to_unknown_gate_are_malformed() {
        let yaml = "
id: t
phases:
  - name: test
    actions:
      - name: run-tests
        grants:
          G9: [x]
";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::MalformedDefinition(_))
        ));
    }

    #[test]
    fn duplicate_action_refs_are_rejected() {
        let yaml = "id: t\nphases:\n  - name: a\n    actions:\n      - name: lint\n      - name: lint\n";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::DuplicateIdentifier { id, .. }) if id == "lint"
        ));
    }

    #[test]
    fn zero_timeout_is_malformed() {
        let yaml = "id: t\nphases:\n  - name: a\n    actions:\n      - name: lint\n        timeout_seconds: 0\n";
        assert!(matches!(
            parse(yaml),
            Err(TemplateError::MalformedDefinition(_))
        ));
    }

    #[test]
    fn invalid_template_id_is_malformed() {
        assert!(matches!(
            parse("id: Not A Slug\nphases:\n  - name: a\n"),
            Err(TemplateError::MalformedDefinition(_))
        ));
    }

    #[test]
    fn normalized_template_roundtrips_through_yaml() {
        let t = parse(TWO_PHASES).unwrap();
        let yaml = serde_yaml::to_string(&t).unwrap();
        let again = parse(&yaml).unwrap();
        assert_eq!(t, again);
    }
}
