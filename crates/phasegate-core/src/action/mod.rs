//! External actions dispatched while a phase is open.
//!
//! Templates refer to actions by name; the `ActionRegistry` maps those names
//! to implementations. Backends come from `.workflow/config.yaml` (shell
//! commands and manual steps), and embedders may register their own.

pub mod shell;

use crate::config::{ActionBackend, Config};
use crate::gate::GateResults;
use crate::instance::WorkflowInstance;
use crate::types::{Criteria, Outcome};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use shell::ShellAction;

/// Criteria an action reports as satisfied, keyed by gate id.
pub type Evidence = BTreeMap<String, Criteria>;

// ---------------------------------------------------------------------------
// ActionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub outcome: Outcome,
    pub evidence: Evidence,
    pub output: String,
}

impl ActionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            evidence: Evidence::new(),
            output: output.into(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            evidence: Evidence::new(),
            output: output.into(),
        }
    }

    pub fn timeout(output: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Timeout,
            evidence: Evidence::new(),
            output: output.into(),
        }
    }

    pub fn with_evidence<I, S>(mut self, gate_id: impl Into<String>, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.evidence
            .entry(gate_id.into())
            .or_default()
            .extend(criteria.into_iter().map(Into::into));
        self
    }
}

// ---------------------------------------------------------------------------
// InstanceContext
// ---------------------------------------------------------------------------

/// What an action gets to know about the instance it runs for.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    pub instance_id: Uuid,
    pub template_id: String,
    pub phase: String,
    /// Workspace root, when the orchestrator runs against one.
    pub root: Option<PathBuf>,
    /// Current gate results of the phase.
    pub gate_results: GateResults,
}

impl InstanceContext {
    pub fn new(instance: &WorkflowInstance, phase: &str, root: Option<&Path>) -> Self {
        Self {
            instance_id: instance.id,
            template_id: instance.template_id().to_string(),
            phase: phase.to_string(),
            root: root.map(Path::to_path_buf),
            gate_results: instance.results_for(phase).cloned().unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

pub trait Action: Send + Sync {
    /// Run the action once. Implementations should honour `timeout` where
    /// they can; the dispatcher gives up on them after it regardless.
    fn invoke(&self, phase: &str, ctx: &InstanceContext, timeout: Duration) -> ActionResult;
}

impl<F> Action for F
where
    F: Fn(&str, &InstanceContext, Duration) -> ActionResult + Send + Sync,
{
    fn invoke(&self, phase: &str, ctx: &InstanceContext, timeout: Duration) -> ActionResult {
        self(phase, ctx, timeout)
    }
}

/// A step performed by a person. Invoking it succeeds immediately and
/// echoes the prompt; the person reports the outcome with
/// `workflow gate submit`.
#[derive(Debug, Clone)]
pub struct ManualAction {
    pub prompt: String,
}

impl Action for ManualAction {
    fn invoke(&self, phase: &str, _ctx: &InstanceContext, _timeout: Duration) -> ActionResult {
        ActionResult::success(format!("[{phase}] manual step: {}", self.prompt))
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the backends declared in config.
    pub fn from_config(config: &Config, root: &Path) -> Self {
        let mut registry = Self::new();
        for (name, backend) in &config.actions {
            match backend {
                ActionBackend::Shell { command, env } => registry.register(
                    name,
                    ShellAction::new(command, root)
                        .with_env(env.clone())
                        .with_max_output(config.max_output_bytes),
                ),
                ActionBackend::Manual { prompt } => registry.register(
                    name,
                    ManualAction {
                        prompt: prompt.clone(),
                    },
                ),
            }
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, action: impl Action + 'static) {
        self.actions.insert(name.into(), Arc::new(action));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
