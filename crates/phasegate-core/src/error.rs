use crate::dispatch::ActionFailure;
use crate::gate::UnmetGate;
use crate::types::Lifecycle;
use thiserror::Error;
use uuid::Uuid;

/// Definitional problems found while loading a workflow template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("malformed template definition: {0}")]
    MalformedDefinition(String),

    #[error("cyclic phase order: {0}")]
    CyclicPhaseOrder(String),

    #[error("duplicate identifier '{id}' in {scope}")]
    DuplicateIdentifier { id: String, scope: String },

    #[error("phase '{0}' is unreachable from the entry phase")]
    UnreachablePhase(String),

    #[error("template not found: {0}")]
    UnknownTemplate(String),
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("not initialized: run 'workflow init'")]
    NotInitialized,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance id prefix '{0}' matches more than one instance")]
    AmbiguousInstance(String),

    #[error("instance {id} is {lifecycle}")]
    InstanceClosed { id: Uuid, lifecycle: Lifecycle },

    #[error("unknown phase '{phase}' in template '{template}'")]
    UnknownPhase { template: String, phase: String },

    #[error("phase '{phase}' has no gate '{gate}'")]
    UnknownGate { phase: String, gate: String },

    #[error("phase order violation at '{phase}': {reason}")]
    PhaseOrderViolation { phase: String, reason: String },

    #[error("gates not satisfied for phase '{phase}': {}", describe_unmet(.unmet, .action_failure.as_ref()))]
    GateNotSatisfied {
        phase: String,
        unmet: Vec<UnmetGate>,
        action_failure: Option<ActionFailure>,
    },

    #[error("action '{action}' failed: {cause}")]
    ActionFailed { action: String, cause: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("checkpoint {checkpoint} not found for instance {instance}")]
    CheckpointNotFound { instance: Uuid, checkpoint: String },

    #[error("advance of instance {0} was cancelled")]
    Cancelled(Uuid),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Wrap a backend failure as `StorageUnavailable`.
pub(crate) fn storage(e: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::StorageUnavailable(e.to_string())
}

fn describe_unmet(unmet: &[UnmetGate], failure: Option<&ActionFailure>) -> String {
    let mut parts: Vec<String> = unmet.iter().map(|u| u.to_string()).collect();
    if let Some(f) = failure {
        parts.push(format!("action '{}' {}: {}", f.action, f.outcome, f.cause));
    }
    parts.join("; ")
}
