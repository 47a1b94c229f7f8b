pub mod abandon;
pub mod advance;
pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod gate;
pub mod init;
pub mod inspect;
pub mod list;
pub mod override_phase;
pub mod rollback;
pub mod start;
pub mod template;

use anyhow::Context;
use phasegate_core::instance::WorkflowInstance;
use phasegate_core::Orchestrator;
use std::path::Path;
use uuid::Uuid;

/// Open the workspace at `root`.
pub fn open(root: &Path) -> anyhow::Result<Orchestrator> {
    Orchestrator::open(root)
        .with_context(|| format!("failed to open workflow workspace at {}", root.display()))
}

/// Open the workspace and resolve an instance id or unique prefix.
pub fn open_instance(root: &Path, needle: &str) -> anyhow::Result<(Orchestrator, Uuid)> {
    let orch = open(root)?;
    let id = orch.resolve_instance(needle)?;
    Ok((orch, id))
}

/// First eight characters of an id, for tables.
pub fn short(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

pub fn phase_rows(instance: &WorkflowInstance) -> Vec<Vec<String>> {
    instance
        .state
        .phases
        .iter()
        .map(|p| {
            let marker = if p.name == instance.state.current_phase {
                "*"
            } else {
                ""
            };
            let status = if p.overridden {
                format!("{} (overridden)", p.status)
            } else {
                p.status.to_string()
            };
            vec![marker.to_string(), p.name.clone(), status]
        })
        .collect()
}
