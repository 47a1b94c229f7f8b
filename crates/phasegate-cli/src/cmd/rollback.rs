use super::open_instance;
use crate::output::print_json;
use anyhow::Context;
use phasegate_core::WorkflowError;
use std::path::Path;
use uuid::Uuid;

pub fn run(root: &Path, needle: &str, checkpoint: &str, json: bool) -> anyhow::Result<()> {
    let (orch, id) = open_instance(root, needle)?;
    let checkpoint_id = resolve_checkpoint(&orch, id, checkpoint)?;
    let instance = orch
        .rollback(id, checkpoint_id)
        .with_context(|| format!("failed to roll back instance {id}"))?;

    if json {
        print_json(&serde_json::json!({
            "id": instance.id,
            "checkpoint": checkpoint_id,
            "current_phase": instance.current_phase(),
            "status": instance.phase_status(),
        }))?;
    } else {
        println!(
            "Rolled back to {checkpoint_id}: phase '{}' is {}.",
            instance.current_phase(),
            instance.phase_status()
        );
    }
    Ok(())
}

/// Full checkpoint id, or a prefix unique among the instance's checkpoints.
fn resolve_checkpoint(
    orch: &phasegate_core::Orchestrator,
    instance: Uuid,
    needle: &str,
) -> anyhow::Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(needle) {
        return Ok(id);
    }
    let history = orch.checkpoints(instance)?;
    let needle = needle.to_ascii_lowercase();
    let matches: Vec<Uuid> = history
        .iter()
        .map(|item| item.checkpoint.id)
        .filter(|id| !needle.is_empty() && id.to_string().starts_with(&needle))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(WorkflowError::CheckpointNotFound {
            instance,
            checkpoint: needle,
        }
        .into()),
        _ => anyhow::bail!("checkpoint prefix '{needle}' is ambiguous"),
    }
}
