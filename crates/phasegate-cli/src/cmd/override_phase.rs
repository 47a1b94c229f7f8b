use super::open_instance;
use crate::output::print_json;
use anyhow::Context;
use std::path::Path;

pub fn run(
    root: &Path,
    needle: &str,
    phase: &str,
    actor: &str,
    reason: &str,
    json: bool,
) -> anyhow::Result<()> {
    let (orch, id) = open_instance(root, needle)?;
    let (instance, checkpoint) = orch
        .override_phase(id, phase, actor, reason)
        .with_context(|| format!("failed to override instance {id} to '{phase}'"))?;

    if json {
        print_json(&serde_json::json!({
            "id": instance.id,
            "current_phase": instance.current_phase(),
            "checkpoint": checkpoint.id,
            "actor": actor,
            "reason": reason,
        }))?;
    } else {
        println!(
            "Overrode to '{}' by {actor} (checkpoint {}).",
            instance.current_phase(),
            checkpoint.id
        );
    }
    Ok(())
}
