use super::open_instance;
use crate::output::print_json;
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, needle: &str, reason: Option<String>, json: bool) -> anyhow::Result<()> {
    let (orch, id) = open_instance(root, needle)?;
    let instance = orch
        .abandon(id, reason)
        .with_context(|| format!("failed to abandon instance {id}"))?;

    if json {
        print_json(&serde_json::json!({
            "id": instance.id,
            "lifecycle": instance.lifecycle(),
            "phase": instance.current_phase(),
        }))?;
    } else {
        println!("Abandoned {} at phase '{}'.", instance.id, instance.current_phase());
    }
    Ok(())
}
