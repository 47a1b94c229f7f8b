use super::open_instance;
use crate::output::print_json;
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, needle: &str, json: bool) -> anyhow::Result<()> {
    let (orch, id) = open_instance(root, needle)?;
    let checkpoint = orch
        .checkpoint(id)
        .with_context(|| format!("failed to checkpoint instance {id}"))?;

    if json {
        print_json(&serde_json::json!({
            "id": checkpoint.id,
            "instance": checkpoint.instance_id,
            "phase": checkpoint.phase,
            "reason": checkpoint.reason,
            "parent": checkpoint.parent,
            "created_at": checkpoint.created_at,
        }))?;
    } else {
        println!("{}", checkpoint.id);
    }
    Ok(())
}
