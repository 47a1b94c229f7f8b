use super::open;
use crate::output::{print_json, print_table};
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, all: bool, json: bool) -> anyhow::Result<()> {
    let orch = open(root)?;
    let instances: Vec<_> = orch
        .list()
        .context("failed to list instances")?
        .into_iter()
        .filter(|i| all || i.is_active())
        .collect();

    if json {
        let items: Vec<serde_json::Value> = instances
            .iter()
            .map(|i| {
                serde_json::json!({
                    "id": i.id,
                    "template": i.template_id(),
                    "current_phase": i.current_phase(),
                    "status": i.phase_status(),
                    "lifecycle": i.lifecycle(),
                    "created_at": i.created_at,
                })
            })
            .collect();
        print_json(&items)?;
        return Ok(());
    }

    if instances.is_empty() {
        println!("No instances.");
        return Ok(());
    }

    print_table(&["ID", "TEMPLATE", "PHASE", "STATUS", "LIFECYCLE"], &instances);
    Ok(())
}
