use super::open;
use crate::output::print_json;
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, template: &str, json: bool) -> anyhow::Result<()> {
    let orch = open(root)?;
    let instance = orch
        .start(template)
        .with_context(|| format!("failed to start template '{template}'"))?;

    if json {
        print_json(&serde_json::json!({
            "id": instance.id,
            "template": instance.template_id(),
            "current_phase": instance.current_phase(),
            "status": instance.phase_status(),
        }))?;
    } else {
        println!("{}", instance.id);
        eprintln!(
            "Started '{}' at phase '{}'.",
            instance.template_id(),
            instance.current_phase()
        );
    }
    Ok(())
}
