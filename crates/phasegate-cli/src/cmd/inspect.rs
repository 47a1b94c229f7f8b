use super::{open_instance, phase_rows};
use crate::output::{print_json, print_table};
use anyhow::Context;
use phasegate_core::gate;
use std::path::Path;

pub fn run(root: &Path, needle: &str, json: bool) -> anyhow::Result<()> {
    let (orch, id) = open_instance(root, needle)?;
    let instance = orch
        .inspect(id)
        .with_context(|| format!("failed to load instance {id}"))?;
    let history = orch.checkpoints(id)?;
    let phase = instance.current_phase_def()?;
    let results = instance.results_for(&phase.name);
    let evaluation = gate::evaluate(phase, results);

    if json {
        let checkpoints: Vec<serde_json::Value> = history
            .iter()
            .map(|item| {
                serde_json::json!({
                    "id": item.checkpoint.id,
                    "phase": item.checkpoint.phase,
                    "reason": item.checkpoint.reason,
                    "created_at": item.checkpoint.created_at,
                    "superseded": item.superseded,
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "id": instance.id,
            "template": instance.template_id(),
            "created_at": instance.created_at,
            "lifecycle": instance.lifecycle(),
            "current_phase": instance.current_phase(),
            "phases": instance.state.phases,
            "gate_results": instance.state.gate_results,
            "skipped": instance.state.skipped,
            "unmet": evaluation.unmet,
            "checkpoints": checkpoints,
        }))?;
        return Ok(());
    }

    println!("Instance:  {}", instance.id);
    println!("Template:  {}", instance.template_id());
    println!("Lifecycle: {}", instance.lifecycle());
    println!(
        "Phase:     {} ({})",
        instance.current_phase(),
        instance.phase_status()
    );

    println!();
    print_table(&["", "PHASE", "STATUS"], phase_rows(&instance));

    if !phase.gates.is_empty() {
        println!();
        let rows: Vec<Vec<String>> = phase
            .gates
            .iter()
            .map(|g| {
                let result = results.and_then(|r| r.get(&g.id));
                let status = match result {
                    Some(r) if r.satisfies(g) => "satisfied".to_string(),
                    Some(r) => format!("missing {}", r.missing(g).join(", ")),
                    None => "not evaluated".to_string(),
                };
                vec![
                    g.id.clone(),
                    if g.mandatory { "mandatory" } else { "optional" }.to_string(),
                    status,
                    result.map(|r| r.evaluated_by.clone()).unwrap_or_default(),
                ]
            })
            .collect();
        print_table(&["GATE", "KIND", "STATUS", "BY"], rows);
    }

    println!();
    if history.is_empty() {
        println!("No checkpoints.");
    } else {
        print_table(&["CHECKPOINT", "PHASE", "REASON", "CREATED", ""], history.iter());
    }
    Ok(())
}
