use super::open_instance;
use crate::output::print_json;
use anyhow::Context;
use phasegate_core::{AdvanceOptions, WorkflowError};
use std::path::Path;
use std::time::Duration;

pub fn run(root: &Path, needle: &str, timeout: Option<u64>, json: bool) -> anyhow::Result<()> {
    let (orch, id) = open_instance(root, needle)?;
    let options = AdvanceOptions {
        cancel: None,
        timeout: timeout.map(Duration::from_secs),
    };

    let outcome = match orch.advance_with(id, options) {
        Ok(outcome) => outcome,
        Err(e) => {
            if let WorkflowError::GateNotSatisfied {
                phase,
                unmet,
                action_failure,
            } = &e
            {
                if !json {
                    eprintln!("Phase '{phase}' is blocked:");
                    for gate in unmet {
                        eprintln!("  {gate}");
                    }
                    if let Some(f) = action_failure {
                        eprintln!("  action '{}' {}: {}", f.action, f.outcome, f.cause);
                    }
                }
            }
            return Err(e).with_context(|| format!("failed to advance instance {id}"));
        }
    };

    let instance = &outcome.instance;
    if json {
        print_json(&serde_json::json!({
            "id": instance.id,
            "completed_phase": outcome.completed_phase,
            "checkpoint": outcome.checkpoint.as_ref().map(|c| c.id),
            "skipped": outcome.skipped,
            "invocations": outcome.invocations,
            "current_phase": instance.current_phase(),
            "lifecycle": instance.lifecycle(),
        }))?;
        return Ok(());
    }

    for inv in &outcome.invocations {
        let first_line = inv.output.lines().next().unwrap_or("");
        println!("  {} [{}] {first_line}", inv.action_ref, inv.outcome);
    }
    match (&outcome.completed_phase, &outcome.checkpoint) {
        (Some(phase), Some(cp)) => println!("Completed '{phase}' (checkpoint {}).", cp.id),
        _ => println!("Moved past completed phase."),
    }
    if !outcome.skipped.is_empty() {
        println!("Skipped optional gates: {}", outcome.skipped.join(", "));
    }
    if instance.is_active() {
        println!("Current phase: {}", instance.current_phase());
    } else {
        println!("Instance {}.", instance.lifecycle());
    }
    Ok(())
}
