use super::open_instance;
use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use phasegate_core::gate::GateResult;
use std::path::Path;

#[derive(Subcommand)]
pub enum GateSubcommand {
    /// Record satisfied criteria for a gate of the current phase
    Submit {
        instance: String,
        /// Gate id (e.g. D3)
        gate: String,
        /// Satisfied criterion (repeatable: -c doc_approved -c risks_listed)
        #[arg(short = 'c', long = "criterion", value_name = "CRITERION")]
        criteria: Vec<String>,
        /// Who evaluated the gate
        #[arg(long = "by", default_value = "operator")]
        evaluated_by: String,
    },
}

pub fn run(root: &Path, subcmd: GateSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        GateSubcommand::Submit {
            instance,
            gate,
            criteria,
            evaluated_by,
        } => submit(root, &instance, &gate, criteria, &evaluated_by, json),
    }
}

fn submit(
    root: &Path,
    needle: &str,
    gate_id: &str,
    criteria: Vec<String>,
    evaluated_by: &str,
    json: bool,
) -> anyhow::Result<()> {
    let (orch, id) = open_instance(root, needle)?;
    let phase = orch.inspect(id)?.current_phase().to_string();
    let result = GateResult::new(phase.as_str(), gate_id, criteria, evaluated_by);
    let instance = orch
        .submit_gate_result(id, result)
        .with_context(|| format!("failed to submit gate '{gate_id}'"))?;

    let gate = instance
        .current_phase_def()?
        .gate(gate_id)
        .context("gate vanished from the current phase")?;
    let current = instance
        .results_for(&phase)
        .and_then(|r| r.get(gate_id))
        .context("gate result was not recorded")?;
    let missing = current.missing(gate);

    if json {
        print_json(&serde_json::json!({
            "id": instance.id,
            "phase": phase,
            "gate": gate_id,
            "satisfied": missing.is_empty(),
            "missing": missing,
            "status": instance.phase_status(),
        }))?;
    } else if missing.is_empty() {
        println!("Gate {gate_id} satisfied (phase '{phase}' is {}).", instance.phase_status());
    } else {
        println!("Gate {gate_id} recorded; still missing: {}", missing.join(", "));
    }
    Ok(())
}
