use super::open_instance;
use crate::output::{print_json, print_table};
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, needle: &str, json: bool) -> anyhow::Result<()> {
    let (orch, id) = open_instance(root, needle)?;
    let invocations = orch
        .audit(id)
        .with_context(|| format!("failed to read audit trail of {id}"))?;

    if json {
        print_json(&invocations)?;
        return Ok(());
    }

    if invocations.is_empty() {
        println!("No action invocations.");
        return Ok(());
    }

    print_table(
        &["STARTED", "PHASE", "ACTION", "KIND", "OUTCOME", "DURATION"],
        &invocations,
    );
    Ok(())
}
