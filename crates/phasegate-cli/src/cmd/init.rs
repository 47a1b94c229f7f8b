use anyhow::Context;
use phasegate_core::{config::Config, io, paths};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing workflow in: {}", root.display());

    for dir in [paths::WORKFLOW_DIR, paths::TEMPLATES_DIR, paths::INSTANCES_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    if !config_path.exists() {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    println!("\nWorkflow initialized.");
    println!("Next: workflow start delivery");
    Ok(())
}
