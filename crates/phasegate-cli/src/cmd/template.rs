use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use phasegate_core::template::{registry, TemplateRegistry, TemplateSource};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum TemplateSubcommand {
    /// List built-in and project templates
    List,
    /// Print a template definition as YAML
    Show { id: String },
    /// Validate a template file without registering it
    Validate { path: PathBuf },
}

pub fn run(root: &Path, subcmd: TemplateSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        TemplateSubcommand::List => list(root, json),
        TemplateSubcommand::Show { id } => show(root, &id, json),
        TemplateSubcommand::Validate { path } => validate(&path, json),
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let templates = TemplateRegistry::open(root).context("failed to load templates")?;

    if json {
        let items: Vec<serde_json::Value> = templates
            .list()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "description": t.description,
                    "phases": t.phase_names().collect::<Vec<_>>(),
                })
            })
            .collect();
        let rejected: Vec<serde_json::Value> = templates
            .rejected()
            .map(|r| {
                serde_json::json!({
                    "path": r.path,
                    "error": r.error.to_string(),
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "templates": items,
            "rejected": rejected,
        }))?;
        return Ok(());
    }

    for rejected in templates.rejected() {
        eprintln!("invalid: {}: {}", rejected.path.display(), rejected.error);
    }

    let rows: Vec<Vec<String>> = templates
        .list()
        .map(|t| {
            vec![
                t.id.clone(),
                t.phase_names().collect::<Vec<_>>().join(" > "),
                t.description.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["ID", "PHASES", "DESCRIPTION"], rows);
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let templates = TemplateRegistry::open(root).context("failed to load templates")?;
    let template = templates.get(id)?;
    if json {
        print_json(&*template)?;
    } else {
        print!("{}", serde_yaml::to_string(&*template)?);
    }
    Ok(())
}

fn validate(path: &Path, json: bool) -> anyhow::Result<()> {
    let template = registry::load(TemplateSource::File(path.to_path_buf()))
        .with_context(|| format!("invalid template {}", path.display()))?;
    if json {
        print_json(&serde_json::json!({
            "id": template.id,
            "valid": true,
            "phases": template.phase_names().collect::<Vec<_>>(),
        }))?;
    } else {
        println!(
            "Template '{}' is valid ({} phases).",
            template.id,
            template.phases.len()
        );
    }
    Ok(())
}
