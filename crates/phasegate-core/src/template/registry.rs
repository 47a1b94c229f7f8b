use super::{SourceFormat, WorkflowTemplate};
use crate::error::{Result, TemplateError, WorkflowError};
use crate::paths;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DELIVERY_TEMPLATE: &str = include_str!("delivery.yaml");

/// Where a template definition comes from.
#[derive(Debug, Clone)]
pub enum TemplateSource {
    Yaml(String),
    Json(String),
    File(PathBuf),
}

/// Parse and validate a template from `source`.
pub fn load(source: TemplateSource) -> Result<WorkflowTemplate> {
    let template = match source {
        TemplateSource::Yaml(text) => WorkflowTemplate::parse(&text, SourceFormat::Yaml)?,
        TemplateSource::Json(text) => WorkflowTemplate::parse(&text, SourceFormat::Json)?,
        TemplateSource::File(path) => {
            let text = std::fs::read_to_string(&path)?;
            WorkflowTemplate::parse(&text, SourceFormat::from_path(&path)).inspect_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "invalid workflow template");
            })?
        }
    };
    Ok(template)
}

// ---------------------------------------------------------------------------
// TemplateRegistry
// ---------------------------------------------------------------------------

/// A project template file that failed to load.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedTemplate {
    pub path: PathBuf,
    pub error: TemplateError,
}

/// Validated templates keyed by id. Read-mostly; shared across instances
/// behind `Arc`.
///
/// Invalid project files are kept aside, keyed by file stem, instead of
/// failing the whole registry: they only matter to `start` of that template
/// and to validation commands.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Arc<WorkflowTemplate>>,
    rejected: BTreeMap<String, RejectedTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(load(TemplateSource::Yaml(DELIVERY_TEMPLATE.to_string()))?);
        Ok(registry)
    }

    /// Built-ins plus every template under `.workflow/templates/`. Project
    /// templates shadow built-ins with the same id.
    pub fn open(root: &Path) -> Result<Self> {
        let mut registry = Self::with_builtins()?;
        let dir = paths::templates_dir(root);
        if dir.is_dir() {
            registry.load_dir(&dir)?;
        }
        Ok(registry)
    }

    /// Register a validated template, returning the one it replaced.
    pub fn register(&mut self, template: WorkflowTemplate) -> Option<Arc<WorkflowTemplate>> {
        self.templates
            .insert(template.id.clone(), Arc::new(template))
    }

    /// Load every `*.yaml`, `*.yml` and `*.json` file in `dir`, in file name
    /// order. Returns the loaded template ids; files that fail to load are
    /// recorded as rejected.
    pub fn load_dir(&mut self, dir: &Path) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_template = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml" | "json")
            );
            if path.is_file() && is_template {
                files.push(path);
            }
        }
        files.sort();

        let mut ids = Vec::new();
        for path in files {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            match load(TemplateSource::File(path.clone())) {
                Ok(template) => {
                    ids.push(template.id.clone());
                    self.register(template);
                }
                Err(WorkflowError::Template(error)) => {
                    self.rejected.insert(stem, RejectedTemplate { path, error });
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "unreadable workflow template");
                    let error = TemplateError::MalformedDefinition(format!("{}: {e}", path.display()));
                    self.rejected.insert(stem, RejectedTemplate { path, error });
                }
            }
        }
        Ok(ids)
    }

    /// A rejected file named after `id` takes precedence, so `start` reports
    /// why the project's template is broken instead of falling back.
    pub fn get(&self, id: &str) -> Result<Arc<WorkflowTemplate>> {
        if let Some(rejected) = self.rejected.get(id) {
            return Err(rejected.error.clone().into());
        }
        self.templates
            .get(id)
            .cloned()
            .ok_or_else(|| TemplateError::UnknownTemplate(id.to_string()).into())
    }

    pub fn rejected(&self) -> impl Iterator<Item = &RejectedTemplate> {
        self.rejected.values()
    }

    pub fn list(&self) -> impl Iterator<Item = &Arc<WorkflowTemplate>> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
