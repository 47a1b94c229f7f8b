use crate::error::{Result, WorkflowError};
use crate::paths;
use crate::template::TemplateRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ActionBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionBackend {
    /// Run under `sh -c` in the workspace root.
    Shell {
        command: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// A step performed by a person; succeeds immediately.
    Manual { prompt: String },
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_action_timeout")]
    pub default_action_timeout_seconds: u64,
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionBackend>,
}

fn default_version() -> u32 {
    1
}

fn default_action_timeout() -> u64 {
    300
}

fn default_max_output() -> usize {
    10 * 1024
}

fn placeholder(action: &str) -> ActionBackend {
    ActionBackend::Shell {
        command: format!(
            "echo \"configure the '{action}' action in .workflow/config.yaml\" >&2; exit 1"
        ),
        env: BTreeMap::new(),
    }
}

impl Default for Config {
    /// Backends for every action of the built-in `delivery` template.
    fn default() -> Self {
        let mut actions = BTreeMap::new();
        actions.insert(
            "design-review".to_string(),
            ActionBackend::Manual {
                prompt: "Review the design documents with the team".to_string(),
            },
        );
        actions.insert(
            "code-review".to_string(),
            ActionBackend::Manual {
                prompt: "Request a code review".to_string(),
            },
        );
        for name in ["run-tests", "deploy", "smoke-test"] {
            actions.insert(name.to_string(), placeholder(name));
        }
        Self {
            version: default_version(),
            default_action_timeout_seconds: default_action_timeout(),
            max_output_bytes: default_max_output(),
            actions,
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(WorkflowError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        if cfg.default_action_timeout_seconds == 0 {
            return Err(WorkflowError::InvalidConfig(
                "default_action_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn default_action_timeout(&self) -> Duration {
        Duration::from_secs(self.default_action_timeout_seconds)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Check the config against the templates it serves.
    pub fn validate(&self, templates: &TemplateRegistry) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.default_action_timeout_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "default_action_timeout_seconds must be greater than zero".to_string(),
            });
        }

        if self.max_output_bytes < 256 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "max_output_bytes={} truncates almost all action output",
                    self.max_output_bytes
                ),
            });
        }

        for (name, backend) in &self.actions {
            match backend {
                ActionBackend::Shell { command, .. } if command.trim().is_empty() => {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Warning,
                        message: format!("action '{name}' has an empty command"),
                    });
                }
                ActionBackend::Manual { prompt } if prompt.trim().is_empty() => {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Warning,
                        message: format!("manual action '{name}' has an empty prompt"),
                    });
                }
                _ => {}
            }
        }

        for rejected in templates.rejected() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "template file {} is invalid: {}",
                    rejected.path.display(),
                    rejected.error
                ),
            });
        }

        // Actions referenced by templates but never configured fail at
        // dispatch time; mandatory ones block their phase.
        let mut referenced = std::collections::BTreeSet::new();
        for template in templates.list() {
            for phase in &template.phases {
                for action in &phase.actions {
                    referenced.insert(action.name.as_str());
                    if self.actions.contains_key(&action.name) {
                        continue;
                    }
                    let level = if action.mandatory {
                        WarnLevel::Error
                    } else {
                        WarnLevel::Warning
                    };
                    warnings.push(ConfigWarning {
                        level,
                        message: format!(
                            "template '{}' phase '{}' references unconfigured action '{}'",
                            template.id, phase.name, action.name
                        ),
                    });
                }
            }
        }

        for name in self.actions.keys() {
            if !referenced.contains(name.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("action '{name}' is not used by any template"),
                });
            }
        }

        warnings
    }
}
