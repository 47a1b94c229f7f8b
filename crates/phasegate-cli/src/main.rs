mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, gate::GateSubcommand, template::TemplateSubcommand};
use phasegate_core::{TemplateError, WorkflowError};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "workflow",
    about = "Gate-driven workflow orchestrator: start, advance and roll back phased delivery workflows",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .workflow/ or .git/)
    #[arg(long, global = true, env = "WORKFLOW_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .workflow/ in the current project
    Init,

    /// Start a new instance of a template
    Start { template: String },

    /// Dispatch the current phase's actions and advance if its gates pass
    Advance {
        /// Instance id or unique prefix
        instance: String,
        /// Override every action timeout for this advance
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,
    },

    /// Restore an instance to a checkpoint
    Rollback {
        instance: String,
        /// Checkpoint id or unique prefix
        checkpoint: String,
    },

    /// Show an instance: phases, gate status and checkpoints
    Inspect { instance: String },

    /// List instances
    List {
        /// Include completed and abandoned instances
        #[arg(long)]
        all: bool,
    },

    /// Submit gate evidence
    Gate {
        #[command(subcommand)]
        subcommand: GateSubcommand,
    },

    /// Take an on-demand checkpoint
    Checkpoint { instance: String },

    /// Jump ahead to a later phase, bypassing gates
    Override {
        instance: String,
        /// Target phase
        phase: String,
        /// Why the gates are being bypassed (recorded in the log)
        #[arg(long)]
        reason: String,
        /// Who is overriding
        #[arg(long, default_value = "operator")]
        actor: String,
    },

    /// Close an instance without completing it
    Abandon {
        instance: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Show every action invocation of an instance
    Audit { instance: String },

    /// Inspect and validate workflow templates
    Template {
        #[command(subcommand)]
        subcommand: TemplateSubcommand,
    },

    /// Show or validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let json = cli.json;

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Start { template } => cmd::start::run(&root, &template, json),
        Commands::Advance { instance, timeout } => {
            cmd::advance::run(&root, &instance, timeout, json)
        }
        Commands::Rollback {
            instance,
            checkpoint,
        } => cmd::rollback::run(&root, &instance, &checkpoint, json),
        Commands::Inspect { instance } => cmd::inspect::run(&root, &instance, json),
        Commands::List { all } => cmd::list::run(&root, all, json),
        Commands::Gate { subcommand } => cmd::gate::run(&root, subcommand, json),
        Commands::Checkpoint { instance } => cmd::checkpoint::run(&root, &instance, json),
        Commands::Override {
            instance,
            phase,
            reason,
            actor,
        } => cmd::override_phase::run(&root, &instance, &phase, &actor, &reason, json),
        Commands::Abandon { instance, reason } => {
            cmd::abandon::run(&root, &instance, reason, json)
        }
        Commands::Audit { instance } => cmd::audit::run(&root, &instance, json),
        Commands::Template { subcommand } => cmd::template::run(&root, subcommand, json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

/// Map the root cause to the documented exit codes.
///
/// 1 gates not satisfied or any other error, 2 invalid template,
/// 3 mandatory action failed, 4 checkpoint not found.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<WorkflowError>() {
            return match e {
                WorkflowError::Template(_) => 2,
                WorkflowError::GateNotSatisfied {
                    action_failure: Some(_),
                    ..
                } => 3,
                WorkflowError::ActionFailed { .. } => 3,
                WorkflowError::CheckpointNotFound { .. } => 4,
                _ => 1,
            };
        }
        if cause.downcast_ref::<TemplateError>().is_some() {
            return 2;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use phasegate_core::dispatch::ActionFailure;
    use phasegate_core::types::Outcome;
    use uuid::Uuid;

    fn wrapped(e: WorkflowError) -> anyhow::Error {
        Err::<(), _>(e).context("failed to advance").unwrap_err()
    }

    #[test]
    fn template_errors_exit_2() {
        let e = wrapped(TemplateError::UnknownTemplate("x".to_string()).into());
        assert_eq!(exit_code(&e), 2);
    }

    #[test]
    fn gate_failures_exit_1_unless_an_action_failed() {
        let plain = wrapped(WorkflowError::GateNotSatisfied {
            phase: "design".to_string(),
            unmet: Vec::new(),
            action_failure: None,
        });
        assert_eq!(exit_code(&plain), 1);

        let with_action = wrapped(WorkflowError::GateNotSatisfied {
            phase: "test".to_string(),
            unmet: Vec::new(),
            action_failure: Some(ActionFailure {
                action: "run-tests".to_string(),
                outcome: Outcome::Timeout,
                cause: "timed out after 5s".to_string(),
            }),
        });
        assert_eq!(exit_code(&with_action), 3);
    }

    #[test]
    fn missing_checkpoint_exits_4() {
        let e = wrapped(WorkflowError::CheckpointNotFound {
            instance: Uuid::new_v4(),
            checkpoint: "abc".to_string(),
        });
        assert_eq!(exit_code(&e), 4);
    }

    #[test]
    fn advance_timeout_must_be_positive() {
        assert!(Cli::try_parse_from(["workflow", "advance", "abc", "--timeout", "0"]).is_err());
        let cli = Cli::try_parse_from(["workflow", "advance", "abc", "--timeout", "30"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Advance {
                timeout: Some(30),
                ..
            }
        ));
    }

    #[test]
    fn other_errors_exit_1() {
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
        assert_eq!(exit_code(&wrapped(WorkflowError::NotInitialized)), 1);
    }
}
