//! Shell command actions.
//!
//! The command runs under `sh -c` in the workspace root with the instance
//! exported through `WORKFLOW_*` environment variables. Exit status 0 is
//! success. If the last non-empty line of stdout is a JSON object with an
//! `evidence` map, its criteria are reported as gate evidence:
//!
//! ```text
//! {"evidence": {"G3": ["tests_passed"]}}
//! ```

use super::{Action, ActionResult, Evidence, InstanceContext};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

pub const DEFAULT_MAX_OUTPUT: usize = 10 * 1024;

#[derive(Debug, Clone)]
pub struct ShellAction {
    command: String,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    max_output: usize,
}

#[derive(Deserialize)]
struct EvidenceLine {
    evidence: Evidence,
}

impl ShellAction {
    pub fn new(command: impl Into<String>, cwd: &Path) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.to_path_buf(),
            env: BTreeMap::new(),
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }
}

impl Action for ShellAction {
    fn invoke(&self, phase: &str, ctx: &InstanceContext, timeout: Duration) -> ActionResult {
        if self.command.trim().is_empty() {
            return ActionResult::failure("empty command");
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(ctx.root.as_deref().unwrap_or(self.cwd.as_path()))
            .env("WORKFLOW_INSTANCE", ctx.instance_id.to_string())
            .env("WORKFLOW_TEMPLATE", &ctx.template_id)
            .env("WORKFLOW_PHASE", phase)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(root) = &ctx.root {
            cmd.env("WORKFLOW_ROOT", root);
        }

        let (success, stdout, stderr) = match run_with_timeout(cmd, timeout) {
            Ok(done) => done,
            Err(result) => return result,
        };

        let output = cap_output(&combine(&stdout, &stderr), self.max_output);
        if !success {
            return ActionResult::failure(output);
        }
        let mut result = ActionResult::success(output);
        result.evidence = parse_evidence(&stdout);
        result
    }
}

/// Run `cmd` to completion, killing it after `timeout`.
///
/// Stdout and stderr are drained on dedicated threads so a chatty child
/// cannot fill a pipe and stall; the wait happens on a third thread so the
/// caller can use `recv_timeout`.
fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<(bool, String, String), ActionResult> {
    let mut child = cmd
        .spawn()
        .map_err(|e| ActionResult::failure(format!("failed to spawn: {e}")))?;
    let child_pid = child.id();

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let stdout_thread = std::thread::spawn(move || read_all(stdout_handle));
    let stderr_thread = std::thread::spawn(move || read_all(stderr_handle));

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait());
    });

    let status = match rx.recv_timeout(timeout) {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(ActionResult::failure(format!("wait failed: {e}"))),
        Err(_) => {
            // Readers see EOF once the killed process closes its pipes.
            kill_process(child_pid);
            return Err(ActionResult::timeout(format!(
                "timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();
    Ok((status.success(), stdout, stderr))
}

/// Invalid UTF-8 is replaced rather than dropping the stream.
fn read_all<R: Read>(handle: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut r) = handle {
        let _ = r.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn combine(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n{stderr}")
    }
}

/// Trim and keep at most `max` bytes from the tail, on a char boundary.
pub fn cap_output(output: &str, max: usize) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

fn parse_evidence(stdout: &str) -> Evidence {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .filter(|line| line.starts_with('{'))
        .and_then(|line| serde_json::from_str::<EvidenceLine>(line).ok())
        .map(|parsed| parsed.evidence)
        .unwrap_or_default()
}

/// SIGKILL by pid. Best-effort.
fn kill_process(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
