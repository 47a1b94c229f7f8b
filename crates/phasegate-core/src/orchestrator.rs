//! Orchestrator facade: the public API over templates, the instance log,
//! checkpoints, the gate machine and the dispatcher.
//!
//! Writes to one instance are serialised by an in-process keyed lock;
//! distinct instances never contend. Every operation reloads the instance
//! by replaying its log, so callers never hold stale state.

use crate::action::ActionRegistry;
use crate::checkpoint::{Checkpoint, CheckpointHistory, CheckpointReason, CheckpointStore};
use crate::config::Config;
use crate::dispatch::{ActionInvocation, CancelToken, PhaseDispatcher};
use crate::error::{Result, WorkflowError};
use crate::gate::GateResult;
use crate::instance::WorkflowInstance;
use crate::machine::GateMachine;
use crate::paths;
use crate::store::{InstanceHeader, InstanceLog, LogRecord, RedbLog};
use crate::template::TemplateRegistry;
use crate::types::{Lifecycle, PhaseStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Settings / options / outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub default_action_timeout: Duration,
    pub max_output_bytes: usize,
    /// Workspace root handed to actions.
    pub root: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            default_action_timeout: config.default_action_timeout(),
            max_output_bytes: config.max_output_bytes,
            root: None,
        }
    }
}

impl Settings {
    pub fn from_config(config: &Config, root: &Path) -> Self {
        Self {
            default_action_timeout: config.default_action_timeout(),
            max_output_bytes: config.max_output_bytes,
            root: Some(root.to_path_buf()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdvanceOptions {
    pub cancel: Option<CancelToken>,
    /// Replaces every action's timeout for this advance.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct AdvanceOutcome {
    pub instance: WorkflowInstance,
    /// The phase this advance completed. `None` when the call only stepped
    /// off a phase that was already complete.
    pub completed_phase: Option<String>,
    pub checkpoint: Option<Checkpoint>,
    /// Optional gates recorded as skipped on completion.
    pub skipped: Vec<String>,
    pub invocations: Vec<ActionInvocation>,
}

// ---------------------------------------------------------------------------
// Instance locks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InstanceLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    /// Run `f` holding the lock of instance `id`. The entry is dropped once
    /// no other caller holds or waits on it.
    fn with<T>(&self, id: Uuid, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let handle = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(id).or_default())
        };
        let result = {
            let _guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&handle) == 2 {
            map.remove(&id);
        }
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    templates: TemplateRegistry,
    log: Arc<dyn InstanceLog>,
    checkpoints: CheckpointStore,
    actions: ActionRegistry,
    settings: Settings,
    locks: InstanceLocks,
}

impl Orchestrator {
    pub fn new(
        templates: TemplateRegistry,
        log: Arc<dyn InstanceLog>,
        actions: ActionRegistry,
        settings: Settings,
    ) -> Self {
        Self {
            templates,
            checkpoints: CheckpointStore::new(Arc::clone(&log)),
            log,
            actions,
            settings,
            locks: InstanceLocks::default(),
        }
    }

    /// Open the workspace at `root`: config, project templates and the
    /// per-instance redb logs.
    pub fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        let templates = TemplateRegistry::open(root)?;
        let log = RedbLog::open(&paths::instances_dir(root))?;
        let actions = ActionRegistry::from_config(&config, root);
        Ok(Self::new(
            templates,
            Arc::new(log),
            actions,
            Settings::from_config(&config, root),
        ))
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    fn load(&self, id: Uuid) -> Result<WorkflowInstance> {
        WorkflowInstance::replay(&self.log.entries(id)?)
    }

    fn append(&self, instance: &mut WorkflowInstance, records: Vec<LogRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let entries = self.log.append(instance.id, records)?;
        if let Some(last) = entries.last() {
            instance.last_seq = last.seq;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Create an instance of `template_id` at its entry phase, NOT_STARTED.
    pub fn start(&self, template_id: &str) -> Result<WorkflowInstance> {
        let template = self.templates.get(template_id)?;
        let header = InstanceHeader {
            id: Uuid::new_v4(),
            template_id: template.id.clone(),
            created_at: Utc::now(),
        };
        let entry = self.log.create(&header, &template)?;
        let instance = WorkflowInstance::replay(&[entry])?;
        tracing::info!(
            instance = %instance.id,
            template = %template.id,
            phase = %instance.current_phase(),
            "instance started"
        );
        Ok(instance)
    }

    // -----------------------------------------------------------------------
    // Advance
    // -----------------------------------------------------------------------

    pub fn advance(&self, id: Uuid) -> Result<AdvanceOutcome> {
        self.advance_with(id, AdvanceOptions::default())
    }

    /// Try to complete the current phase and move to the next one.
    ///
    /// Persistence happens in three steps: the phase start and gate results
    /// first, then the completion together with its checkpoint as one atomic
    /// batch, then the move to the next phase. A failure at any step leaves
    /// the instance at the last step that committed.
    pub fn advance_with(&self, id: Uuid, options: AdvanceOptions) -> Result<AdvanceOutcome> {
        self.locks.with(id, || {
            let mut instance = self.load(id)?;
            instance.ensure_active()?;
            let template = instance.template.clone();
            let machine = GateMachine::new(&template);

            // A completed current phase (after rolling back to its checkpoint)
            // only needs the pointer moved.
            if instance.phase_status() == PhaseStatus::Complete {
                let mut records = Vec::new();
                machine.advance_pointer(&mut instance, &mut records)?;
                self.append(&mut instance, records)?;
                tracing::info!(
                    instance = %id,
                    phase = %instance.current_phase(),
                    lifecycle = %instance.lifecycle(),
                    "moved past completed phase"
                );
                return Ok(AdvanceOutcome {
                    instance,
                    completed_phase: None,
                    checkpoint: None,
                    skipped: Vec::new(),
                    invocations: Vec::new(),
                });
            }

            let mut pending = Vec::new();
            machine.start_phase(&mut instance, &mut pending)?;
            let phase = instance.current_phase_def()?.clone();

            let dispatcher = PhaseDispatcher::new(
                &self.actions,
                self.settings.default_action_timeout,
                self.settings.max_output_bytes,
            )
            .with_timeout(options.timeout)
            .with_root(self.settings.root.as_deref());
            let mut record = |invocation: &ActionInvocation| -> Result<()> {
                self.log
                    .append(id, vec![LogRecord::Invocation(invocation.clone())])
                    .map(|_| ())
            };
            let dispatch =
                dispatcher.dispatch(&instance, &phase, options.cancel.as_ref(), &mut record)?;
            for invocation in &dispatch.invocations {
                instance.apply(&LogRecord::Invocation(invocation.clone()));
            }

            if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                tracing::info!(instance = %id, phase = %phase.name, "advance cancelled");
                return Err(WorkflowError::Cancelled(id));
            }

            for result in dispatch.gate_results {
                machine.submit(&mut instance, result, &mut pending)?;
            }
            if dispatch.failure.is_none() {
                machine.unblock(&mut instance, &mut pending)?;
            }

            let evaluation = machine.evaluate(&instance)?;
            if dispatch.failure.is_some() || !evaluation.is_satisfied() {
                machine.block(&mut instance, &mut pending);
                self.append(&mut instance, pending)?;
                tracing::warn!(
                    instance = %id,
                    phase = %phase.name,
                    unmet = evaluation.unmet.len(),
                    "phase blocked"
                );
                return Err(match dispatch.failure {
                    Some(failure) if evaluation.is_satisfied() => failure.into_error(),
                    failure => WorkflowError::GateNotSatisfied {
                        phase: phase.name.clone(),
                        unmet: evaluation.unmet,
                        action_failure: failure,
                    },
                });
            }
            self.append(&mut instance, pending)?;

            let mut completed = instance.clone();
            let mut completion = Vec::new();
            let skipped = machine.complete(&mut completed, &mut completion)?;
            let checkpoint = self.checkpoints.save_with(
                id,
                &completed.state,
                CheckpointReason::PhaseComplete,
                completion,
            )?;
            completed.apply(&LogRecord::Checkpoint(checkpoint.clone()));
            instance = completed;
            tracing::info!(
                instance = %id,
                phase = %phase.name,
                checkpoint = %checkpoint.id,
                "phase complete"
            );

            let mut tail = Vec::new();
            machine.advance_pointer(&mut instance, &mut tail)?;
            self.append(&mut instance, tail)?;
            if instance.lifecycle() == Lifecycle::Completed {
                tracing::info!(instance = %id, "instance completed");
            }

            Ok(AdvanceOutcome {
                instance,
                completed_phase: Some(phase.name),
                checkpoint: Some(checkpoint),
                skipped,
                invocations: dispatch.invocations,
            })
        })
    }

    // -----------------------------------------------------------------------
    // Rollback / inspect
    // -----------------------------------------------------------------------

    /// Restore the instance to `checkpoint_id`. Abandoned instances cannot
    /// be rolled back; completed ones reopen.
    pub fn rollback(&self, id: Uuid, checkpoint_id: Uuid) -> Result<WorkflowInstance> {
        self.locks.with(id, || {
            let instance = self.load(id)?;
            if instance.lifecycle() == Lifecycle::Abandoned {
                return Err(WorkflowError::InstanceClosed {
                    id,
                    lifecycle: Lifecycle::Abandoned,
                });
            }
            self.checkpoints.restore(id, checkpoint_id)
        })
    }

    pub fn inspect(&self, id: Uuid) -> Result<WorkflowInstance> {
        self.load(id)
    }

    // -----------------------------------------------------------------------
    // Gate submission / on-demand checkpoints
    // -----------------------------------------------------------------------

    /// Record externally produced gate evidence for the current phase.
    pub fn submit_gate_result(&self, id: Uuid, result: GateResult) -> Result<WorkflowInstance> {
        self.locks.with(id, || {
            let mut instance = self.load(id)?;
            let template = instance.template.clone();
            let mut records = Vec::new();
            GateMachine::new(&template).submit(&mut instance, result, &mut records)?;
            self.append(&mut instance, records)?;
            Ok(instance)
        })
    }

    pub fn checkpoint(&self, id: Uuid) -> Result<Checkpoint> {
        self.locks.with(id, || {
            let instance = self.load(id)?;
            instance.ensure_active()?;
            self.checkpoints
                .save(id, &instance.state, CheckpointReason::OnDemand)
        })
    }

    pub fn checkpoints(&self, id: Uuid) -> Result<CheckpointHistory> {
        self.checkpoints.list_all(id)
    }

    // -----------------------------------------------------------------------
    // Override / abandon
    // -----------------------------------------------------------------------

    /// Administrative jump to a later phase, bypassing gates.
    pub fn override_phase(
        &self,
        id: Uuid,
        target: &str,
        actor: &str,
        reason: &str,
    ) -> Result<(WorkflowInstance, Checkpoint)> {
        self.locks.with(id, || {
            let mut instance = self.load(id)?;
            let template = instance.template.clone();
            let mut records = Vec::new();
            GateMachine::new(&template).override_to(&mut instance, target, actor, reason, &mut records)?;
            let checkpoint =
                self.checkpoints
                    .save_with(id, &instance.state, CheckpointReason::Override, records)?;
            Ok((self.load(id)?, checkpoint))
        })
    }

    pub fn abandon(&self, id: Uuid, reason: Option<String>) -> Result<WorkflowInstance> {
        self.locks.with(id, || {
            let mut instance = self.load(id)?;
            let template = instance.template.clone();
            let mut records = Vec::new();
            GateMachine::new(&template).abandon(&mut instance, reason, &mut records)?;
            self.append(&mut instance, records)?;
            tracing::info!(instance = %id, "instance abandoned");
            Ok(instance)
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Every instance, oldest first.
    pub fn list(&self) -> Result<Vec<WorkflowInstance>> {
        self.log
            .instances()?
            .into_iter()
            .map(|h| self.load(h.id))
            .collect()
    }

    /// Every action invocation of the instance, including those on branches
    /// later abandoned by a rollback.
    pub fn audit(&self, id: Uuid) -> Result<Vec<ActionInvocation>> {
        Ok(self
            .log
            .entries(id)?
            .into_iter()
            .filter_map(|e| match e.record {
                LogRecord::Invocation(inv) => Some(inv),
                _ => None,
            })
            .collect())
    }

    /// Resolve a full id or a unique id prefix.
    pub fn resolve_instance(&self, needle: &str) -> Result<Uuid> {
        if let Ok(id) = Uuid::parse_str(needle) {
            return Ok(id);
        }
        let needle = needle.to_ascii_lowercase();
        if needle.is_empty() {
            return Err(WorkflowError::InstanceNotFound(needle));
        }
        let matches: Vec<Uuid> = self
            .log
            .ids()?
            .into_iter()
            .filter(|id| id.to_string().starts_with(&needle))
            .collect();
        match matches.as_slice() {
            [id] => Ok(*id),
            [] => Err(WorkflowError::InstanceNotFound(needle)),
            _ => Err(WorkflowError::AmbiguousInstance(needle)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionResult, InstanceContext};
    use crate::store::{LogEntry, MemoryLog};
    use crate::template::{SourceFormat, WorkflowTemplate};
    use crate::types::Outcome;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const TWO_PHASE: &str = "
id: design-build
phases:
  - name: design
    gates:
      - id: D3
        criteria: [doc_approved]
      - id: D4
        criteria: [risks_listed]
        mandatory: false
  - name: build
    gates:
      - id: B1
        criteria: [compiles]
";

    fn registry(yaml: &str) -> TemplateRegistry {
        let mut registry = TemplateRegistry::new();
        registry.register(WorkflowTemplate::parse(yaml, SourceFormat::Yaml).unwrap());
        registry
    }

    fn orchestrator(yaml: &str, actions: ActionRegistry) -> Orchestrator {
        Orchestrator::new(
            registry(yaml),
            Arc::new(MemoryLog::new()),
            actions,
            Settings::default(),
        )
    }

    fn approve(orch: &Orchestrator, id: Uuid) {
        orch.submit_gate_result(
            id,
            GateResult::new("design", "D3", ["doc_approved"], "reviewer"),
        )
        .unwrap();
    }

    /// Fails every append that would store a checkpoint while armed.
    struct CheckpointFailingLog {
        inner: MemoryLog,
        armed: AtomicBool,
    }

    impl InstanceLog for CheckpointFailingLog {
        fn create(
            &self,
            header: &InstanceHeader,
            template: &WorkflowTemplate,
        ) -> Result<LogEntry> {
            self.inner.create(header, template)
        }

        fn append(&self, instance: Uuid, records: Vec<LogRecord>) -> Result<Vec<LogEntry>> {
            let has_checkpoint = records
                .iter()
                .any(|r| matches!(r, LogRecord::Checkpoint(_)));
            if has_checkpoint && self.armed.load(Ordering::SeqCst) {
                return Err(WorkflowError::StorageUnavailable("disk full".to_string()));
            }
            self.inner.append(instance, records)
        }

        fn entries(&self, instance: Uuid) -> Result<Vec<LogEntry>> {
            self.inner.entries(instance)
        }

        fn instances(&self) -> Result<Vec<InstanceHeader>> {
            self.inner.instances()
        }
    }

    // ---- Scenarios ----

    #[test]
    fn advance_without_evidence_blocks() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let inst = orch.start("design-build").unwrap();
        assert_eq!(inst.current_phase(), "design");
        assert_eq!(inst.phase_status(), PhaseStatus::NotStarted);

        let err = orch.advance(inst.id).unwrap_err();
        match err {
            WorkflowError::GateNotSatisfied {
                phase,
                unmet,
                action_failure,
            } => {
                assert_eq!(phase, "design");
                assert_eq!(unmet.len(), 1);
                assert_eq!(unmet[0].gate_id, "D3");
                assert_eq!(unmet[0].missing, ["doc_approved"]);
                assert!(action_failure.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            orch.inspect(inst.id).unwrap().phase_status(),
            PhaseStatus::Blocked
        );
    }

    #[test]
    fn advance_with_one_of_two_mandatory_gates_lists_only_the_unmet_one() {
        let yaml = "\
id: two-gates
phases:
  - name: review
    gates:
      - id: R1
        criteria: [code_read]
      - id: R2
        criteria: [tests_read]
  - name: merge
";
        let orch = orchestrator(yaml, ActionRegistry::new());
        let inst = orch.start("two-gates").unwrap();
        orch.submit_gate_result(
            inst.id,
            GateResult::new("review", "R1", ["code_read"], "reviewer"),
        )
        .unwrap();

        match orch.advance(inst.id).unwrap_err() {
            WorkflowError::GateNotSatisfied { phase, unmet, .. } => {
                assert_eq!(phase, "review");
                assert_eq!(unmet.len(), 1);
                assert_eq!(unmet[0].gate_id, "R2");
                assert_eq!(unmet[0].missing, ["tests_read"]);
                assert!(!unmet[0].evaluated);
            }
            other => panic!("unexpected error: {other}"),
        }
        let now = orch.inspect(inst.id).unwrap();
        assert_eq!(now.current_phase(), "review");
        assert_eq!(now.phase_status(), PhaseStatus::Blocked);
    }

    #[test]
    fn instance_locks_are_released_after_use() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let inst = orch.start("design-build").unwrap();
        assert!(orch.advance(inst.id).is_err());
        approve(&orch, inst.id);
        orch.checkpoint(inst.id).unwrap();
        orch.advance(inst.id).unwrap();
        assert_eq!(orch.locks.len(), 0);
    }

    #[test]
    fn submitted_evidence_completes_phase_with_checkpoint() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let inst = orch.start("design-build").unwrap();
        let _ = orch.advance(inst.id);
        approve(&orch, inst.id);

        let outcome = orch.advance(inst.id).unwrap();
        assert_eq!(outcome.completed_phase.as_deref(), Some("design"));
        assert_eq!(outcome.skipped, ["D4"]);
        let checkpoint = outcome.checkpoint.unwrap();
        assert_eq!(checkpoint.reason, CheckpointReason::PhaseComplete);
        assert_eq!(checkpoint.snapshot.status_of("design"), PhaseStatus::Complete);

        let now = orch.inspect(inst.id).unwrap();
        assert_eq!(now.current_phase(), "build");
        assert_eq!(now.state.status_of("design"), PhaseStatus::Complete);
        assert_eq!(now.phase_status(), PhaseStatus::NotStarted);
        assert_eq!(now, outcome.instance);
    }

    #[test]
    fn rollback_restores_checkpoint_state_exactly() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let inst = orch.start("design-build").unwrap();
        approve(&orch, inst.id);
        let c1 = orch.advance(inst.id).unwrap().checkpoint.unwrap();

        let restored = orch.rollback(inst.id, c1.id).unwrap();
        assert_eq!(restored.current_phase(), "design");
        assert_eq!(restored.phase_status(), PhaseStatus::Complete);
        let mut expected = c1.snapshot.clone();
        expected.checkpoints.push(c1.id);
        assert_eq!(restored.state, expected);
        assert_eq!(orch.inspect(inst.id).unwrap().state, expected);

        // The next advance steps onto the following phase.
        let moved = orch.advance(inst.id).unwrap();
        assert!(moved.completed_phase.is_none());
        assert_eq!(moved.instance.current_phase(), "build");
    }

    #[test]
    fn mandatory_action_timeout_blocks_with_failure_attached() {
        let yaml = "
id: timed
phases:
  - name: design
    gates:
      - id: D3
        criteria: [doc_approved]
    actions:
      - name: hang
        timeout_seconds: 1
        grants:
          D3: [doc_approved]
";
        let mut actions = ActionRegistry::new();
        actions.register("hang", |_: &str, _: &InstanceContext, _: Duration| {
            std::thread::sleep(Duration::from_secs(3));
            ActionResult::success("too late")
        });
        let orch = orchestrator(yaml, actions);
        let inst = orch.start("timed").unwrap();

        let err = orch.advance(inst.id).unwrap_err();
        match err {
            WorkflowError::GateNotSatisfied { action_failure, .. } => {
                let failure = action_failure.unwrap();
                assert_eq!(failure.action, "hang");
                assert_eq!(failure.outcome, Outcome::Timeout);
            }
            other => panic!("unexpected error: {other}"),
        }
        let audit = orch.audit(inst.id).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].outcome, Outcome::Timeout);
        assert_eq!(
            orch.inspect(inst.id).unwrap().phase_status(),
            PhaseStatus::Blocked
        );
    }

    // ---- Properties ----

    #[test]
    fn action_grants_satisfy_gates() {
        let yaml = "
id: granted
phases:
  - name: test
    gates:
      - id: G3
        criteria: [tests_passed]
    actions:
      - name: run-tests
        grants:
          G3: [tests_passed]
  - name: deploy
";
        let mut actions = ActionRegistry::new();
        actions.register("run-tests", |_: &str, _: &InstanceContext, _: Duration| {
            ActionResult::success("ok")
        });
        let orch = orchestrator(yaml, actions);
        let inst = orch.start("granted").unwrap();

        let outcome = orch.advance(inst.id).unwrap();
        assert_eq!(outcome.invocations.len(), 1);
        let results = outcome.instance.results_for("test").unwrap();
        assert_eq!(results["G3"].evaluated_by, "run-tests");
        assert_eq!(outcome.instance.current_phase(), "deploy");
    }

    #[test]
    fn failed_mandatory_action_with_met_gates_is_action_failed() {
        let yaml = "
id: failing
phases:
  - name: deploy
    actions:
      - name: deploy
";
        let mut actions = ActionRegistry::new();
        actions.register("deploy", |_: &str, _: &InstanceContext, _: Duration| {
            ActionResult::failure("connection refused")
        });
        let orch = orchestrator(yaml, actions);
        let inst = orch.start("failing").unwrap();

        let err = orch.advance(inst.id).unwrap_err();
        assert!(matches!(err, WorkflowError::ActionFailed { ref action, .. } if action == "deploy"));
        assert_eq!(
            orch.inspect(inst.id).unwrap().phase_status(),
            PhaseStatus::Blocked
        );
    }

    #[test]
    fn blocked_phase_without_gates_completes_once_action_succeeds() {
        let yaml = "
id: retry
phases:
  - name: deploy
    actions:
      - name: deploy
";
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&healthy);
        let mut actions = ActionRegistry::new();
        actions.register("deploy", move |_: &str, _: &InstanceContext, _: Duration| {
            if flag.load(Ordering::SeqCst) {
                ActionResult::success("deployed")
            } else {
                ActionResult::failure("connection refused")
            }
        });
        let orch = orchestrator(yaml, actions);
        let inst = orch.start("retry").unwrap();
        assert!(orch.advance(inst.id).is_err());

        healthy.store(true, Ordering::SeqCst);
        let outcome = orch.advance(inst.id).unwrap();
        assert_eq!(outcome.instance.lifecycle(), Lifecycle::Completed);
        assert_eq!(orch.audit(inst.id).unwrap().len(), 2);
    }

    #[test]
    fn phases_complete_in_template_order() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let inst = orch.start("design-build").unwrap();
        let err = orch
            .submit_gate_result(inst.id, GateResult::new("build", "B1", ["compiles"], "ci"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::PhaseOrderViolation { .. }));

        approve(&orch, inst.id);
        orch.advance(inst.id).unwrap();
        orch.submit_gate_result(inst.id, GateResult::new("build", "B1", ["compiles"], "ci"))
            .unwrap();
        let done = orch.advance(inst.id).unwrap().instance;
        assert_eq!(done.lifecycle(), Lifecycle::Completed);
        assert!(matches!(
            orch.advance(inst.id),
            Err(WorkflowError::InstanceClosed { .. })
        ));
    }

    #[test]
    fn identical_resubmission_changes_nothing() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let inst = orch.start("design-build").unwrap();
        let result = GateResult::new("design", "D3", ["doc_approved"], "reviewer");
        let first = orch.submit_gate_result(inst.id, result.clone()).unwrap();
        let second = orch.submit_gate_result(inst.id, result).unwrap();
        assert_eq!(first, second);
        assert!(orch.checkpoints(inst.id).unwrap().is_empty());
    }

    #[test]
    fn partial_criteria_keep_phase_blocked() {
        let yaml = "
id: partial
phases:
  - name: design
    gates:
      - id: D1
        criteria: [requirements_documented, stakeholders_identified]
";
        let orch = orchestrator(yaml, ActionRegistry::new());
        let inst = orch.start("partial").unwrap();
        orch.submit_gate_result(
            inst.id,
            GateResult::new("design", "D1", ["requirements_documented"], "pm"),
        )
        .unwrap();
        let err = orch.advance(inst.id).unwrap_err();
        match err {
            WorkflowError::GateNotSatisfied { unmet, .. } => {
                assert_eq!(unmet[0].missing, ["stakeholders_identified"]);
                assert!(unmet[0].evaluated);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn checkpoint_save_failure_leaves_phase_in_progress() {
        let log = Arc::new(CheckpointFailingLog {
            inner: MemoryLog::new(),
            armed: AtomicBool::new(true),
        });
        let orch = Orchestrator::new(
            registry(TWO_PHASE),
            Arc::clone(&log) as Arc<dyn InstanceLog>,
            ActionRegistry::new(),
            Settings::default(),
        );
        let inst = orch.start("design-build").unwrap();
        approve(&orch, inst.id);

        let err = orch.advance(inst.id).unwrap_err();
        assert!(matches!(err, WorkflowError::StorageUnavailable(_)));
        let after = orch.inspect(inst.id).unwrap();
        assert_eq!(after.current_phase(), "design");
        assert_eq!(after.phase_status(), PhaseStatus::InProgress);
        assert!(after.state.skipped.is_empty());

        log.armed.store(false, Ordering::SeqCst);
        let outcome = orch.advance(inst.id).unwrap();
        assert_eq!(outcome.instance.current_phase(), "build");
    }

    #[test]
    fn cancelled_advance_leaves_state_unchanged() {
        let yaml = "
id: cancellable
phases:
  - name: test
    gates:
      - id: G3
        criteria: [tests_passed]
    actions:
      - name: first
        grants:
          G3: [tests_passed]
      - name: second
";
        let token = CancelToken::new();
        let trip = token.clone();
        let mut actions = ActionRegistry::new();
        actions.register("first", move |_: &str, _: &InstanceContext, _: Duration| {
            trip.cancel();
            ActionResult::success("ok")
        });
        actions.register("second", |_: &str, _: &InstanceContext, _: Duration| {
            ActionResult::success("ok")
        });
        let orch = orchestrator(yaml, actions);
        let inst = orch.start("cancellable").unwrap();

        let err = orch
            .advance_with(
                inst.id,
                AdvanceOptions {
                    cancel: Some(token),
                    timeout: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled(_)));

        let after = orch.inspect(inst.id).unwrap();
        assert_eq!(after.phase_status(), PhaseStatus::NotStarted);
        assert!(after.results_for("test").is_none());
        // Only the audit record of the action that ran survives.
        assert_eq!(orch.audit(inst.id).unwrap().len(), 1);
    }

    #[test]
    fn override_is_logged_and_checkpointed() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let inst = orch.start("design-build").unwrap();
        let (after, checkpoint) = orch
            .override_phase(inst.id, "build", "ops", "design signed off offline")
            .unwrap();
        assert_eq!(after.current_phase(), "build");
        assert!(after.state.phases[0].overridden);
        assert_eq!(checkpoint.reason, CheckpointReason::Override);

        let entries = orch.log.entries(inst.id).unwrap();
        assert!(entries.iter().any(|e| matches!(
            &e.record,
            LogRecord::Override { actor, .. } if actor == "ops"
        )));
        assert_eq!(orch.inspect(inst.id).unwrap(), after);
    }

    #[test]
    fn rollback_supersedes_later_checkpoints_and_branches() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let inst = orch.start("design-build").unwrap();
        let c0 = orch.checkpoint(inst.id).unwrap();
        approve(&orch, inst.id);
        let c1 = orch.advance(inst.id).unwrap().checkpoint.unwrap();

        orch.rollback(inst.id, c0.id).unwrap();
        let c2 = orch.checkpoint(inst.id).unwrap();
        assert_eq!(c2.parent, Some(c0.id));

        let history = orch.checkpoints(inst.id).unwrap();
        let flags: Vec<(Uuid, bool)> = history
            .iter()
            .map(|item| (item.checkpoint.id, item.superseded))
            .collect();
        assert_eq!(flags, [(c0.id, false), (c1.id, true), (c2.id, false)]);
        assert!(c2.created_at > c1.created_at);
    }

    #[test]
    fn rollback_to_foreign_checkpoint_fails() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let a = orch.start("design-build").unwrap();
        let b = orch.start("design-build").unwrap();
        let foreign = orch.checkpoint(b.id).unwrap();
        assert!(matches!(
            orch.rollback(a.id, foreign.id),
            Err(WorkflowError::CheckpointNotFound { .. })
        ));
    }

    #[test]
    fn abandoned_instance_rejects_writes() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let inst = orch.start("design-build").unwrap();
        let c0 = orch.checkpoint(inst.id).unwrap();
        orch.abandon(inst.id, Some("superseded".to_string())).unwrap();

        assert!(matches!(
            orch.advance(inst.id),
            Err(WorkflowError::InstanceClosed { .. })
        ));
        assert!(matches!(
            orch.rollback(inst.id, c0.id),
            Err(WorkflowError::InstanceClosed { .. })
        ));
    }

    #[test]
    fn unknown_template_is_a_template_error() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        assert!(matches!(
            orch.start("nope"),
            Err(WorkflowError::Template(_))
        ));
    }

    #[test]
    fn resolve_instance_by_prefix() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let inst = orch.start("design-build").unwrap();
        let prefix = &inst.id.to_string()[..8];
        assert_eq!(orch.resolve_instance(prefix).unwrap(), inst.id);
        assert!(matches!(
            orch.resolve_instance("zzzz"),
            Err(WorkflowError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn distinct_instances_advance_concurrently() {
        let orch = orchestrator(TWO_PHASE, ActionRegistry::new());
        let ids: Vec<Uuid> = (0..4)
            .map(|_| orch.start("design-build").unwrap().id)
            .collect();
        std::thread::scope(|s| {
            for &id in &ids {
                let orch = &orch;
                s.spawn(move || {
                    approve(orch, id);
                    orch.advance(id).unwrap();
                });
            }
        });
        for id in ids {
            assert_eq!(orch.inspect(id).unwrap().current_phase(), "build");
        }
        assert_eq!(orch.locks.len(), 0);
    }

    #[test]
    fn redb_instance_file_is_free_while_actions_run() {
        let yaml = "
id: peek
phases:
  - name: check
    gates:
      - id: C1
        criteria: [log_readable]
    actions:
      - name: peek
        grants:
          C1: [log_readable]
";
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instances");
        // A second handle on the same directory, as another process would have.
        let peer = RedbLog::open(&path)
            .unwrap()
            .with_open_wait(Duration::ZERO);
        let mut actions = ActionRegistry::new();
        actions.register(
            "peek",
            move |_: &str, ctx: &InstanceContext, _: Duration| match peer.entries(ctx.instance_id) {
                Ok(entries) => ActionResult::success(format!("{} entries", entries.len())),
                Err(e) => ActionResult::failure(e.to_string()),
            },
        );
        let orch = Orchestrator::new(
            registry(yaml),
            Arc::new(RedbLog::open(&path).unwrap()),
            actions,
            Settings::default(),
        );
        let inst = orch.start("peek").unwrap();

        let outcome = orch.advance(inst.id).unwrap();
        assert_eq!(outcome.invocations[0].outcome, Outcome::Success);
        assert_eq!(outcome.completed_phase.as_deref(), Some("check"));
    }

    #[test]
    fn redb_replay_matches_live_instance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instances");
        let live = {
            let orch = Orchestrator::new(
                registry(TWO_PHASE),
                Arc::new(RedbLog::open(&path).unwrap()),
                ActionRegistry::new(),
                Settings::default(),
            );
            let inst = orch.start("design-build").unwrap();
            approve(&orch, inst.id);
            orch.advance(inst.id).unwrap().instance
        };

        let reopened = Orchestrator::new(
            TemplateRegistry::new(),
            Arc::new(RedbLog::open(&path).unwrap()),
            ActionRegistry::new(),
            Settings::default(),
        );
        // The template travels with the instance.
        assert_eq!(reopened.inspect(live.id).unwrap(), live);
        assert_eq!(reopened.list().unwrap().len(), 1);
    }
}
