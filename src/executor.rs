//! Task Executor
//!
//! Drives one pre-compiled task definition against a live session:
//! ordered typed steps with per-step conditions, safety hooks before
//! every tool invocation, and human gates that suspend the run on a
//! one-shot signal with a bounded deadline. One `TaskRunState` per
//! invocation; nothing is shared across concurrent runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::confirm::{ConfirmOutcome, ConfirmationTable};
use crate::engine::{ChatTurn, GenerativeEngine, StreamDelta};
use crate::events::ProgressEvent;
use crate::registry::FunctionRegistry;
use crate::safety::SafetyEngine;
use crate::tasks::{resolve_args, resolve_path, Step, TaskDefinition};

/// Lifecycle of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    /// A gate was denied or timed out, or the run was cancelled
    Aborted,
    /// A tool step raised
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Failed => "failed",
        }
    }
}

/// State of one in-flight task execution. Terminal once status leaves
/// `Running`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRunState {
    pub run_id: String,
    pub task: String,
    pub status: TaskStatus,
    pub current_step: usize,
    /// Step name -> recorded result
    pub results: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRunState {
    fn new(task: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            task: task.to_string(),
            status: TaskStatus::Pending,
            current_step: 0,
            results: json!({}),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn record(&mut self, step: &str, value: Value) {
        self.results[step] = value;
    }
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_.]+)\}").unwrap());

/// Substitute `{step_name.path}` placeholders in an agent prompt with
/// prior results. Unresolvable placeholders stay verbatim.
fn render_prompt(template: &str, results: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match resolve_path(results, &caps[1]) {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Executes task definitions step by step.
pub struct TaskExecutor {
    registry: Arc<FunctionRegistry>,
    safety: Arc<SafetyEngine>,
    confirmations: Arc<ConfirmationTable>,
    engine: Option<Arc<dyn GenerativeEngine>>,
}

impl TaskExecutor {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        safety: Arc<SafetyEngine>,
        confirmations: Arc<ConfirmationTable>,
        engine: Option<Arc<dyn GenerativeEngine>>,
    ) -> Self {
        Self {
            registry,
            safety,
            confirmations,
            engine,
        }
    }

    /// Run one task to a terminal state, streaming progress events.
    pub async fn run(
        &self,
        task: Arc<TaskDefinition>,
        session_id: &str,
        tx: &mpsc::Sender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> TaskRunState {
        let mut state = TaskRunState::new(&task.name);
        state.status = TaskStatus::Running;
        info!(task = %task.name, run = %state.run_id, "task run started");

        let _ = tx
            .send(ProgressEvent::TaskStart {
                task: task.name.clone(),
                total_steps: task.steps.len(),
            })
            .await;

        for (index, step) in task.steps.iter().enumerate() {
            state.current_step = index;

            if cancel.is_cancelled() {
                state.status = TaskStatus::Aborted;
                break;
            }

            if let Some(condition) = step.condition() {
                if !condition.evaluate(&state.results) {
                    let _ = tx
                        .send(ProgressEvent::StepSkipped {
                            step: step.name().to_string(),
                            index,
                            reason: format!("condition on '{}' not met", condition.path),
                        })
                        .await;
                    continue;
                }
            }

            let _ = tx
                .send(ProgressEvent::StepStart {
                    step: step.name().to_string(),
                    index,
                    kind: step.kind().to_string(),
                })
                .await;

            match step {
                Step::Tool {
                    name,
                    function,
                    args,
                    args_from,
                    ..
                } => {
                    if !self
                        .run_tool_step(name, function, args, args_from, session_id, &mut state, tx)
                        .await
                    {
                        break;
                    }
                }
                Step::Agent { name, prompt, .. } => {
                    self.run_agent_step(name, prompt, &mut state, tx).await;
                }
                Step::Gate {
                    name,
                    prompt,
                    timeout_secs,
                } => {
                    if !self
                        .run_gate_step(name, prompt, *timeout_secs, &mut state, tx)
                        .await
                    {
                        state.status = TaskStatus::Aborted;
                        break;
                    }
                }
            }
        }

        if state.status == TaskStatus::Running {
            state.status = TaskStatus::Completed;
        }
        state.finished_at = Some(Utc::now());

        let summary = match state.status {
            TaskStatus::Completed => format!("{} finished", task.name),
            TaskStatus::Aborted => format!("{} aborted before completion", task.name),
            _ => format!("{} stopped: {}", task.name, state.status.as_str()),
        };
        info!(task = %task.name, run = %state.run_id, status = state.status.as_str(), "task run finished");

        let _ = tx
            .send(ProgressEvent::TaskComplete {
                task: task.name.clone(),
                status: state.status.as_str().to_string(),
                summary,
            })
            .await;

        state
    }

    /// Returns false when the run must stop.
    async fn run_tool_step(
        &self,
        name: &str,
        function: &str,
        args: &Value,
        args_from: &std::collections::HashMap<String, String>,
        session_id: &str,
        state: &mut TaskRunState,
        tx: &mpsc::Sender<ProgressEvent>,
    ) -> bool {
        let resolved = resolve_args(args, args_from, &state.results);
        let check = self.safety.classify(function, &resolved);

        let backup_ref = match self.safety.before(&check, session_id, &resolved).await {
            Ok(r) => r,
            Err(e) => {
                warn!(function = %function, error = %e, "safety hook failed");
                let _ = tx
                    .send(ProgressEvent::FunctionError {
                        function: function.to_string(),
                        message: e.to_string(),
                    })
                    .await;
                state.status = TaskStatus::Failed;
                return false;
            }
        };

        let invocation = if self.safety.dry_run() {
            Ok(crate::registry::OperationResult::ok(format!(
                "dry run: {} not executed",
                function
            )))
        } else {
            self.registry.invoke(function, resolved).await
        };

        match invocation {
            Ok(mut result) => {
                if result.backup_ref.is_none() {
                    result.backup_ref = backup_ref;
                }
                self.safety.after(&check, &result);

                let recorded = serde_json::to_value(&result).unwrap_or(Value::Null);
                let _ = tx
                    .send(ProgressEvent::FunctionResult {
                        function: function.to_string(),
                        success: result.success,
                        result: recorded.clone(),
                    })
                    .await;
                state.record(name, recorded);
                true
            }
            Err(e) => {
                warn!(function = %function, error = %e, "tool step failed");
                let _ = tx
                    .send(ProgressEvent::FunctionError {
                        function: function.to_string(),
                        message: e.to_string(),
                    })
                    .await;
                // A mutating step that failed mid-flight leaves its
                // pre-mutation backup as the latest; restore it.
                if backup_ref.is_some() {
                    match self.safety.undo(session_id).await {
                        Ok((record, _snapshot)) => {
                            info!(function = %record.function, backup = %record.id, "rolled back failed step");
                            let _ = tx
                                .send(ProgressEvent::ToolStatus {
                                    function: function.to_string(),
                                    status: "rolled_back".to_string(),
                                })
                                .await;
                        }
                        Err(e) => warn!(function = %function, error = %e, "rollback failed"),
                    }
                }
                state.status = TaskStatus::Failed;
                false
            }
        }
    }

    async fn run_agent_step(
        &self,
        name: &str,
        prompt: &str,
        state: &mut TaskRunState,
        tx: &mpsc::Sender<ProgressEvent>,
    ) {
        let rendered = render_prompt(prompt, &state.results);

        let Some(engine) = &self.engine else {
            state.record(name, json!({"text": "", "note": "no provider configured"}));
            return;
        };

        let messages = vec![ChatTurn::user(rendered)];
        let mut accumulated = String::new();

        match engine.stream_complete(messages, vec![]).await {
            Ok(mut stream) => {
                while let Some(delta) = stream.next().await {
                    match delta {
                        Ok(StreamDelta::Text(text)) => {
                            let _ = tx
                                .send(ProgressEvent::Stream {
                                    chunk: text.clone(),
                                    agent: state.task.clone(),
                                })
                                .await;
                            accumulated.push_str(&text);
                        }
                        Ok(StreamDelta::Done) => break,
                        Ok(StreamDelta::ToolCall(_)) => {
                            // Agent steps never offer tools; ignore
                        }
                        Err(e) => {
                            warn!(step = %name, error = %e, "agent step stream error");
                            break;
                        }
                    }
                }
                state.record(name, json!({"text": accumulated}));
            }
            Err(e) => {
                warn!(step = %name, error = %e, "agent step unavailable, continuing");
                state.record(name, json!({"text": "", "note": e.to_string()}));
            }
        }
    }

    /// Returns false when the gate was denied or timed out.
    async fn run_gate_step(
        &self,
        name: &str,
        prompt: &str,
        timeout_secs: u64,
        state: &mut TaskRunState,
        tx: &mpsc::Sender<ProgressEvent>,
    ) -> bool {
        let (request_id, rx) = self.confirmations.register(false);

        let _ = tx
            .send(ProgressEvent::ConfirmationRequired {
                request_id: request_id.clone(),
                action: name.to_string(),
                preview: prompt.to_string(),
                message: prompt.to_string(),
            })
            .await;

        let outcome = self
            .confirmations
            .wait(&request_id, rx, Duration::from_secs(timeout_secs))
            .await;

        match outcome {
            ConfirmOutcome::Approved => {
                state.record(name, json!({"approved": true}));
                true
            }
            ConfirmOutcome::Denied => {
                info!(step = %name, "gate denied");
                state.record(name, json!({"approved": false, "reason": "denied"}));
                false
            }
            ConfirmOutcome::TimedOut => {
                info!(step = %name, "gate timed out");
                state.record(name, json!({"approved": false, "reason": "timeout"}));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FunctionEntry, OperationResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn test_executor(
        dir: &TempDir,
        registry: FunctionRegistry,
    ) -> (Arc<TaskExecutor>, Arc<ConfirmationTable>) {
        let confirmations = Arc::new(ConfirmationTable::new());
        let executor = Arc::new(TaskExecutor::new(
            Arc::new(registry),
            Arc::new(SafetyEngine::new(dir.path().to_path_buf(), 100)),
            confirmations.clone(),
            None,
        ));
        (executor, confirmations)
    }

    fn counting_registry(counter: Arc<AtomicUsize>) -> FunctionRegistry {
        let mut registry = FunctionRegistry::simulated();
        registry.register(FunctionEntry {
            name: "counted_call".to_string(),
            description: "counts invocations".to_string(),
            schema: json!({"type": "object"}),
            mutates: false,
            handler: Arc::new(move |_args| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(OperationResult::ok("counted"))
                })
            }),
        });
        registry
    }

    fn gated_task(timeout_secs: u64) -> Arc<TaskDefinition> {
        Arc::new(
            toml::from_str(&format!(
                r#"
name = "gated"
agent = "config-specialist"
mutating = true

[[steps]]
type = "tool"
name = "before_gate"
function = "discover_networks"

[[steps]]
type = "gate"
name = "approve"
prompt = "Continue?"
timeout_secs = {}

[[steps]]
type = "tool"
name = "after_gate"
function = "counted_call"
"#,
                timeout_secs
            ))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_gate_timeout_aborts_and_blocks_later_steps() {
        let dir = TempDir::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (executor, _confirmations) = test_executor(&dir, counting_registry(counter.clone()));

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let started = std::time::Instant::now();
        let state = executor.run(gated_task(1), "s1", &tx, &cancel).await;

        // 1s deadline resolves within a bounded margin
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(state.status, TaskStatus::Aborted);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(state.results.get("after_gate").is_none());

        drop(tx);
        let mut saw_aborted_complete = false;
        while let Some(event) = rx.recv().await {
            if let ProgressEvent::TaskComplete { status, .. } = event {
                saw_aborted_complete = status == "aborted";
            }
        }
        assert!(saw_aborted_complete);
    }

    #[tokio::test]
    async fn test_gate_approval_continues() {
        let dir = TempDir::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (executor, confirmations) = test_executor(&dir, counting_registry(counter.clone()));

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let run = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(gated_task(30), "s1", &tx, &cancel).await })
        };

        // Approve as soon as the confirmation request streams out
        while let Some(event) = rx.recv().await {
            if let ProgressEvent::ConfirmationRequired { request_id, .. } = event {
                confirmations.resolve(&request_id, true, None);
                break;
            }
        }

        let state = run.await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(state.results["approve"]["approved"], true);
    }

    #[tokio::test]
    async fn test_gate_denial_aborts() {
        let dir = TempDir::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (executor, confirmations) = test_executor(&dir, counting_registry(counter.clone()));

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let run = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(gated_task(30), "s1", &tx, &cancel).await })
        };

        while let Some(event) = rx.recv().await {
            if let ProgressEvent::ConfirmationRequired { request_id, .. } = event {
                confirmations.resolve(&request_id, false, None);
                break;
            }
        }

        let state = run.await.unwrap();
        assert_eq!(state.status, TaskStatus::Aborted);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_args_from_chains_prior_results() {
        let dir = TempDir::new().unwrap();
        let (executor, _) = test_executor(&dir, FunctionRegistry::simulated());

        let task: Arc<TaskDefinition> = Arc::new(
            toml::from_str(
                r#"
name = "chained"
agent = "config-specialist"
mutating = true

[[steps]]
type = "tool"
name = "discover"
function = "discover_networks"

[[steps]]
type = "tool"
name = "apply"
function = "configure_ssid"
args = { name = "Guest" }
args_from = { network_id = "discover.payload.0.id" }
"#,
            )
            .unwrap(),
        );

        let (tx, _rx) = mpsc::channel(64);
        let state = executor
            .run(task, "s1", &tx, &CancellationToken::new())
            .await;

        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.results["apply"]["success"], true);
    }

    #[tokio::test]
    async fn test_condition_skips_step() {
        let dir = TempDir::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (executor, _) = test_executor(&dir, counting_registry(counter.clone()));

        let task: Arc<TaskDefinition> = Arc::new(
            toml::from_str(
                r#"
name = "conditional"
agent = "network-analyst"

[[steps]]
type = "tool"
name = "discover"
function = "discover_networks"

[[steps]]
type = "tool"
name = "never"
function = "counted_call"

[steps.condition]
path = "discover.success"
op = "=="
value = false
"#,
            )
            .unwrap(),
        );

        let (tx, mut rx) = mpsc::channel(64);
        let state = executor
            .run(task, "s1", &tx, &CancellationToken::new())
            .await;

        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        drop(tx);
        let mut skipped = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, ProgressEvent::StepSkipped { .. }) {
                skipped = true;
            }
        }
        assert!(skipped);
    }

    #[tokio::test]
    async fn test_failed_mutating_step_restores_backup() {
        let dir = TempDir::new().unwrap();
        let mut registry = FunctionRegistry::simulated();
        registry.register(FunctionEntry {
            name: "update_device_settings".to_string(),
            description: "always fails".to_string(),
            schema: json!({"type": "object"}),
            mutates: true,
            handler: Arc::new(|_args| {
                Box::pin(async { Err(anyhow::anyhow!("device unreachable")) })
            }),
        });

        let safety = Arc::new(SafetyEngine::new(dir.path().to_path_buf(), 100));
        let executor = TaskExecutor::new(
            Arc::new(registry),
            safety.clone(),
            Arc::new(ConfirmationTable::new()),
            None,
        );

        let task: Arc<TaskDefinition> = Arc::new(
            toml::from_str(
                r#"
name = "doomed"
agent = "config-specialist"
mutating = true

[[steps]]
type = "tool"
name = "apply"
function = "update_device_settings"
args = { device_id = "dev-1" }
"#,
            )
            .unwrap(),
        );

        let (tx, mut rx) = mpsc::channel(64);
        let state = executor
            .run(task, "s1", &tx, &CancellationToken::new())
            .await;

        assert_eq!(state.status, TaskStatus::Failed);
        // The pre-mutation backup was consumed by the rollback
        assert_eq!(safety.backups().backup_count("s1"), 0);

        drop(tx);
        let mut rolled_back = false;
        while let Some(event) = rx.recv().await {
            if let ProgressEvent::ToolStatus { status, .. } = event {
                rolled_back = status == "rolled_back";
            }
        }
        assert!(rolled_back);
    }

    #[test]
    fn test_render_prompt_placeholders() {
        let results = json!({"discover": {"message": "2 networks found"}});
        let rendered = render_prompt("Summarize: {discover.message} / {missing.path}", &results);
        assert_eq!(rendered, "Summarize: 2 networks found / {missing.path}");
    }
}
