//! Task definitions
//!
//! Pre-compiled, declaratively authored step sequences. Definitions are
//! loaded from TOML files at startup; invalid records are rejected at load
//! time, never at match time. Matching pairs trigger keywords/patterns
//! with the verb orientation of the request.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::verbs::VerbKind;

/// Default gate deadline in seconds.
pub const DEFAULT_GATE_TIMEOUT_SECS: u64 = 300;

fn default_version() -> String {
    "1".to_string()
}

fn default_gate_timeout() -> u64 {
    DEFAULT_GATE_TIMEOUT_SECS
}

fn default_args() -> Value {
    Value::Object(Default::default())
}

/// Comparison applied by a step condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ConditionOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "truthy")]
    Truthy,
}

/// Condition evaluated against prior step results before a step runs.
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    /// Dot path into the results map, e.g. "discover.success"
    pub path: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Condition {
    pub fn evaluate(&self, results: &Value) -> bool {
        let resolved = resolve_path(results, &self.path);
        match self.op {
            ConditionOp::Eq => resolved.as_ref() == self.value.as_ref(),
            ConditionOp::Ne => resolved.as_ref() != self.value.as_ref(),
            ConditionOp::Truthy => match resolved {
                None | Some(Value::Null) => false,
                Some(Value::Bool(b)) => b,
                Some(Value::String(s)) => !s.is_empty(),
                Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                Some(Value::Array(a)) => !a.is_empty(),
                Some(Value::Object(o)) => !o.is_empty(),
            },
        }
    }
}

/// One step of a task. Tagged by `type` in the TOML source.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Tool {
        name: String,
        function: String,
        /// Static arguments passed as-is
        #[serde(default = "default_args")]
        args: Value,
        /// Argument name -> dot path into prior results
        #[serde(default)]
        args_from: HashMap<String, String>,
        #[serde(default)]
        condition: Option<Condition>,
    },
    Agent {
        name: String,
        prompt: String,
        #[serde(default)]
        condition: Option<Condition>,
    },
    Gate {
        name: String,
        prompt: String,
        #[serde(default = "default_gate_timeout")]
        timeout_secs: u64,
    },
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Tool { name, .. } | Step::Agent { name, .. } | Step::Gate { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::Tool { .. } => "tool",
            Step::Agent { .. } => "agent",
            Step::Gate { .. } => "gate",
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            Step::Tool { condition, .. } | Step::Agent { condition, .. } => condition.as_ref(),
            Step::Gate { .. } => None,
        }
    }
}

/// A named, versioned, pre-compiled step sequence. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Owning capability
    pub agent: String,
    #[serde(default)]
    pub trigger_keywords: Vec<String>,
    #[serde(default)]
    pub trigger_patterns: Vec<String>,
    /// Whether the task applies configuration changes
    #[serde(default)]
    pub mutating: bool,
    pub steps: Vec<Step>,
    /// Compiled trigger patterns, filled in at register time
    #[serde(skip)]
    compiled_patterns: Vec<Regex>,
}

impl TaskDefinition {
    /// Structural validation run at load/register time. Compiles trigger
    /// patterns once so matching never re-parses them.
    fn validate(&mut self) -> Result<()> {
        if self.steps.is_empty() {
            anyhow::bail!("task '{}' has no steps", self.name);
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.name().is_empty() {
                anyhow::bail!("task '{}' has a step with an empty name", self.name);
            }
            if !seen.insert(step.name()) {
                anyhow::bail!("task '{}' has duplicate step '{}'", self.name, step.name());
            }
        }
        self.compiled_patterns = self
            .trigger_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| {
                    format!("task '{}' has invalid pattern '{}'", self.name, pattern)
                })
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Whether this task's trigger matches a (lowercased) message.
    fn matches(&self, msg_lower: &str, verb: VerbKind) -> bool {
        // Verb orientation must not oppose the task
        match verb {
            VerbKind::Action if !self.mutating => return false,
            VerbKind::Analysis if self.mutating => return false,
            _ => {}
        }

        if self.compiled_patterns.iter().any(|re| re.is_match(msg_lower)) {
            return true;
        }

        let hits = self
            .trigger_keywords
            .iter()
            .filter(|kw| msg_lower.contains(kw.as_str()))
            .count();
        hits >= 2
    }
}

/// Registry of pre-compiled tasks, built at startup.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Arc<TaskDefinition>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mut task: TaskDefinition) -> Result<()> {
        task.validate()?;
        debug!(task = %task.name, steps = task.steps.len(), "task registered");
        self.tasks.push(Arc::new(task));
        Ok(())
    }

    /// Load every `*.toml` under a directory. Unparseable or invalid
    /// records are logged and skipped.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            debug!(path = %dir.display(), "no task directory, skipping");
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("reading task directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }

            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable task file, skipping");
                    continue;
                }
            };
            let task: TaskDefinition = match toml::from_str(&content) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid task file, skipping");
                    continue;
                }
            };
            match self.register(task) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "rejected task, skipping"),
            }
        }

        info!(loaded, dir = %dir.display(), "task definitions loaded");
        Ok(loaded)
    }

    /// Find the first task whose trigger matches the message.
    pub fn find_match(&self, message: &str, verb: VerbKind) -> Option<Arc<TaskDefinition>> {
        let msg_lower = message.to_lowercase();
        self.tasks
            .iter()
            .find(|t| t.matches(&msg_lower, verb))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Resolve a dot path ("discover.result.0.id") into a JSON value.
pub fn resolve_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Merge static step args with `args_from` dot-path resolutions over the
/// prior-results context. Unresolvable paths are left out rather than
/// injected as null.
pub fn resolve_args(
    static_args: &Value,
    args_from: &HashMap<String, String>,
    context: &Value,
) -> Value {
    let mut merged = static_args
        .as_object()
        .cloned()
        .unwrap_or_default();

    for (arg, path) in args_from {
        match resolve_path(context, path) {
            Some(value) => {
                merged.insert(arg.clone(), value);
            }
            None => {
                warn!(arg = %arg, path = %path, "argument path did not resolve");
            }
        }
    }

    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TASK_TOML: &str = r#"
name = "guest-wifi-setup"
description = "Provision a guest wifi network"
agent = "config-specialist"
trigger_keywords = ["guest", "wifi", "setup"]
mutating = true

[[steps]]
type = "tool"
name = "discover"
function = "discover_networks"

[[steps]]
type = "gate"
name = "approve"
prompt = "Apply guest wifi configuration?"
timeout_secs = 120

[[steps]]
type = "tool"
name = "apply"
function = "configure_ssid"
args = { name = "Guest" }
args_from = { network_id = "discover.result.0.id" }

[[steps]]
type = "agent"
name = "summarize"
prompt = "Summarize what was configured."
"#;

    #[test]
    fn test_parse_task_toml() {
        let task: TaskDefinition = toml::from_str(TASK_TOML).unwrap();
        assert_eq!(task.name, "guest-wifi-setup");
        assert_eq!(task.steps.len(), 4);
        assert_eq!(task.steps[1].kind(), "gate");
        match &task.steps[2] {
            Step::Tool { args_from, .. } => {
                assert_eq!(args_from["network_id"], "discover.result.0.id");
            }
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn test_register_rejects_invalid() {
        let mut registry = TaskRegistry::new();

        let empty: TaskDefinition = toml::from_str(
            r#"
name = "empty"
agent = "network-analyst"
steps = []
"#,
        )
        .unwrap();
        assert!(registry.register(empty).is_err());

        let bad_pattern: TaskDefinition = toml::from_str(
            r#"
name = "bad-pattern"
agent = "network-analyst"
trigger_patterns = ["(unclosed"]

[[steps]]
type = "tool"
name = "one"
function = "discover_networks"
"#,
        )
        .unwrap();
        assert!(registry.register(bad_pattern).is_err());

        // Unknown step kind never even parses
        let unknown = toml::from_str::<TaskDefinition>(
            r#"
name = "unknown-kind"
agent = "network-analyst"

[[steps]]
type = "teleport"
name = "one"
"#,
        );
        assert!(unknown.is_err());
    }

    #[test]
    fn test_trigger_matching_with_verb_agreement() {
        let mut registry = TaskRegistry::new();
        registry
            .register(toml::from_str(TASK_TOML).unwrap())
            .unwrap();

        let matched = registry.find_match("set up guest wifi for the lobby", VerbKind::Action);
        assert!(matched.is_some());

        // Analysis verb opposes a mutating task
        let opposed = registry.find_match("show me the guest wifi setup", VerbKind::Analysis);
        assert!(opposed.is_none());

        // One keyword hit is not enough
        let weak = registry.find_match("configure the wifi", VerbKind::Action);
        assert!(weak.is_none());
    }

    #[test]
    fn test_patterns_compiled_at_register() {
        let mut registry = TaskRegistry::new();
        registry
            .register(
                toml::from_str(
                    r#"
name = "patterned"
agent = "config-specialist"
mutating = true
trigger_patterns = ['\bset up\b.*\bguest\b']

[[steps]]
type = "tool"
name = "one"
function = "discover_networks"
"#,
                )
                .unwrap(),
            )
            .unwrap();

        let matched = registry.find_match("set up guest access please", VerbKind::Action);
        assert!(matched.is_some());
        assert_eq!(matched.unwrap().compiled_patterns.len(), 1);
    }

    #[test]
    fn test_resolve_path() {
        let context = json!({
            "discover": {"result": [{"id": "net-100"}, {"id": "net-200"}]}
        });
        assert_eq!(
            resolve_path(&context, "discover.result.0.id"),
            Some(json!("net-100"))
        );
        assert_eq!(resolve_path(&context, "discover.missing"), None);
    }

    #[test]
    fn test_resolve_args_merges() {
        let context = json!({"discover": {"result": [{"id": "net-100"}]}});
        let static_args = json!({"name": "Guest"});
        let mut args_from = HashMap::new();
        args_from.insert("network_id".to_string(), "discover.result.0.id".to_string());
        args_from.insert("missing".to_string(), "does.not.exist".to_string());

        let resolved = resolve_args(&static_args, &args_from, &context);
        assert_eq!(resolved["name"], "Guest");
        assert_eq!(resolved["network_id"], "net-100");
        assert!(resolved.get("missing").is_none());
    }

    #[test]
    fn test_condition_evaluation() {
        let results = json!({"discover": {"success": true, "count": 0}});

        let eq = Condition {
            path: "discover.success".to_string(),
            op: ConditionOp::Eq,
            value: Some(json!(true)),
        };
        assert!(eq.evaluate(&results));

        let truthy = Condition {
            path: "discover.count".to_string(),
            op: ConditionOp::Truthy,
            value: None,
        };
        assert!(!truthy.evaluate(&results));
    }
}
