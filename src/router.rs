//! Agent Router
//!
//! Classifies each inbound message into a capability (and optionally a
//! pre-compiled task), then hands off to the Task Executor or to the
//! streaming multi-round conversation loop. Classification is a strictly
//! ordered, short-circuiting pipeline:
//! 1. explicit @prefix override
//! 2. pre-compiled task match
//! 3. lexical quick-classify with verb boost
//! 4. generative structured classification
//! 5. degraded fallback
//!
//! Classification never fails: provider unavailability degrades confidence
//! instead of aborting the message.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityDefinition, CapabilitySet, FALLBACK_CAPABILITY};
use crate::confirm::{ConfirmOutcome, ConfirmationTable, DEFAULT_CONFIRM_TIMEOUT};
use crate::engine::{
    ChatTurn, ClassifyOption, GenerativeEngine, StreamDelta, ToolSpec,
};
use crate::events::{ProgressEvent, MAX_MESSAGE_LEN};
use crate::executor::TaskExecutor;
use crate::registry::FunctionRegistry;
use crate::safety::{detect_dry_run, ConfirmStyle, SafetyEngine};
use crate::session::{Session, SessionManager};
use crate::tasks::TaskRegistry;
use crate::verbs::detect_verb_kind;

/// Input cap applied before any classification stage.
const MAX_CLASSIFY_LEN: usize = 500;

/// Hard cap on tool-calling rounds per message.
pub const MAX_TOOL_ROUNDS: usize = 5;

/// Confidence below which the operator is asked to confirm the routing.
const CONFIRM_THRESHOLD: f64 = 0.7;

/// Quick-classify acceptance threshold.
const QUICK_ACCEPT: f64 = 0.9;

static EXPLICIT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@([A-Za-z]+)\b\s*").unwrap());

/// Outcome of the classification pipeline. Transient.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub capability: String,
    pub confidence: f64,
    pub reasoning: String,
    pub needs_disambiguation: bool,
    pub requires_confirmation: bool,
    pub task: Option<Arc<crate::tasks::TaskDefinition>>,
    /// Which pipeline stage decided: explicit | task | quick | generative |
    /// quick-fallback | fallback
    pub method: &'static str,
    /// Sanitized message with any explicit prefix removed
    pub cleaned_message: String,
}

/// Sanitize operator input: strip control characters and cap the length.
/// Bounds worst-case classification cost and limits the prompt-injection
/// surface.
fn sanitize_input(message: &str) -> String {
    message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .take(MAX_CLASSIFY_LEN)
        .collect::<String>()
        .trim()
        .to_string()
}

/// The router proper, shared across sessions.
pub struct AgentRouter {
    capabilities: Arc<CapabilitySet>,
    tasks: Arc<TaskRegistry>,
    registry: Arc<FunctionRegistry>,
    safety: Arc<SafetyEngine>,
    confirmations: Arc<ConfirmationTable>,
    sessions: Arc<SessionManager>,
    engine: Option<Arc<dyn GenerativeEngine>>,
    executor: TaskExecutor,
    max_rounds: usize,
}

impl AgentRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capabilities: Arc<CapabilitySet>,
        tasks: Arc<TaskRegistry>,
        registry: Arc<FunctionRegistry>,
        safety: Arc<SafetyEngine>,
        confirmations: Arc<ConfirmationTable>,
        sessions: Arc<SessionManager>,
        engine: Option<Arc<dyn GenerativeEngine>>,
    ) -> Self {
        let executor = TaskExecutor::new(
            registry.clone(),
            safety.clone(),
            confirmations.clone(),
            engine.clone(),
        );
        Self {
            capabilities,
            tasks,
            registry,
            safety,
            confirmations,
            sessions,
            engine,
            executor,
            max_rounds: MAX_TOOL_ROUNDS,
        }
    }

    pub fn confirmations(&self) -> &Arc<ConfirmationTable> {
        &self.confirmations
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Classify one message. Always terminates with a capability and a
    /// confidence in [0, 1].
    pub async fn classify(&self, message: &str) -> ClassificationResult {
        let sanitized = sanitize_input(message);

        // 1. Explicit @prefix override
        if let Some(captures) = EXPLICIT_PREFIX.captures(&sanitized) {
            let token = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            if let Some(capability) = self.capabilities.match_prefix(token) {
                let cleaned = EXPLICIT_PREFIX.replace(&sanitized, "").into_owned();
                debug!(capability = %capability.name, "explicit prefix override");
                return ClassificationResult {
                    capability: capability.name.clone(),
                    confidence: 1.0,
                    reasoning: format!("explicit @{} override", token),
                    needs_disambiguation: false,
                    requires_confirmation: false,
                    task: None,
                    method: "explicit",
                    cleaned_message: cleaned,
                };
            }
        }

        let verb = detect_verb_kind(&sanitized);

        // 2. Pre-compiled task match
        if let Some(task) = self.tasks.find_match(&sanitized, verb) {
            debug!(task = %task.name, "pre-compiled task matched");
            return ClassificationResult {
                capability: task.agent.clone(),
                confidence: 1.0,
                reasoning: format!("matched task '{}'", task.name),
                needs_disambiguation: false,
                requires_confirmation: false,
                task: Some(task),
                method: "task",
                cleaned_message: sanitized,
            };
        }

        // 3. Lexical quick-classify
        let quick = self.quick_classify(&sanitized, verb);
        if let Some((ref capability, confidence, ref reasoning)) = quick {
            if confidence >= QUICK_ACCEPT {
                debug!(capability = %capability, confidence, "quick-classify accepted");
                return self.finish(
                    capability.clone(),
                    confidence,
                    reasoning.clone(),
                    false,
                    "quick",
                    sanitized,
                );
            }
        }

        // 4. Generative structured classification
        if let Some(engine) = &self.engine {
            let options: Vec<ClassifyOption> = self
                .capabilities
                .all()
                .iter()
                .map(|c| ClassifyOption {
                    name: c.name.clone(),
                    description: c.description.clone(),
                })
                .collect();

            match engine.classify_capability(&sanitized, &options).await {
                Ok(choice) if self.capabilities.get(&choice.capability).is_some() => {
                    return self.finish(
                        choice.capability,
                        choice.confidence,
                        choice.reasoning,
                        false,
                        "generative",
                        sanitized,
                    );
                }
                Ok(choice) => {
                    warn!(capability = %choice.capability, "provider chose unknown capability");
                }
                Err(e) => {
                    warn!(error = %e, "generative classification unavailable, degrading");
                }
            }
        }

        // 5. Fallback: reuse quick-classify at reduced confidence
        if let Some((capability, confidence, reasoning)) = quick {
            return self.finish(
                capability,
                (confidence * 0.8).clamp(0.0, 1.0),
                format!("{} (degraded)", reasoning),
                false,
                "quick-fallback",
                sanitized,
            );
        }

        // Nothing matched at all: most conservative read-only capability
        self.finish(
            FALLBACK_CAPABILITY.to_string(),
            0.3,
            "no classification signal, defaulting to read-only analysis".to_string(),
            true,
            "fallback",
            sanitized,
        )
    }

    fn finish(
        &self,
        capability: String,
        confidence: f64,
        reasoning: String,
        needs_disambiguation: bool,
        method: &'static str,
        cleaned_message: String,
    ) -> ClassificationResult {
        let confidence = confidence.clamp(0.0, 1.0);
        ClassificationResult {
            requires_confirmation: confidence < CONFIRM_THRESHOLD,
            capability,
            confidence,
            reasoning,
            needs_disambiguation,
            task: None,
            method,
            cleaned_message,
        }
    }

    /// Keyword/pattern/example scoring with a verb-orientation boost.
    fn quick_classify(
        &self,
        message: &str,
        verb: crate::verbs::VerbKind,
    ) -> Option<(String, f64, String)> {
        let msg_lower = message.to_lowercase();
        let msg_words: Vec<&str> = msg_lower.split_whitespace().collect();

        let mut best: Option<(&CapabilityDefinition, f64)> = None;
        for capability in self.capabilities.all() {
            let mut score = 0.0;

            score += capability
                .keywords
                .iter()
                .filter(|kw| msg_lower.contains(kw.as_str()))
                .count() as f64;

            score += capability
                .patterns
                .iter()
                .filter(|re| re.is_match(&msg_lower))
                .count() as f64
                * 1.5;

            for example in &capability.examples {
                let example_words: Vec<&str> = example.split_whitespace().collect();
                let overlap = example_words
                    .iter()
                    .filter(|w| msg_words.contains(w))
                    .count();
                if overlap * 2 >= example_words.len() {
                    score += 1.2;
                }
            }

            match capability.verb_agrees(verb) {
                Some(true) => score += 2.0,
                Some(false) => score -= 1.0,
                None => {}
            }

            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((capability, score));
            }
        }

        let (capability, score) = best?;
        if score <= 0.0 {
            return None;
        }
        let confidence = (0.6 + score * 0.1).min(0.95);
        Some((
            capability.name.clone(),
            confidence,
            format!("lexical match, score {:.1}", score),
        ))
    }

    /// Route one message: classify, then execute a task or run the
    /// conversation loop. Events stream back on the returned channel.
    pub fn route(
        self: &Arc<Self>,
        content: String,
        session_id: Option<String>,
        cancel: CancellationToken,
    ) -> ReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::channel(64);
        let router = self.clone();
        tokio::spawn(async move {
            router.process(content, session_id, cancel, tx).await;
        });
        ReceiverStream::new(rx)
    }

    async fn process(
        &self,
        content: String,
        session_id: Option<String>,
        cancel: CancellationToken,
        tx: mpsc::Sender<ProgressEvent>,
    ) {
        // Oversized content never reaches the classifier
        if content.chars().count() > MAX_MESSAGE_LEN {
            let _ = tx
                .send(ProgressEvent::error(
                    "message_too_long",
                    format!("message exceeds {} characters", MAX_MESSAGE_LEN),
                ))
                .await;
            return;
        }

        let Some((sid, mut session)) = self.sessions.try_begin(session_id.as_deref()) else {
            let _ = tx
                .send(ProgressEvent::error(
                    "session_busy",
                    "another message is still being processed for this session",
                ))
                .await;
            return;
        };

        let classification = self.classify(&content).await;
        let agent = classification.capability.clone();
        info!(
            session = %sid,
            capability = %agent,
            confidence = classification.confidence,
            method = classification.method,
            "message classified"
        );

        let _ = tx
            .send(ProgressEvent::AgentStatus {
                agent: agent.clone(),
                status: "processing".to_string(),
            })
            .await;
        let _ = tx
            .send(ProgressEvent::Classification {
                agent: agent.clone(),
                confidence: classification.confidence,
                reasoning: classification.reasoning.clone(),
                requires_confirmation: classification.requires_confirmation,
            })
            .await;

        session.add_message("user", classification.cleaned_message.clone(), None, None);
        session.capability_hint = Some(agent.clone());

        let cancelled;
        if let Some(task) = classification.task.clone() {
            let state = self.executor.run(task, &sid, &tx, &cancel).await;
            session.add_message(
                "assistant",
                format!("Task {} {}", state.task, state.status.as_str()),
                Some(agent.clone()),
                Some(state.results.clone()),
            );
            cancelled = cancel.is_cancelled();
        } else {
            let (text, was_cancelled) = self
                .conversation_loop(&classification, &mut session, &sid, &tx, &cancel)
                .await;
            if !text.is_empty() {
                session.add_message("assistant", text, Some(agent.clone()), None);
            }
            cancelled = was_cancelled;
        }

        session.touch();
        let _ = tx
            .send(ProgressEvent::Done {
                agent,
                session_id: sid,
                cancelled,
            })
            .await;
    }

    /// Streaming multi-round tool-calling loop for messages with no
    /// pre-compiled task. Returns (final text, cancelled).
    async fn conversation_loop(
        &self,
        classification: &ClassificationResult,
        session: &mut Session,
        session_id: &str,
        tx: &mpsc::Sender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> (String, bool) {
        let agent = &classification.capability;

        let Some(engine) = &self.engine else {
            let text = if classification.needs_disambiguation {
                "I could not confidently classify that request and no language model is \
                 available. Try an explicit prefix such as @analyst, @config or @workflow."
                    .to_string()
            } else {
                format!(
                    "No language model is configured; I routed this to {} but cannot \
                     compose a reply. Configure a provider or use a pre-compiled task.",
                    agent
                )
            };
            let _ = tx
                .send(ProgressEvent::Stream {
                    chunk: text.clone(),
                    agent: agent.clone(),
                })
                .await;
            return (text, false);
        };

        let capability = match self.capabilities.get(agent) {
            Some(c) => c,
            None => {
                let _ = tx
                    .send(ProgressEvent::error("unknown_capability", agent.clone()))
                    .await;
                return (String::new(), false);
            }
        };

        let dry_run =
            self.safety.dry_run() || detect_dry_run(&classification.cleaned_message);

        let tools: Vec<ToolSpec> = capability
            .functions
            .iter()
            .filter_map(|name| self.registry.get(name))
            .map(|entry| ToolSpec {
                name: entry.name.clone(),
                description: entry.description.clone(),
                parameters: entry.schema.clone(),
            })
            .collect();

        let mut messages = vec![ChatTurn::system(capability.prompt.clone())];
        messages.extend(session.context());

        let mut final_text = String::new();

        for round in 0..self.max_rounds {
            if cancel.is_cancelled() {
                return (final_text, true);
            }

            let mut stream = match engine.stream_complete(messages.clone(), tools.clone()).await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "completion failed");
                    let _ = tx
                        .send(ProgressEvent::error("provider_error", e.to_string()))
                        .await;
                    return (final_text, false);
                }
            };

            let mut round_text = String::new();
            // Tool-call fragments merged by invocation index across chunks
            let mut calls: BTreeMap<usize, MergedCall> = BTreeMap::new();
            let mut protocol_broken = false;

            while let Some(delta) = stream.next().await {
                if cancel.is_cancelled() {
                    return (final_text, true);
                }
                match delta {
                    Ok(StreamDelta::Text(text)) => {
                        let _ = tx
                            .send(ProgressEvent::Stream {
                                chunk: text.clone(),
                                agent: agent.clone(),
                            })
                            .await;
                        round_text.push_str(&text);
                    }
                    Ok(StreamDelta::ToolCall(fragment)) => {
                        let call = calls.entry(fragment.index).or_default();
                        if let Some(id) = fragment.id {
                            call.id = Some(id);
                        }
                        if let Some(name) = fragment.name {
                            call.name = Some(name);
                        }
                        call.arguments.push_str(&fragment.arguments);
                    }
                    Ok(StreamDelta::Done) => break,
                    Err(e) => {
                        // Partial accumulation is discarded; the round ends
                        // as if no tool calls were requested
                        warn!(error = %e, "stream broke mid-round, discarding tool fragments");
                        calls.clear();
                        protocol_broken = true;
                        break;
                    }
                }
            }

            if !round_text.is_empty() {
                final_text = round_text.clone();
            }

            if calls.is_empty() {
                if protocol_broken && final_text.is_empty() {
                    let _ = tx
                        .send(ProgressEvent::error(
                            "provider_error",
                            "stream ended before any usable output",
                        ))
                        .await;
                }
                return (final_text, false);
            }

            debug!(round, calls = calls.len(), "executing tool calls");

            let mut tool_call_payloads = Vec::new();
            let mut result_turns = Vec::new();

            for (index, call) in &calls {
                let Some(name) = call.name.clone() else {
                    let _ = tx
                        .send(ProgressEvent::FunctionError {
                            function: format!("call#{}", index),
                            message: "tool call arrived without a function name".to_string(),
                        })
                        .await;
                    continue;
                };
                let call_id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("call_{}", index));
                let raw_args = if call.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments.clone()
                };

                tool_call_payloads.push(json!({
                    "id": call_id,
                    "type": "function",
                    "function": {"name": name, "arguments": raw_args},
                }));

                let args: Value = match serde_json::from_str(&raw_args) {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = tx
                            .send(ProgressEvent::FunctionError {
                                function: name.clone(),
                                message: format!("malformed arguments: {}", e),
                            })
                            .await;
                        result_turns.push(ChatTurn::tool_result(
                            call_id,
                            json!({"error": "malformed arguments"}).to_string(),
                        ));
                        continue;
                    }
                };

                let outcome = self
                    .guarded_invoke(&name, args, session_id, dry_run, agent, tx)
                    .await;
                result_turns.push(ChatTurn::tool_result(call_id, outcome));
            }

            messages.push(ChatTurn::assistant_tool_calls(tool_call_payloads));
            messages.extend(result_turns);
        }

        info!(session = %session_id, "round cap reached, ending loop");
        (final_text, false)
    }

    /// Run one tool call through the safety path and the registry.
    /// Returns the serialized result text for the synthetic tool turn.
    async fn guarded_invoke(
        &self,
        function: &str,
        args: Value,
        session_id: &str,
        dry_run: bool,
        agent: &str,
        tx: &mpsc::Sender<ProgressEvent>,
    ) -> String {
        let check = self.safety.classify(function, &args);

        if check.needs_confirmation() && !dry_run {
            let (request_id, rx) = self
                .confirmations
                .register(check.confirm_style == ConfirmStyle::Typed);
            let _ = tx
                .send(ProgressEvent::ConfirmationRequired {
                    request_id: request_id.clone(),
                    action: function.to_string(),
                    preview: check.preview.clone(),
                    message: format!(
                        "{} is a {} operation and needs approval",
                        function,
                        check.tier.as_str()
                    ),
                })
                .await;

            let outcome = self
                .confirmations
                .wait(&request_id, rx, DEFAULT_CONFIRM_TIMEOUT)
                .await;
            if outcome != ConfirmOutcome::Approved {
                let status = match outcome {
                    ConfirmOutcome::TimedOut => "timeout",
                    _ => "denied",
                };
                let _ = tx
                    .send(ProgressEvent::ToolStatus {
                        function: function.to_string(),
                        status: status.to_string(),
                    })
                    .await;
                return json!({"error": format!("{} by operator", status)}).to_string();
            }
        }

        let backup_ref = match self.safety.before(&check, session_id, &args).await {
            Ok(r) => r,
            Err(e) => {
                let _ = tx
                    .send(ProgressEvent::FunctionError {
                        function: function.to_string(),
                        message: e.to_string(),
                    })
                    .await;
                return json!({"error": e.to_string()}).to_string();
            }
        };

        let invocation = if dry_run && check.tier != crate::safety::RiskTier::Safe {
            Ok(crate::registry::OperationResult::ok(format!(
                "dry run: {} not executed",
                function
            )))
        } else {
            self.registry.invoke(function, args).await
        };

        match invocation {
            Ok(mut result) => {
                if result.backup_ref.is_none() {
                    result.backup_ref = backup_ref;
                }
                self.safety.after(&check, &result);

                let _ = tx
                    .send(ProgressEvent::ToolStatus {
                        function: function.to_string(),
                        status: if result.success { "ok" } else { "failed" }.to_string(),
                    })
                    .await;
                if let Some(payload) = &result.payload {
                    let _ = tx
                        .send(ProgressEvent::Data {
                            format: "json".to_string(),
                            payload: payload.clone(),
                            agent: agent.to_string(),
                        })
                        .await;
                }
                serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string())
            }
            Err(e) => {
                let _ = tx
                    .send(ProgressEvent::FunctionError {
                        function: function.to_string(),
                        message: e.to_string(),
                    })
                    .await;
                json!({"error": e.to_string()}).to_string()
            }
        }
    }
}

#[derive(Debug, Default)]
struct MergedCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineClassification, ScriptedEngine, ToolCallFragment};
    use crate::registry::{FunctionEntry, OperationResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn build_router(
        dir: &TempDir,
        engine: Option<Arc<dyn GenerativeEngine>>,
        registry: FunctionRegistry,
        tasks: TaskRegistry,
    ) -> Arc<AgentRouter> {
        Arc::new(AgentRouter::new(
            Arc::new(CapabilitySet::builtin()),
            Arc::new(tasks),
            Arc::new(registry),
            Arc::new(SafetyEngine::new(dir.path().to_path_buf(), 100)),
            Arc::new(ConfirmationTable::new()),
            Arc::new(SessionManager::new()),
            engine,
        ))
    }

    fn plain_router(dir: &TempDir, engine: Option<Arc<dyn GenerativeEngine>>) -> Arc<AgentRouter> {
        build_router(dir, engine, FunctionRegistry::simulated(), TaskRegistry::new())
    }

    fn tool_round(function: &str, args: &str) -> Vec<StreamDelta> {
        vec![StreamDelta::ToolCall(ToolCallFragment {
            index: 0,
            id: Some(format!("call_{}", function)),
            name: Some(function.to_string()),
            arguments: args.to_string(),
        })]
    }

    async fn collect(
        router: &Arc<AgentRouter>,
        content: &str,
        confirmations: Option<(Arc<ConfirmationTable>, bool)>,
    ) -> Vec<ProgressEvent> {
        let mut stream = router.route(
            content.to_string(),
            Some("test-session".to_string()),
            CancellationToken::new(),
        );
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            if let (
                ProgressEvent::ConfirmationRequired { request_id, .. },
                Some((table, approve)),
            ) = (&event, &confirmations)
            {
                let text = if *approve { Some("CONFIRM") } else { None };
                table.resolve(request_id, *approve, text);
            }
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_explicit_prefix_is_certain() {
        let dir = TempDir::new().unwrap();
        let router = plain_router(&dir, None);

        let result = router.classify("@analyst whatever gibberish follows").await;
        assert_eq!(result.capability, "network-analyst");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.method, "explicit");
        assert_eq!(result.cleaned_message, "whatever gibberish follows");

        let result = router.classify("@config do something").await;
        assert_eq!(result.capability, "config-specialist");
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_quick_classify_avoids_provider() {
        let dir = TempDir::new().unwrap();
        // No engine configured: acceptance proves no provider call was needed
        let router = plain_router(&dir, None);

        let result = router.classify("show me the current status").await;
        assert_eq!(result.capability, "network-analyst");
        assert!(result.confidence >= 0.9);
        assert_eq!(result.method, "quick");
        assert!(!result.needs_disambiguation);
    }

    #[tokio::test]
    async fn test_ambiguous_without_provider_falls_back() {
        let dir = TempDir::new().unwrap();
        let router = plain_router(&dir, None);

        let result = router.classify("hmm, not sure about anything today").await;
        assert_eq!(result.capability, FALLBACK_CAPABILITY);
        assert!((result.confidence - 0.3).abs() < 1e-9);
        assert!(result.needs_disambiguation);
        assert!(result.requires_confirmation);
    }

    #[tokio::test]
    async fn test_generative_stage_used_when_quick_is_weak() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![]).with_classification(EngineClassification {
            capability: "workflow-creator".to_string(),
            confidence: 0.85,
            reasoning: "asked for automation".to_string(),
        });
        let router = plain_router(&dir, Some(Arc::new(engine)));

        let result = router.classify("could you make that happen regularly").await;
        assert_eq!(result.capability, "workflow-creator");
        assert_eq!(result.method, "generative");
        assert!((result.confidence - 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_input_sanitation() {
        let dir = TempDir::new().unwrap();
        let router = plain_router(&dir, None);

        let long = "show status ".repeat(100);
        let result = router.classify(&long).await;
        assert!(result.cleaned_message.chars().count() <= 500);

        let result = router.classify("show\u{0000} me\u{0007} the status").await;
        assert_eq!(result.cleaned_message, "show me the status");
    }

    #[tokio::test]
    async fn test_oversized_message_never_reaches_classifier() {
        let dir = TempDir::new().unwrap();
        let router = plain_router(&dir, None);

        let events = collect(&router, &"x".repeat(MAX_MESSAGE_LEN + 1), None).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProgressEvent::Error { code, .. } => assert_eq!(code, "message_too_long"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_round_cap_terminates_loop() {
        let dir = TempDir::new().unwrap();
        // Provider that always requests another (safe) tool call
        let engine = ScriptedEngine::new(vec![])
            .with_default_round(tool_round("discover_networks", "{}"));
        let router = plain_router(&dir, Some(Arc::new(engine)));

        let events = collect(&router, "@analyst look around", None).await;

        let ok_calls = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::ToolStatus { status, .. } if status == "ok"))
            .count();
        assert_eq!(ok_calls, MAX_TOOL_ROUNDS);
        assert!(matches!(events.last(), Some(ProgressEvent::Done { cancelled: false, .. })));
    }

    #[tokio::test]
    async fn test_dangerous_call_denied_mid_loop() {
        let dir = TempDir::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = FunctionRegistry::simulated();
        let c = counter.clone();
        // Not in the declared tier map: classifies as dangerous
        registry.register(FunctionEntry {
            name: "wipe_config".to_string(),
            description: "undeclared destructive call".to_string(),
            schema: json!({"type": "object"}),
            mutates: true,
            handler: Arc::new(move |_| {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(OperationResult::ok("wiped"))
                })
            }),
        });

        let engine = ScriptedEngine::new(vec![
            tool_round("wipe_config", "{}"),
            vec![StreamDelta::Text("Understood, not wiping.".to_string())],
        ]);
        let router = build_router(&dir, Some(Arc::new(engine)), registry, TaskRegistry::new());
        let confirmations = router.confirmations().clone();

        let events = collect(&router, "@analyst wipe it", Some((confirmations, false))).await;

        // Denied before execution, loop continued to a final text round
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(events.iter().any(
            |e| matches!(e, ProgressEvent::ToolStatus { status, .. } if status == "denied")
        ));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Stream { chunk, .. } if chunk.contains("not wiping"))));
        assert!(matches!(events.last(), Some(ProgressEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_dangerous_call_approved_with_typed_phrase() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![
            tool_round("add_firewall_rule", r#"{"network_id":"net-100","policy":"deny"}"#),
            vec![StreamDelta::Text("Rule added.".to_string())],
        ]);
        let router = plain_router(&dir, Some(Arc::new(engine)));
        let confirmations = router.confirmations().clone();

        let events = collect(&router, "@config block telnet", Some((confirmations, true))).await;
        assert!(events.iter().any(
            |e| matches!(e, ProgressEvent::ToolStatus { function, status } if function == "add_firewall_rule" && status == "ok")
        ));
    }

    #[tokio::test]
    async fn test_malformed_arguments_reported_without_retry() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![
            tool_round("discover_networks", "{not json"),
            vec![StreamDelta::Text("Could not look that up.".to_string())],
        ]);
        let router = plain_router(&dir, Some(Arc::new(engine)));

        let events = collect(&router, "@analyst check networks", None).await;
        assert!(events.iter().any(|e| matches!(
            e,
            ProgressEvent::FunctionError { function, .. } if function == "discover_networks"
        )));
        assert!(matches!(events.last(), Some(ProgressEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_task_match_drives_executor() {
        let dir = TempDir::new().unwrap();
        let mut tasks = TaskRegistry::new();
        tasks
            .register(
                toml::from_str(
                    r#"
name = "health-report"
agent = "network-analyst"
trigger_keywords = ["health", "report"]

[[steps]]
type = "tool"
name = "health"
function = "get_network_health"
"#,
                )
                .unwrap(),
            )
            .unwrap();
        let router = build_router(&dir, None, FunctionRegistry::simulated(), tasks);

        let result = router.classify("run the health report").await;
        assert_eq!(result.method, "task");
        assert_eq!(result.confidence, 1.0);
        assert!(result.task.is_some());

        let events = collect(&router, "run the health report", None).await;
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::TaskStart { .. })));
        assert!(events.iter().any(
            |e| matches!(e, ProgressEvent::TaskComplete { status, .. } if status == "completed")
        ));
    }

    #[tokio::test]
    async fn test_cancellation_flushes_done() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![])
            .with_default_round(tool_round("discover_networks", "{}"));
        let router = plain_router(&dir, Some(Arc::new(engine)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = router.route(
            "@analyst look around".to_string(),
            Some("cancel-session".to_string()),
            cancel,
        );

        let mut cancelled_done = false;
        while let Some(event) = stream.next().await {
            if let ProgressEvent::Done { cancelled, .. } = event {
                cancelled_done = cancelled;
            }
        }
        assert!(cancelled_done);
    }

    #[tokio::test]
    async fn test_busy_session_rejected() {
        let dir = TempDir::new().unwrap();
        let router = plain_router(&dir, None);

        let (_, guard) = router.sessions().get_or_create(Some("busy"));
        let held = guard.try_lock_owned().unwrap();

        let events = collect_with_session(&router, "show status", "busy").await;
        drop(held);

        assert!(matches!(
            events.first(),
            Some(ProgressEvent::Error { code, .. }) if code == "session_busy"
        ));
    }

    async fn collect_with_session(
        router: &Arc<AgentRouter>,
        content: &str,
        session: &str,
    ) -> Vec<ProgressEvent> {
        let mut stream = router.route(
            content.to_string(),
            Some(session.to_string()),
            CancellationToken::new(),
        );
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }
}
