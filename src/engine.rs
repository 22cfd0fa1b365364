//! Generative provider adapter
//!
//! Provider-agnostic contract for the two calls the core needs:
//! - streaming completion with optional tools, yielding incremental text
//!   and tool-invocation fragments
//! - single-shot structured classification constrained to a fixed choice set
//!
//! Provider failures surface as typed `EngineError` values so the router's
//! fallback tiers can degrade confidence instead of aborting the message.
//! The shipped implementation speaks the OpenAI-compatible chat-completions
//! protocol over SSE.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Typed provider failure
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no provider configured")]
    NotConfigured,
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {0}: {1}")]
    Status(u16, String),
    #[error("provider protocol error: {0}")]
    Protocol(String),
}

/// One turn of a chat transcript, in provider wire shape.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// Assistant turn echoing the tool calls the provider requested.
    pub fn assistant_tool_calls(tool_calls: Vec<Value>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Synthetic tool-result turn answering one tool call.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// A callable tool advertised to the provider.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Incremental unit of a streamed completion.
///
/// A tool call's name and arguments may arrive spread over many fragments
/// sharing the same index; the consumer merges them and acts only after
/// the stream ends.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Text(String),
    ToolCall(ToolCallFragment),
    Done,
}

/// Partial tool-invocation data from one streamed chunk.
#[derive(Debug, Clone, Default)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// Outcome of a constrained classification call.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineClassification {
    pub capability: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// One choice offered to the classification call.
#[derive(Debug, Clone)]
pub struct ClassifyOption {
    pub name: String,
    pub description: String,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, EngineError>> + Send>>;

/// Provider contract. Implementations must be swappable without touching
/// the router or executor.
#[async_trait]
pub trait GenerativeEngine: Send + Sync {
    /// Stream a completion over the transcript, optionally offering tools.
    async fn stream_complete(
        &self,
        messages: Vec<ChatTurn>,
        tools: Vec<ToolSpec>,
    ) -> Result<DeltaStream, EngineError>;

    /// Single-shot classification constrained to the given options.
    async fn classify_capability(
        &self,
        message: &str,
        options: &[ClassifyOption],
    ) -> Result<EngineClassification, EngineError>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEngine {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Parse one SSE `data:` payload. Returns the deltas it carried and
    /// whether the stream has more to read. The caller forwards the deltas
    /// with an awaited send so a slow consumer backpressures the reader
    /// instead of losing fragments.
    fn parse_sse_payload(payload: &str) -> (Vec<Result<StreamDelta, EngineError>>, bool) {
        if payload == "[DONE]" {
            return (Vec::new(), false);
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                return (
                    vec![Err(EngineError::Protocol(format!(
                        "bad stream payload: {}",
                        e
                    )))],
                    false,
                );
            }
        };

        let mut deltas = Vec::new();
        let delta = &value["choices"][0]["delta"];

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                deltas.push(Ok(StreamDelta::Text(text.to_string())));
            }
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let fragment = ToolCallFragment {
                    index: call["index"].as_u64().unwrap_or(0) as usize,
                    id: call["id"].as_str().map(String::from),
                    name: call["function"]["name"].as_str().map(String::from),
                    arguments: call["function"]["arguments"]
                        .as_str()
                        .unwrap_or("")
                        .to_string(),
                };
                deltas.push(Ok(StreamDelta::ToolCall(fragment)));
            }
        }

        let keep_reading = value["choices"][0]["finish_reason"].as_str().is_none();
        (deltas, keep_reading)
    }
}

#[async_trait]
impl GenerativeEngine for OpenAiEngine {
    async fn stream_complete(
        &self,
        messages: Vec<ChatTurn>,
        tools: Vec<ToolSpec>,
    ) -> Result<DeltaStream, EngineError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(|t| t.to_wire()).collect());
        }

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Status(status, text));
        }

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(EngineError::Http(e))).await;
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let (deltas, keep_reading) = Self::parse_sse_payload(payload);
                    for delta in deltas {
                        if tx.send(delta).await.is_err() {
                            // Receiver dropped, stop reading
                            return;
                        }
                    }
                    if !keep_reading {
                        break 'outer;
                    }
                }
            }

            let _ = tx.send(Ok(StreamDelta::Done)).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn classify_capability(
        &self,
        message: &str,
        options: &[ClassifyOption],
    ) -> Result<EngineClassification, EngineError> {
        let names: Vec<&str> = options.iter().map(|o| o.name.as_str()).collect();
        let menu = options
            .iter()
            .map(|o| format!("- {}: {}", o.name, o.description))
            .collect::<Vec<_>>()
            .join("\n");

        let body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": format!(
                        "Classify the operator request into exactly one capability:\n{}",
                        menu
                    )
                },
                {"role": "user", "content": message}
            ],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "select_capability",
                    "description": "Report the chosen capability with a calibrated confidence",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "capability": {"type": "string", "enum": names},
                            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                            "reasoning": {"type": "string"}
                        },
                        "required": ["capability", "confidence"]
                    }
                }
            }],
            "tool_choice": {"type": "function", "function": {"name": "select_capability"}},
        });

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Status(status, text));
        }

        let value: Value = response.json().await?;
        let arguments = value["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .ok_or_else(|| EngineError::Protocol("no tool call in classification reply".into()))?;

        let mut classification: EngineClassification = serde_json::from_str(arguments)
            .map_err(|e| EngineError::Protocol(format!("bad classification arguments: {}", e)))?;

        if !classification.confidence.is_finite() {
            warn!("provider returned non-finite confidence, clamping to 0.5");
            classification.confidence = 0.5;
        }
        classification.confidence = classification.confidence.clamp(0.0, 1.0);

        debug!(
            capability = %classification.capability,
            confidence = classification.confidence,
            "provider classification"
        );
        Ok(classification)
    }
}

/// Scripted engine for tests: plays back pre-built delta rounds.
pub struct ScriptedEngine {
    rounds: parking_lot::Mutex<std::collections::VecDeque<Vec<StreamDelta>>>,
    /// Played when the queue is exhausted; a tool-requesting round here
    /// simulates a provider that never stops asking for tools.
    default_round: Option<Vec<StreamDelta>>,
    classification: Option<EngineClassification>,
}

impl ScriptedEngine {
    pub fn new(rounds: Vec<Vec<StreamDelta>>) -> Self {
        Self {
            rounds: parking_lot::Mutex::new(rounds.into()),
            default_round: None,
            classification: None,
        }
    }

    pub fn with_default_round(mut self, round: Vec<StreamDelta>) -> Self {
        self.default_round = Some(round);
        self
    }

    pub fn with_classification(mut self, classification: EngineClassification) -> Self {
        self.classification = Some(classification);
        self
    }
}

#[async_trait]
impl GenerativeEngine for ScriptedEngine {
    async fn stream_complete(
        &self,
        _messages: Vec<ChatTurn>,
        _tools: Vec<ToolSpec>,
    ) -> Result<DeltaStream, EngineError> {
        let round = self
            .rounds
            .lock()
            .pop_front()
            .or_else(|| self.default_round.clone())
            .unwrap_or_else(|| vec![StreamDelta::Done]);

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for delta in round {
                if tx.send(Ok(delta)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(StreamDelta::Done)).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn classify_capability(
        &self,
        _message: &str,
        _options: &[ClassifyOption],
    ) -> Result<EngineClassification, EngineError> {
        self.classification
            .clone()
            .ok_or(EngineError::NotConfigured)
    }
}
