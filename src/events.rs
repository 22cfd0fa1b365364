//! Wire protocol
//!
//! Session-scoped bidirectional message types carried over the WebSocket,
//! plus the validation limits applied before anything reaches the router.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on inbound message content.
pub const MAX_MESSAGE_LEN: usize = 5000;

static SESSION_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

/// Session ids are operator-supplied; only a strict allow-list passes.
pub fn valid_session_id(id: &str) -> bool {
    SESSION_ID_PATTERN.is_match(id)
}

/// Inbound client messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Message {
        content: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    ConfirmResponse {
        request_id: String,
        approved: bool,
        #[serde(default)]
        confirm_text: Option<String>,
    },
    Cancel,
    Ping,
}

/// Outbound progress events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    AgentStatus {
        agent: String,
        status: String,
    },
    Classification {
        agent: String,
        confidence: f64,
        reasoning: String,
        requires_confirmation: bool,
    },
    Stream {
        chunk: String,
        agent: String,
    },
    Data {
        format: String,
        payload: Value,
        agent: String,
    },
    ConfirmationRequired {
        request_id: String,
        action: String,
        preview: String,
        message: String,
    },
    ToolStatus {
        function: String,
        status: String,
    },
    FunctionError {
        function: String,
        message: String,
    },
    Error {
        message: String,
        code: String,
    },
    TaskStart {
        task: String,
        total_steps: usize,
    },
    StepStart {
        step: String,
        index: usize,
        kind: String,
    },
    StepSkipped {
        step: String,
        index: usize,
        reason: String,
    },
    FunctionResult {
        function: String,
        success: bool,
        result: Value,
    },
    TaskComplete {
        task: String,
        status: String,
        summary: String,
    },
    Done {
        agent: String,
        session_id: String,
        cancelled: bool,
    },
    Pong,
}

impl ProgressEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            message: message.into(),
            code: code.into(),
        }
    }
}
