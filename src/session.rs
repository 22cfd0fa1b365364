//! Chat session management
//!
//! Sessions hold the message history and capability hint for one
//! conversation. The manager owns every session; a processing routine
//! takes exclusive ownership of one session for the duration of a message
//! (at most one in-flight operation per session), and idle sessions are
//! evicted after an inactivity window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::ChatTurn;

/// How many trailing messages feed the conversation context.
pub const CONTEXT_WINDOW: usize = 20;

/// Default inactivity eviction window, seconds.
pub const SESSION_MAX_AGE_SECS: i64 = 3600;

/// Individual chat message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: String,
    /// "user" | "assistant" | "system"
    pub role: String,
    pub content: String,
    pub agent: Option<String>,
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// One conversation.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    /// Capability selected by the most recent classification
    pub capability_hint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: Vec::new(),
            capability_hint: None,
            created_at: now,
            last_active: now,
        }
    }

    pub fn add_message(
        &mut self,
        role: &str,
        content: impl Into<String>,
        agent: Option<String>,
        data: Option<Value>,
    ) {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: role.to_string(),
            content: content.into(),
            agent,
            data,
            timestamp: Utc::now(),
        };
        self.messages.push(message);
        self.last_active = Utc::now();
        debug!(session = %self.id, role, "message added");
    }

    /// Trailing context for the provider: the last `CONTEXT_WINDOW`
    /// messages, system turns excluded.
    pub fn context(&self) -> Vec<ChatTurn> {
        let start = self.messages.len().saturating_sub(CONTEXT_WINDOW);
        self.messages[start..]
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| match m.role.as_str() {
                "assistant" => ChatTurn::assistant(m.content.clone()),
                _ => ChatTurn::user(m.content.clone()),
            })
            .collect()
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

/// Manages the live session map.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create a session, returning its handle.
    pub fn get_or_create(&self, session_id: Option<&str>) -> (String, Arc<Mutex<Session>>) {
        let id = session_id
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut sessions = self.sessions.write();
        let handle = sessions
            .entry(id.clone())
            .or_insert_with(|| {
                info!(session = %id, "session created");
                Arc::new(Mutex::new(Session::new(id.clone())))
            })
            .clone();
        (id, handle)
    }

    /// Take exclusive ownership of a session for processing one message.
    /// Returns `None` while another message is in flight for it.
    pub fn try_begin(&self, session_id: Option<&str>) -> Option<(String, OwnedMutexGuard<Session>)> {
        let (id, handle) = self.get_or_create(session_id);
        match handle.try_lock_owned() {
            Ok(guard) => Some((id, guard)),
            Err(_) => None,
        }
    }

    /// Evict sessions idle longer than `max_age_secs`. Sessions currently
    /// being processed are skipped.
    pub fn cleanup(&self, max_age_secs: i64) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();

        sessions.retain(|_, handle| match handle.try_lock() {
            Ok(session) => (now - session.last_active).num_seconds() <= max_age_secs,
            // In flight, keep
            Err(_) => true,
        });

        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, "evicted idle sessions");
        }
        evicted
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }
}
