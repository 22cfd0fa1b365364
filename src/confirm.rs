//! Pending-confirmation rendezvous
//!
//! Gate steps and dangerous tool calls suspend on a one-shot signal keyed
//! by request id. The inbound handler that receives the human decision
//! looks the id up here and fires the signal, decoupling suspension from
//! the transport. Exactly one signal is ever delivered per request; a
//! second response for the same id is a no-op, and a deadline resolves
//! deterministically to timeout.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Phrase a typed confirmation must match exactly.
pub const TYPED_CONFIRM_PHRASE: &str = "CONFIRM";

/// Default gate deadline.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(300);

/// How a suspended wait resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Approved,
    Denied,
    TimedOut,
}

struct PendingEntry {
    tx: oneshot::Sender<bool>,
    requires_typed: bool,
}

/// Table of in-flight confirmation requests, shared across sessions.
#[derive(Default)]
pub struct ConfirmationTable {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl ConfirmationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request and return (request id, wait half).
    pub fn register(&self, requires_typed: bool) -> (String, oneshot::Receiver<bool>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(id.clone(), PendingEntry { tx, requires_typed });
        debug!(request_id = %id, requires_typed, "confirmation registered");
        (id, rx)
    }

    /// Deliver a human decision. Returns false when the id is unknown or
    /// already resolved (the duplicate is a no-op).
    ///
    /// A typed-confirm request treats approval without the exact phrase
    /// as denial.
    pub fn resolve(&self, request_id: &str, approved: bool, confirm_text: Option<&str>) -> bool {
        let entry = match self.pending.lock().remove(request_id) {
            Some(e) => e,
            None => {
                warn!(request_id = %request_id, "confirmation response for unknown request");
                return false;
            }
        };

        let verdict = if approved && entry.requires_typed {
            confirm_text.map(str::trim) == Some(TYPED_CONFIRM_PHRASE)
        } else {
            approved
        };

        debug!(request_id = %request_id, approved = verdict, "confirmation resolved");
        // Receiver may already have timed out; that is fine
        entry.tx.send(verdict).is_ok()
    }

    /// Await the decision for a registered request, bounded by a deadline.
    /// On timeout the entry is removed so a late response becomes a no-op.
    pub async fn wait(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<bool>,
        deadline: Duration,
    ) -> ConfirmOutcome {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(true)) => ConfirmOutcome::Approved,
            Ok(Ok(false)) => ConfirmOutcome::Denied,
            // Sender dropped without firing
            Ok(Err(_)) => ConfirmOutcome::Denied,
            Err(_) => {
                self.pending.lock().remove(request_id);
                debug!(request_id = %request_id, "confirmation timed out");
                ConfirmOutcome::TimedOut
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_approve() {
        let table = ConfirmationTable::new();
        let (id, rx) = table.register(false);

        assert!(table.resolve(&id, true, None));
        let outcome = table.wait(&id, rx, Duration::from_secs(1)).await;
        assert_eq!(outcome, ConfirmOutcome::Approved);
    }

    #[tokio::test]
    async fn test_second_response_is_noop() {
        let table = ConfirmationTable::new();
        let (id, rx) = table.register(false);

        assert!(table.resolve(&id, true, None));
        assert!(!table.resolve(&id, false, None));

        let outcome = table.wait(&id, rx, Duration::from_secs(1)).await;
        assert_eq!(outcome, ConfirmOutcome::Approved);
    }

    #[tokio::test]
    async fn test_timeout_is_deterministic() {
        let table = ConfirmationTable::new();
        let (id, rx) = table.register(false);

        let started = std::time::Instant::now();
        let outcome = table.wait(&id, rx, Duration::from_secs(1)).await;
        assert_eq!(outcome, ConfirmOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));

        // Late response after timeout is a no-op
        assert!(!table.resolve(&id, true, None));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_typed_confirm_requires_phrase() {
        let table = ConfirmationTable::new();
        let (id, rx) = table.register(true);
        table.resolve(&id, true, Some("yes please"));
        let outcome = table.wait(&id, rx, Duration::from_secs(1)).await;
        assert_eq!(outcome, ConfirmOutcome::Denied);

        let (id, rx) = table.register(true);
        table.resolve(&id, true, Some("CONFIRM"));
        let outcome = table.wait(&id, rx, Duration::from_secs(1)).await;
        assert_eq!(outcome, ConfirmOutcome::Approved);
    }
}
