//! Verb lexicon for intent heuristics
//!
//! Classifies the leading verb of an operator request as action-oriented
//! (mutates infrastructure) or analysis-oriented (read-only). Used by the
//! router to break ties between capabilities with overlapping vocabulary.

/// Verbs that imply a configuration change
pub static ACTION_VERBS: &[&str] = &[
    "create", "add", "configure", "set", "update", "change", "modify",
    "enable", "disable", "delete", "remove", "apply", "deploy", "provision",
    "assign", "rename", "reboot", "restart", "block", "allow", "open",
    "close", "push", "rollback", "undo",
];

/// Verbs that imply inspection without side effects
pub static ANALYSIS_VERBS: &[&str] = &[
    "show", "list", "get", "display", "view", "check", "analyze", "audit",
    "review", "inspect", "find", "search", "count", "summarize", "compare",
    "report", "describe", "monitor", "trace", "what", "which", "how",
];

/// Detected verb orientation of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbKind {
    Action,
    Analysis,
    Unknown,
}

/// Classify a message by its first recognized verb.
///
/// Only the first few tokens are examined: operators front-load the verb
/// ("show me...", "create a vlan..."), and scanning the whole message
/// produces false positives from object nouns ("show the create form").
pub fn detect_verb_kind(message: &str) -> VerbKind {
    let lower = message.to_lowercase();
    for token in lower.split_whitespace().take(4) {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric());
        if ACTION_VERBS.contains(&token) {
            return VerbKind::Action;
        }
        if ANALYSIS_VERBS.contains(&token) {
            return VerbKind::Analysis;
        }
    }
    VerbKind::Unknown
}
