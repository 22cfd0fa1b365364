//! Safety / Policy Engine
//!
//! Classifies every invokable operation into a risk tier and enforces the
//! tier's policy: confirmation style, backup-before-write, rate limiting
//! of mutating calls, dry-run substitution, and undo of the most recent
//! backup. Functions absent from the declared tier map default to the
//! most restrictive tier so new operations never silently bypass the
//! guardrails.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::OperationResult;

/// Risk classification of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Safe,
    Moderate,
    Dangerous,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Safe => "safe",
            RiskTier::Moderate => "moderate",
            RiskTier::Dangerous => "dangerous",
        }
    }
}

/// Confirmation required before an operation may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStyle {
    None,
    /// Single approve/deny with preview
    Simple,
    /// Explicit typed phrase plus impact preview
    Typed,
}

/// Per-invocation verdict, computed fresh for every call.
#[derive(Debug, Clone)]
pub struct SafetyCheck {
    pub function: String,
    pub tier: RiskTier,
    pub backup_required: bool,
    pub confirm_style: ConfirmStyle,
    pub preview: String,
}

impl SafetyCheck {
    pub fn needs_confirmation(&self) -> bool {
        self.confirm_style != ConfirmStyle::None
    }
}

/// Typed policy failure
#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("rate limit exceeded for scope '{0}'")]
    RateLimited(String),
    #[error("backup failed: {0}")]
    BackupFailed(String),
    #[error("backup verification failed: {0}")]
    BackupUnverified(String),
    #[error("nothing to undo for session '{0}'")]
    NothingToUndo(String),
}

// Declared tiers for the built-in function set. Anything not listed here
// classifies as Dangerous.
static DECLARED_TIERS: Lazy<HashMap<&'static str, RiskTier>> = Lazy::new(|| {
    HashMap::from([
        ("discover_networks", RiskTier::Safe),
        ("discover_devices", RiskTier::Safe),
        ("list_clients", RiskTier::Safe),
        ("get_network_health", RiskTier::Safe),
        ("get_device_status", RiskTier::Safe),
        ("generate_report", RiskTier::Safe),
        ("render_template", RiskTier::Safe),
        ("configure_ssid", RiskTier::Moderate),
        ("create_vlan", RiskTier::Moderate),
        ("update_device_settings", RiskTier::Moderate),
        ("add_firewall_rule", RiskTier::Dangerous),
        ("remove_firewall_rule", RiskTier::Dangerous),
    ])
});

static DRY_RUN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)--dry-run\b",
        r"(?i)\bdry[- ]run\b",
        r"(?i)\bwhat would happen\b",
        r"(?i)\bpreview\b.*\b(change|chang|apply)",
        r"(?i)\bsimulate\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Whether the operator asked for a dry run in free text.
pub fn detect_dry_run(message: &str) -> bool {
    DRY_RUN_PATTERNS.iter().any(|re| re.is_match(message))
}

/// Number of backups retained per session
const BACKUP_RING_SIZE: usize = 10;

/// One backup snapshot reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub function: String,
    pub created_at: chrono::DateTime<Utc>,
    pub path: PathBuf,
}

/// Snapshot store under a data directory, with a per-session ring of the
/// most recent backups.
pub struct BackupStore {
    dir: PathBuf,
    by_session: Mutex<HashMap<String, VecDeque<BackupRecord>>>,
}

impl BackupStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            dir: data_dir.join("backups"),
            by_session: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot the pre-mutation arguments and return a backup reference.
    ///
    /// The write is verified with a read-back parse before the caller is
    /// allowed to mutate; backup-then-mutate stays non-atomic but never
    /// proceeds on a backup that did not actually land.
    pub async fn take(
        &self,
        session_id: &str,
        function: &str,
        args: &Value,
    ) -> Result<String, SafetyError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SafetyError::BackupFailed(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let path = self.dir.join(format!("{}.json", id));
        let record = BackupRecord {
            id: id.clone(),
            function: function.to_string(),
            created_at: Utc::now(),
            path: path.clone(),
        };

        let snapshot = serde_json::json!({
            "id": id,
            "session_id": session_id,
            "function": function,
            "args": args,
            "created_at": record.created_at.to_rfc3339(),
        });
        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| SafetyError::BackupFailed(e.to_string()))?;
        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| SafetyError::BackupFailed(e.to_string()))?;

        // Verification read-back
        let read = tokio::fs::read(&path)
            .await
            .map_err(|e| SafetyError::BackupUnverified(e.to_string()))?;
        serde_json::from_slice::<Value>(&read)
            .map_err(|e| SafetyError::BackupUnverified(e.to_string()))?;

        let mut by_session = self.by_session.lock();
        let ring = by_session.entry(session_id.to_string()).or_default();
        ring.push_back(record);
        while ring.len() > BACKUP_RING_SIZE {
            ring.pop_front();
        }

        info!(session = %session_id, function = %function, backup = %id, "backup taken");
        Ok(id)
    }

    /// Pop the most recent backup for a session and read its snapshot.
    pub async fn restore_latest(
        &self,
        session_id: &str,
    ) -> Result<(BackupRecord, Value), SafetyError> {
        let record = self
            .by_session
            .lock()
            .get_mut(session_id)
            .and_then(|ring| ring.pop_back())
            .ok_or_else(|| SafetyError::NothingToUndo(session_id.to_string()))?;

        let body = tokio::fs::read(&record.path)
            .await
            .map_err(|e| SafetyError::BackupFailed(e.to_string()))?;
        let snapshot: Value = serde_json::from_slice(&body)
            .map_err(|e| SafetyError::BackupFailed(e.to_string()))?;

        info!(session = %session_id, backup = %record.id, "restoring latest backup");
        Ok((record, snapshot))
    }

    pub fn backup_count(&self, session_id: &str) -> usize {
        self.by_session
            .lock()
            .get(session_id)
            .map(|r| r.len())
            .unwrap_or(0)
    }
}

/// Sliding-window rate limiter over mutating calls.
///
/// The only cross-session shared mutable state in the core; everything
/// lives behind one mutex.
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Try to record one call in the scope's window.
    /// Returns how long to wait when the window is full.
    pub fn try_acquire(&self, scope: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        let window = hits.entry(scope.to_string()).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) > self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_per_window {
            let retry_after = window
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }

        window.push_back(now);
        Ok(())
    }

    /// Record one call, sleeping until the window has capacity.
    pub async fn acquire(&self, scope: &str) {
        loop {
            match self.try_acquire(scope) {
                Ok(()) => return,
                Err(retry_after) => {
                    debug!(scope = %scope, ?retry_after, "rate limited, waiting");
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }
}

/// The policy engine proper.
pub struct SafetyEngine {
    backups: BackupStore,
    rate: RateLimiter,
    dry_run: AtomicBool,
}

impl SafetyEngine {
    pub fn new(data_dir: PathBuf, max_mutations_per_sec: usize) -> Self {
        Self {
            backups: BackupStore::new(data_dir),
            rate: RateLimiter::new(max_mutations_per_sec, Duration::from_secs(1)),
            dry_run: AtomicBool::new(false),
        }
    }

    pub fn set_dry_run(&self, enabled: bool) {
        self.dry_run.store(enabled, Ordering::SeqCst);
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run.load(Ordering::SeqCst)
    }

    /// Classify one invocation. Unknown functions are Dangerous.
    pub fn classify(&self, function: &str, args: &Value) -> SafetyCheck {
        let tier = DECLARED_TIERS
            .get(function)
            .copied()
            .unwrap_or(RiskTier::Dangerous);

        let confirm_style = match tier {
            RiskTier::Safe => ConfirmStyle::None,
            RiskTier::Moderate => ConfirmStyle::Simple,
            RiskTier::Dangerous => ConfirmStyle::Typed,
        };

        SafetyCheck {
            function: function.to_string(),
            tier,
            backup_required: tier != RiskTier::Safe,
            confirm_style,
            preview: build_preview(function, args, tier),
        }
    }

    /// Pre-operation hook: rate-limit mutating calls and take the
    /// required backup. Returns the backup reference, if one was taken.
    pub async fn before(
        &self,
        check: &SafetyCheck,
        session_id: &str,
        args: &Value,
    ) -> Result<Option<String>, SafetyError> {
        if check.tier == RiskTier::Safe {
            return Ok(None);
        }

        self.rate.acquire(session_id).await;

        if check.backup_required {
            let backup_ref = self.backups.take(session_id, &check.function, args).await?;
            return Ok(Some(backup_ref));
        }
        Ok(None)
    }

    /// Post-operation hook: undo-record accounting.
    pub fn after(&self, check: &SafetyCheck, result: &OperationResult) {
        if !result.success {
            warn!(function = %check.function, "guarded operation reported failure");
            return;
        }
        debug!(
            function = %check.function,
            tier = check.tier.as_str(),
            backup = result.backup_ref.as_deref().unwrap_or("-"),
            "guarded operation completed"
        );
    }

    /// Restore the most recent backup for a session.
    pub async fn undo(&self, session_id: &str) -> Result<(BackupRecord, Value), SafetyError> {
        self.backups.restore_latest(session_id).await
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }
}

fn build_preview(function: &str, args: &Value, tier: RiskTier) -> String {
    let rendered_args = match args.as_object() {
        Some(map) if !map.is_empty() => map
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "no arguments".to_string(),
    };

    match tier {
        RiskTier::Safe => format!("{}({})", function, rendered_args),
        RiskTier::Moderate => format!("Will apply {} with {}", function, rendered_args),
        RiskTier::Dangerous => format!(
            "DANGEROUS: {} with {}. This changes live infrastructure and may interrupt service.",
            function, rendered_args
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> SafetyEngine {
        SafetyEngine::new(dir.path().to_path_buf(), 8)
    }

    #[test]
    fn test_unknown_function_is_dangerous() {
        let dir = TempDir::new().unwrap();
        let check = engine(&dir).classify("brand_new_function", &json!({}));
        assert_eq!(check.tier, RiskTier::Dangerous);
        assert!(check.backup_required);
        assert_eq!(check.confirm_style, ConfirmStyle::Typed);
    }

    #[test]
    fn test_declared_tiers() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let safe = engine.classify("discover_networks", &json!({}));
        assert_eq!(safe.tier, RiskTier::Safe);
        assert!(!safe.needs_confirmation());

        let moderate = engine.classify("create_vlan", &json!({"vlan_id": 30}));
        assert_eq!(moderate.tier, RiskTier::Moderate);
        assert_eq!(moderate.confirm_style, ConfirmStyle::Simple);

        let dangerous = engine.classify("remove_firewall_rule", &json!({"index": 1}));
        assert_eq!(dangerous.tier, RiskTier::Dangerous);
        assert!(dangerous.preview.contains("DANGEROUS"));
    }

    #[tokio::test]
    async fn test_backup_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let args = json!({"network_id": "net-100", "vlan_id": 30});

        let check = engine.classify("create_vlan", &args);
        let backup_ref = engine.before(&check, "s1", &args).await.unwrap();
        assert!(backup_ref.is_some());

        let (record, snapshot) = engine.undo("s1").await.unwrap();
        assert_eq!(record.function, "create_vlan");
        assert_eq!(snapshot["args"], args);
    }

    #[tokio::test]
    async fn test_undo_without_backup() {
        let dir = TempDir::new().unwrap();
        let err = engine(&dir).undo("s-empty").await;
        assert!(matches!(err, Err(SafetyError::NothingToUndo(_))));
    }

    #[tokio::test]
    async fn test_backup_ring_caps_history() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        for i in 0..15 {
            engine
                .backups()
                .take("s1", "configure_ssid", &json!({"i": i}))
                .await
                .unwrap();
        }
        assert_eq!(engine.backups().backup_count("s1"), BACKUP_RING_SIZE);
    }

    #[test]
    fn test_rate_limiter_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        assert!(limiter.try_acquire("org").is_ok());
        assert!(limiter.try_acquire("org").is_ok());
        assert!(limiter.try_acquire("org").is_ok());
        assert!(limiter.try_acquire("org").is_err());
        // Other scopes are unaffected
        assert!(limiter.try_acquire("other").is_ok());
    }

    #[test]
    fn test_dry_run_detection() {
        assert!(detect_dry_run("create vlan 30 --dry-run"));
        assert!(detect_dry_run("what would happen if I removed rule 3?"));
        assert!(detect_dry_run("simulate adding a deny rule"));
        assert!(detect_dry_run("preview the change to the lobby ssid"));
        assert!(!detect_dry_run("create vlan 30 now"));
    }
}
