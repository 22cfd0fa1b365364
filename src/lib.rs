//! NetPilot Orchestration Core
//!
//! Natural-language command orchestration for a network-infrastructure
//! automation assistant.
//!
//! # Features
//!
//! - **Intent Classification**: ordered pipeline (explicit prefix, task
//!   match, lexical scoring, generative fallback) with calibrated confidence
//! - **Task Executor**: deterministic step state machine with tool,
//!   generative and human-gate steps
//! - **Safety Engine**: risk tiers, backup-before-write, typed confirmation,
//!   rate limiting, dry-run, undo
//! - **Conversation Loop**: streaming multi-round tool calling with a hard
//!   round cap
//! - **Wire Protocol**: session-scoped WebSocket events
//!
//! # Architecture
//!
//! ```text
//! Operator ──► WebSocket ──► Router ──► classification
//!                (axum)        │
//!                              ├── Task Executor (gated steps)
//!                              ├── Conversation Loop (tool calling)
//!                              ├── Safety Engine (tiers + backups)
//!                              ├── Function Registry (named handlers)
//!                              └── Generative Engine (SSE provider)
//! ```

pub mod capability;
pub mod config;
pub mod confirm;
pub mod engine;
pub mod events;
pub mod executor;
pub mod registry;
pub mod router;
pub mod safety;
pub mod server;
pub mod session;
pub mod tasks;
pub mod verbs;

pub use capability::{CapabilityDefinition, CapabilitySet};
pub use config::Config;
pub use confirm::{ConfirmOutcome, ConfirmationTable};
pub use engine::{ChatTurn, EngineError, GenerativeEngine, OpenAiEngine, StreamDelta, ToolSpec};
pub use events::{ClientMessage, ProgressEvent};
pub use executor::{TaskExecutor, TaskRunState, TaskStatus};
pub use registry::{FunctionEntry, FunctionRegistry, OperationResult};
pub use router::{AgentRouter, ClassificationResult};
pub use safety::{RiskTier, SafetyCheck, SafetyEngine};
pub use server::ChatServer;
pub use session::{ChatMessage, Session, SessionManager};
pub use tasks::{Step, TaskDefinition, TaskRegistry};
