//! NetPilot Server - Entry Point
//!
//! Modes:
//! - Default: WebSocket chat server
//! - --dry-run / -n: substitute no-ops for mutating calls

use std::sync::Arc;

use netpilot::capability::CapabilitySet;
use netpilot::confirm::ConfirmationTable;
use netpilot::engine::{GenerativeEngine, OpenAiEngine};
use netpilot::registry::FunctionRegistry;
use netpilot::router::AgentRouter;
use netpilot::safety::SafetyEngine;
use netpilot::server::ChatServer;
use netpilot::session::SessionManager;
use netpilot::tasks::TaskRegistry;
use netpilot::Config;
use std::io::IsTerminal;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let dry_run_flag = args.iter().any(|a| a == "--dry-run" || a == "-n");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("NetPilot Server v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: netpilot [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --dry-run, -n  Substitute no-ops for mutating calls");
        println!("  --help, -h     Show this help");
        println!();
        println!("Environment variables:");
        println!("  NETPILOT_LISTEN        Listen address (default: 127.0.0.1:8787)");
        println!("  NETPILOT_PROVIDER_URL  OpenAI-compatible provider base URL");
        println!("  NETPILOT_PROVIDER_KEY  Provider API key (or OPENAI_API_KEY)");
        println!("  NETPILOT_MODEL         Provider model (default: gpt-4o-mini)");
        println!("  NETPILOT_TASKS_DIR     Task definition directory (default: tasks)");
        println!("  NETPILOT_DATA_DIR      Backup data directory (default: data)");
        println!("  NETPILOT_RATE_LIMIT    Mutating calls/sec per scope (default: 8)");
        println!("  NETPILOT_LOG_JSON      Force JSON log lines (default: on when stderr is not a tty)");
        return Ok(());
    }

    // Setup logging: RUST_LOG filter; JSON lines on stderr when it is not
    // a terminal (or forced via NETPILOT_LOG_JSON), ANSI otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_logs = std::env::var("NETPILOT_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or_else(|_| !std::io::stderr().is_terminal());

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("NetPilot Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    let engine: Option<Arc<dyn GenerativeEngine>> =
        match (&config.provider_base_url, &config.provider_api_key) {
            (Some(url), Some(key)) => {
                info!(model = %config.provider_model, "generative provider configured");
                Some(Arc::new(OpenAiEngine::new(
                    url.clone(),
                    key.clone(),
                    config.provider_model.clone(),
                )))
            }
            _ => {
                info!("no generative provider configured, running degraded");
                None
            }
        };

    let mut tasks = TaskRegistry::new();
    tasks.load_dir(&config.tasks_dir)?;

    let safety = SafetyEngine::new(config.data_dir.clone(), config.max_mutations_per_sec);
    safety.set_dry_run(config.dry_run || dry_run_flag);

    let registry = FunctionRegistry::simulated();
    info!(functions = registry.len(), tasks = tasks.len(), "registries loaded");

    let router = Arc::new(AgentRouter::new(
        Arc::new(CapabilitySet::builtin()),
        Arc::new(tasks),
        Arc::new(registry),
        Arc::new(safety),
        Arc::new(ConfirmationTable::new()),
        Arc::new(SessionManager::new()),
        engine,
    ));

    ChatServer::new(router, config.listen_addr).run().await
}
