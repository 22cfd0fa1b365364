//! Configuration management

use anyhow::{Context as _, Result};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the chat server binds
    pub listen_addr: SocketAddr,

    /// OpenAI-compatible provider base URL (optional - router degrades
    /// gracefully without one)
    pub provider_base_url: Option<String>,

    /// Provider API key
    pub provider_api_key: Option<String>,

    /// Provider model identifier
    pub provider_model: String,

    /// Directory of declarative task definitions (*.toml)
    pub tasks_dir: PathBuf,

    /// Data directory for backups
    pub data_dir: PathBuf,

    /// Substitute no-ops for mutating calls
    pub dry_run: bool,

    /// Mutating calls allowed per second per scope
    pub max_mutations_per_sec: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("NETPILOT_LISTEN")
            .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
            .parse()
            .context("NETPILOT_LISTEN is not a valid socket address")?;

        let provider_base_url = std::env::var("NETPILOT_PROVIDER_URL").ok();
        let provider_api_key = std::env::var("NETPILOT_PROVIDER_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();

        let provider_model =
            std::env::var("NETPILOT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let tasks_dir = std::env::var("NETPILOT_TASKS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("tasks"));

        let data_dir = std::env::var("NETPILOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));

        let dry_run = std::env::var("NETPILOT_DRY_RUN")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_mutations_per_sec = std::env::var("NETPILOT_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8);

        Ok(Self {
            listen_addr,
            provider_base_url,
            provider_api_key,
            provider_model,
            tasks_dir,
            data_dir,
            dry_run,
            max_mutations_per_sec,
        })
    }
}
