//! Agent configuration from command-line arguments.

use clap::Parser;
use std::path::PathBuf;

/// Run the vigil monitoring agent.
#[derive(Parser, Debug, Clone)]
#[command(name = "vigil", version, about = "Single-node monitoring agent")]
pub struct AgentConfig {
    /// Path to the SQLite database file (must exist)
    #[arg(long)]
    pub db: PathBuf,

    /// Scheduler poll interval in seconds
    #[arg(long, default_value_t = 5)]
    pub interval: u64,

    /// Results cleanup interval in seconds
    #[arg(long, default_value_t = 3600)]
    pub cleanup_interval: u64,

    /// Results retention period in seconds
    #[arg(long, default_value_t = 86_400)]
    pub retention_period: u64,

    /// Maximum number of old results deleted in a single batch
    #[arg(long, default_value_t = 1000)]
    pub batch_size: usize,

    /// Disable the results cleaner
    #[arg(long)]
    pub disable_cleaner: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Enable Telegram notifications (requires TELEGRAM_BOT_TOKEN and
    /// TELEGRAM_CHAT_ID)
    #[arg(long)]
    pub enable_telegram: bool,
}
