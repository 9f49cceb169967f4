//! # Controller Configuration
//!
//! Command-line / environment configuration for the controller binary.
//! Every flag has an environment fallback so the binary works both as a
//! systemd unit (env file) and from a shell.

use clap::Parser;
use std::net::{IpAddr, SocketAddr};

/// Controller configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "taskforge-controller", about = "Taskforge controller")]
pub struct Config {
    /// Address the WebSocket/REST listener binds to.
    #[arg(long, env = "TASKFORGE_BIND", default_value = "0.0.0.0:7070")]
    pub bind: SocketAddr,

    /// Path to the SQLite database file.
    #[arg(long, env = "TASKFORGE_DB", default_value = "taskforge.db")]
    pub database: String,

    /// Peer IPs refused before the WebSocket upgrade (comma-separated).
    #[arg(long, env = "TASKFORGE_IP_DENYLIST", value_delimiter = ',')]
    pub ip_denylist: Vec<IpAddr>,

    /// Allowed `Origin` header values. Empty means the header is not checked.
    #[arg(long, env = "TASKFORGE_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Name of a header every upgrade request must carry. Unset disables
    /// the check.
    #[arg(long, env = "TASKFORGE_IDENT_HEADER")]
    pub ident_header: Option<String>,

    /// Maximum connection attempts per peer IP per window.
    #[arg(long, env = "TASKFORGE_CONN_RATE_LIMIT", default_value_t = 10)]
    pub conn_rate_limit: u32,

    /// Connection-attempt rate window, in seconds.
    #[arg(long, env = "TASKFORGE_CONN_RATE_WINDOW_SECS", default_value_t = 60)]
    pub conn_rate_window_secs: u64,

    /// Maximum inbound messages per agent per 60 s window; excess frames
    /// are dropped with a warning.
    #[arg(long, env = "TASKFORGE_MSG_RATE_LIMIT", default_value_t = 100)]
    pub msg_rate_limit: u32,

    /// Webhook URL for run-outcome and agent-error notifications.
    /// Unset disables outbound notifications.
    #[arg(long, env = "TASKFORGE_WEBHOOK_URL")]
    pub webhook_url: Option<String>,
}
