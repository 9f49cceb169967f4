//! Agent configuration: where the controller lives and who we are.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "taskforge-agent", about = "Taskforge execution agent")]
pub struct AgentConfig {
    /// WebSocket URL of the controller, e.g. `ws://controller:7070/ws`.
    #[arg(
        long,
        env = "TASKFORGE_CONTROLLER_URL",
        default_value = "ws://127.0.0.1:7070/ws"
    )]
    pub controller_url: String,

    /// This agent's identifier, as registered on the controller.
    #[arg(long, env = "TASKFORGE_AGENT_ID")]
    pub agent_id: String,

    /// Shared secret presented during the handshake.
    #[arg(long, env = "TASKFORGE_AUTH_TOKEN")]
    pub auth_token: String,
}
