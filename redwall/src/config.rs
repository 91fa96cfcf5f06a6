// redwall/src/config.rs
//
// Daemon configuration. Every knob is a flag with an environment fallback so
// container deployments configure via env only. Provider keys never appear
// in logs; startup reports their presence as booleans.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name    = "redwall",
    about   = "Inline security proxy for LLM provider traffic",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Config {
    /// Proxy listen port.
    #[arg(long, env = "PORT", default_value = "8466")]
    pub port: u16,

    /// Read-side API port. The daemon does not bind it; it is accepted here
    /// so one env file can configure both processes.
    #[arg(long, env = "API_PORT", default_value = "8467")]
    pub api_port: u16,

    /// SQLite database path, shared with the read-side API.
    #[arg(long, env = "DATABASE_PATH", default_value = "redwall.db")]
    pub database_path: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    /// Sent back with PLAN_LIMIT responses.
    #[arg(long, env = "UPGRADE_URL", default_value = "https://redteaming.ai/upgrade")]
    pub upgrade_url: String,
}
