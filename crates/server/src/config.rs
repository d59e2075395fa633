//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use uuid::Uuid;

use crate::paths;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("VIBECHECK_PSK is not set; refusing to start without a shared secret (try `vibecheck generate-psk`)")]
    MissingPsk,

    #[error("heartbeat interval must be at least one second")]
    InvalidHeartbeat,

    #[error("could not determine the home directory; pass --data-dir and --logs-root")]
    NoHomeDir,
}

#[derive(Debug, Parser)]
#[command(name = "vibecheck")]
#[command(version)]
#[command(about = "Remote approval and messaging bridge for headless coding agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP and WebSocket server (default)
    Start,

    /// Print a fresh random shared secret
    GeneratePsk,
}

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address to bind
    #[arg(long, env = "VIBECHECK_BIND", default_value = "0.0.0.0", global = true)]
    pub bind: String,

    /// Port to listen on
    #[arg(long, env = "VIBECHECK_PORT", default_value_t = 7870, global = true)]
    pub port: u16,

    /// Shared secret clients must present
    #[arg(long, env = "VIBECHECK_PSK", hide_env_values = true, global = true)]
    pub psk: Option<String>,

    /// Directory for vibecheck's own files (logs)
    #[arg(long, env = "VIBECHECK_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Root of the agent's per-session log directories
    #[arg(long, env = "VIBECHECK_LOGS_ROOT", global = true)]
    pub logs_root: Option<PathBuf>,

    /// Directory holding the web frontend
    #[arg(long, env = "VIBECHECK_STATIC_DIR", global = true)]
    pub static_dir: Option<PathBuf>,

    /// Agent program speaking NDJSON over stdio
    #[arg(long, env = "VIBECHECK_AGENT_COMMAND", global = true)]
    pub agent_command: Option<String>,

    /// Extra argument for the agent program (repeatable)
    #[arg(long = "agent-arg", allow_hyphen_values = true, global = true)]
    pub agent_args: Vec<String>,

    /// Working directory for the agent program
    #[arg(long, env = "VIBECHECK_AGENT_CWD", global = true)]
    pub agent_cwd: Option<PathBuf>,

    /// Seconds between heartbeat events on each socket
    #[arg(long, env = "VIBECHECK_HEARTBEAT_SECS", default_value_t = 30, global = true)]
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub psk: String,
    pub data_dir: PathBuf,
    pub logs_root: PathBuf,
    pub static_dir: Option<PathBuf>,
    pub agent: Option<AgentCommand>,
    pub heartbeat_interval: Duration,
}

impl ServerArgs {
    pub fn resolve(self) -> Result<ServerConfig, ConfigError> {
        let psk = self
            .psk
            .map(|psk| psk.trim().to_string())
            .filter(|psk| !psk.is_empty())
            .ok_or(ConfigError::MissingPsk)?;
        if self.heartbeat_secs == 0 {
            return Err(ConfigError::InvalidHeartbeat);
        }

        let agent = self
            .agent_command
            .filter(|program| !program.trim().is_empty())
            .map(|program| AgentCommand {
                program,
                args: self.agent_args,
                cwd: self.agent_cwd,
            });

        Ok(ServerConfig {
            bind: self.bind,
            port: self.port,
            psk,
            data_dir: paths::resolve_data_dir(self.data_dir.as_deref())?,
            logs_root: paths::resolve_session_logs_root(self.logs_root.as_deref())?,
            static_dir: self.static_dir,
            agent,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
        })
    }
}

/// 64 hex characters of randomness.
pub fn generate_psk() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}
