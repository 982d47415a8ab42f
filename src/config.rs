//! Configuration for the demo server
//!
//! Listener and tuning options come from the command line (with environment
//! variable fallbacks); users come from a TOML file.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// CLI arguments for the demo Trojan server
///
/// Supports environment variables with TROJAN_KIT_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Plain TCP Trojan server")]
pub struct CliArgs {
    /// Address to accept Trojan connections on
    #[arg(long, env = "TROJAN_KIT_LISTEN", default_value = "0.0.0.0:443")]
    pub listen: SocketAddr,

    /// TOML file with [[users]] entries
    #[arg(long, env = "TROJAN_KIT_USERS_FILE")]
    pub users_file: PathBuf,

    /// Log level: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "TROJAN_KIT_LOG_LEVEL")]
    pub log_level: Option<String>,

    // ==================== Performance Tuning ====================
    /// Close a relay after this long without traffic (default: 5m)
    #[arg(long, env = "TROJAN_KIT_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub idle_timeout: Duration,

    /// TCP connect timeout to target server (default: 5s)
    #[arg(long, env = "TROJAN_KIT_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// Buffer size for data transfer in bytes (default: 32KB)
    #[arg(long, env = "TROJAN_KIT_BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "TROJAN_KIT_TCP_NODELAY",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if !self.users_file.exists() {
            return Err(anyhow!(
                "users file not found: {}",
                self.users_file.display()
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(anyhow!("idle_timeout must be greater than 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout must be greater than 0"));
        }
        if self.buffer_size < 1024 {
            return Err(anyhow!("buffer_size must be at least 1024 bytes"));
        }
        Ok(())
    }
}

/// One `[[users]]` entry
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Name used in logs and as the registry key
    pub name: String,
    /// Trojan password; the wire key is derived from it
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct UsersFile {
    #[serde(default)]
    pub users: Vec<User>,
}

impl UsersFile {
    pub fn parse(content: &str) -> Result<Self> {
        let file: UsersFile = toml::from_str(content).context("invalid users file")?;
        if file.users.is_empty() {
            return Err(anyhow!("users file defines no users"));
        }
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read users file {}", path.display()))?;
        Self::parse(&content)
    }
}

/// Connection tuning shared by every accepted connection
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.idle_timeout,
            connect_timeout: cli.connect_timeout,
            buffer_size: cli.buffer_size,
            tcp_nodelay: cli.tcp_nodelay,
        }
    }
}
