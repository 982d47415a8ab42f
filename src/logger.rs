use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log verbosity accepted on the command line and in the users file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Read `log.level` from a TOML file, if present and valid.
pub fn log_level_from_file(path: &Path) -> Option<LogLevel> {
    let content = std::fs::read_to_string(path).ok()?;
    let value = toml::from_str::<toml::Value>(&content).ok()?;
    value
        .get("log")?
        .get("level")?
        .as_str()
        .and_then(LogLevel::parse)
}

/// Log level before clap runs, so argument errors are already logged correctly.
///
/// `--log-level` wins; otherwise the `log.level` key of `--users-file` is used.
pub fn get_log_level_from_args() -> Option<LogLevel> {
    let args: Vec<String> = std::env::args().collect();
    let value_of = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    };

    if let Some(level) = value_of("--log-level").and_then(LogLevel::parse) {
        return Some(level);
    }
    value_of("--users-file").and_then(|path| log_level_from_file(Path::new(path)))
}

/// Install the global subscriber. `RUST_LOG` overrides `log_level`.
pub fn init_logger(log_level: Option<LogLevel>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = log_level.unwrap_or_default();
        EnvFilter::new(format!("trojan_kit={}", level.as_str()))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    /// Connection lifecycle event
    pub fn connection(peer: &str, event: &str) {
        info!(peer = peer, event = event, "Connection");
    }

    /// Authentication outcome
    pub fn authentication(peer: &str, success: bool) {
        if success {
            debug!(peer = peer, "Authentication successful");
        } else {
            warn!(peer = peer, "Authentication failed");
        }
    }

    /// Protocol parsing event
    pub fn protocol(event: &str, error: Option<&str>) {
        if let Some(err) = error {
            warn!(event = event, error = err, "Protocol");
        } else {
            debug!(event = event, "Protocol");
        }
    }
}
