//! Plain TCP Trojan server built on `trojan_kit`
//!
//! - `config`: CLI arguments and the users file
//! - `handler`: direct outbound for TCP and UDP requests
//! - `relay`: idle-aware bidirectional copy
//! - `server_runner`: accept loop

mod config;
mod handler;
mod relay;
mod server_runner;

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context as _, Result};
use futures_util::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use trojan_kit::logger::{self, log, LogLevel};
use trojan_kit::task;
use trojan_kit::trojan::Service;

use crate::handler::DirectHandler;

/// The server and the signal listener; whichever ends first stops the other.
type ShutdownTask = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
        log::info!("Shutdown signal received...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logger comes up before clap so configuration errors are logged too
    logger::init_logger(logger::get_log_level_from_args());

    let cli = config::CliArgs::parse_args();
    cli.validate()?;
    if let Some(level) = cli.log_level.as_deref() {
        if LogLevel::parse(level).is_none() {
            log::warn!(level = level, "Unknown log level, keeping the default");
        }
    }

    let users = config::UsersFile::load(&cli.users_file)?;
    let conn_config = config::ConnConfig::from_cli(&cli);

    let mut service = Service::new(DirectHandler::new(conn_config));
    for user in users.users {
        let name = user.name.clone();
        service
            .add_user(user.name, &user.password)
            .with_context(|| format!("add user {}", name))?;
    }
    log::info!(users = service.user_count(), "Users loaded");

    let listener = server_runner::bind(cli.listen).await?;
    let service = Arc::new(service);
    let shutdown = CancellationToken::new();

    let serve: ShutdownTask = Box::new(move |token| {
        server_runner::run_server(listener, service, conn_config, token).boxed()
    });
    let signal: ShutdownTask = Box::new(|_token| wait_for_signal().boxed());
    let tasks = [serve, signal];

    task::race(tasks, &shutdown).await?;
    log::info!("Shutdown complete");
    Ok(())
}
