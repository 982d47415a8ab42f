//! Server startup and accept loop
//!
//! Every accepted TCP connection is handed to the Trojan service in its own
//! task. The loop stops when the shutdown token fires.

use crate::config::ConnConfig;
use crate::handler::DirectHandler;

use anyhow::{Context as _, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use trojan_kit::logger::log;
use trojan_kit::network::{Context, Metadata, TransportStream};
use trojan_kit::trojan::{AcceptError, Service};

/// Service type served by the binary: users are named by strings.
pub type TrojanService = Service<String, DirectHandler>;

/// Bind the listener
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))
}

/// Run one accepted connection through the service
async fn serve_connection(
    service: &TrojanService,
    stream: TcpStream,
    peer: SocketAddr,
    config: ConnConfig,
    cancel: CancellationToken,
) {
    if config.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    let conn: TransportStream = Box::pin(stream);
    let ctx = Context::with_cancel(cancel);

    match service
        .new_connection(ctx, conn, Metadata::from_source(peer))
        .await
    {
        Ok(()) => {}
        Err(AcceptError::Handshake(e)) => {
            if e.inner().is_closed_or_canceled() {
                log::debug!(peer = %peer, error = %e, "Connection closed during handshake");
            } else {
                log::protocol("handshake", Some(&e.to_string()));
            }
            let _ = e.close().await;
        }
        Err(e) if e.is_closed_or_canceled() => {
            log::debug!(peer = %peer, error = %e, "Connection closed");
        }
        Err(e) => {
            log::warn!(peer = %peer, error = %e, "Connection error");
        }
    }
}

/// Run the server accept loop until `cancel` fires
pub async fn run_server(
    listener: TcpListener,
    service: Arc<TrojanService>,
    config: ConnConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    log::info!(
        address = %local_addr,
        users = service.user_count(),
        idle_timeout = ?config.idle_timeout,
        "Server started"
    );

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                log::connection(&peer.to_string(), "new");
                let service = Arc::clone(&service);
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    serve_connection(&service, stream, peer, config, cancel).await;
                });
            }
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                // Continue accepting unless it's a fatal error
                if e.kind() == std::io::ErrorKind::Other {
                    break;
                }
            }
        }
    }

    log::info!(address = %local_addr, "Server stopped");
    Ok(())
}
