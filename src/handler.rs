//! Outbound side of the demo server
//!
//! [`DirectHandler`] connects accepted Trojan requests straight to their
//! destination: TCP requests through a new `TcpStream`, UDP requests through
//! one `UdpSocket` per association.

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::config::ConnConfig;
use crate::relay::{copy_bidirectional_with_idle_timeout, Activity, RelayOutcome};
use trojan_kit::address::{Host, Socksaddr};
use trojan_kit::buf::BufferPool;
use trojan_kit::error::{is_closed_or_canceled_any, Error};
use trojan_kit::logger::log;
use trojan_kit::network::{
    Context, Metadata, PacketConn, PacketHandler, PacketRead, PacketWrite, StreamHandler,
    TransportStream,
};
use trojan_kit::task;

/// Largest UDP payload relayed in either direction
const MAX_DATAGRAM: usize = 65535;
/// Domain destinations remembered per UDP association
const MAX_CACHED_TARGETS: usize = 256;

type RelayTask = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

/// Resolve a destination to one socket address. Domain names go through the
/// system resolver; the first answer wins.
pub async fn resolve(destination: &Socksaddr) -> Result<SocketAddr> {
    if let Some(addr) = destination.socket_addr() {
        return Ok(addr);
    }
    let Host::Fqdn(name) = destination.host() else {
        return Err(anyhow!("unresolvable destination {}", destination));
    };
    tokio::net::lookup_host((name.as_str(), destination.port()))
        .await
        .with_context(|| format!("resolve {}", destination))?
        .next()
        .ok_or_else(|| anyhow!("no address for {}", destination))
}

/// Resolved domain destinations of one UDP association.
///
/// IP destinations bypass the cache. When it is full the whole map is
/// dropped and filled again from the resolver.
#[derive(Default)]
struct TargetCache {
    resolved: HashMap<Socksaddr, SocketAddr>,
}

impl TargetCache {
    async fn resolve(&mut self, destination: &Socksaddr) -> Result<SocketAddr> {
        if let Some(addr) = destination.socket_addr() {
            return Ok(addr);
        }
        if let Some(addr) = self.resolved.get(destination) {
            return Ok(*addr);
        }
        let addr = resolve(destination).await?;
        if self.resolved.len() >= MAX_CACHED_TARGETS {
            self.resolved.clear();
        }
        self.resolved.insert(destination.clone(), addr);
        Ok(addr)
    }
}

/// IPv6 sockets only take IPv6 peers; IPv4 targets are sent v4-mapped.
fn udp_target(socket: &UdpSocket, target: SocketAddr) -> SocketAddr {
    match (socket.local_addr(), target) {
        (Ok(SocketAddr::V6(_)), SocketAddr::V4(v4)) => {
            SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
        }
        _ => target,
    }
}

/// Dials every destination directly.
#[derive(Debug, Clone)]
pub struct DirectHandler {
    config: ConnConfig,
}

impl DirectHandler {
    pub fn new(config: ConnConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, destination: &Socksaddr) -> Result<TcpStream> {
        let addr = resolve(destination).await?;
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", destination))?
            .with_context(|| format!("connect to {}", destination))?;
        if self.config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(stream)
    }
}

/// Client datagrams out through the UDP socket.
async fn uplink(
    mut reader: Box<dyn PacketRead>,
    socket: Arc<UdpSocket>,
    activity: Activity,
) -> Result<()> {
    let mut targets = TargetCache::default();
    loop {
        let mut buffer = BufferPool::global().allocate(MAX_DATAGRAM, 0, 0);
        let destination = reader.read_packet(&mut buffer).await?;
        let target = targets.resolve(&destination).await?;
        socket
            .send_to(buffer.bytes(), udp_target(&socket, target))
            .await?;
        activity.touch();
    }
}

/// Replies from the UDP socket back to the client, framed in place.
async fn downlink(
    mut writer: Box<dyn PacketWrite>,
    socket: Arc<UdpSocket>,
    activity: Activity,
) -> Result<()> {
    let headroom = writer.front_headroom();
    loop {
        let mut buffer = BufferPool::global().allocate(MAX_DATAGRAM, headroom, 0);
        let (n, from) = socket.recv_from(buffer.free_tail()).await?;
        buffer.extend(n)?;
        writer
            .write_packet(buffer, &Socksaddr::from(from))
            .await?;
        activity.touch();
    }
}

/// Run `fut` until it finishes or the relay group is torn down.
async fn until_cancelled<F>(token: CancellationToken, fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        result = fut => result,
        _ = token.cancelled() => Ok(()),
    }
}

fn peer_of(metadata: &Metadata) -> String {
    metadata
        .source
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn destination_of(metadata: &Metadata) -> Result<Socksaddr> {
    metadata
        .destination
        .clone()
        .ok_or_else(|| anyhow!("request carries no destination"))
}

#[async_trait]
impl StreamHandler for DirectHandler {
    async fn new_connection(
        &self,
        ctx: Context,
        conn: TransportStream,
        metadata: Metadata,
    ) -> Result<()> {
        let destination = destination_of(&metadata)?;
        let peer = peer_of(&metadata);
        let user = ctx.user::<String>().cloned().unwrap_or_default();

        let remote = self.connect(&destination).await?;
        log::connection(&peer, "connected");

        let relay = copy_bidirectional_with_idle_timeout(
            conn,
            remote,
            self.config.idle_timeout,
            self.config.buffer_size,
        );
        let outcome = tokio::select! {
            result = relay => result?,
            _ = ctx.cancel_token().cancelled() => return Err(Error::Canceled.into()),
        };

        match outcome {
            RelayOutcome::Finished { uplink, downlink } => log::debug!(
                peer = %peer,
                user = %user,
                target = %destination,
                uplink,
                downlink,
                "TCP relay finished"
            ),
            RelayOutcome::Idle => log::debug!(
                peer = %peer,
                user = %user,
                target = %destination,
                "TCP relay closed after idle timeout"
            ),
        }
        log::connection(&peer, "closed");
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for DirectHandler {
    async fn new_packet_connection(
        &self,
        ctx: Context,
        conn: Box<dyn PacketConn>,
        metadata: Metadata,
    ) -> Result<()> {
        let peer = peer_of(&metadata);
        let socket = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(_) => UdpSocket::bind(("0.0.0.0", 0))
                .await
                .context("bind UDP socket")?,
        };
        let socket = Arc::new(socket);
        let activity = Activity::new();
        let (reader, writer) = conn.split();
        log::connection(&peer, "udp associated");

        let up: RelayTask = {
            let socket = Arc::clone(&socket);
            let activity = activity.clone();
            Box::new(move |token| until_cancelled(token, uplink(reader, socket, activity)).boxed())
        };
        let down: RelayTask = {
            let socket = Arc::clone(&socket);
            let activity = activity.clone();
            Box::new(move |token| {
                until_cancelled(token, downlink(writer, socket, activity)).boxed()
            })
        };

        let idle_timeout = self.config.idle_timeout;
        let idle: RelayTask = Box::new(move |token| {
            let wait = async move {
                activity.wait_idle(idle_timeout).await;
                Ok(())
            };
            until_cancelled(token, wait).boxed()
        });

        let result = task::race([up, down, idle], ctx.cancel_token()).await;
        log::connection(&peer, "udp closed");
        match result {
            Err(e) if !is_closed_or_canceled_any(&e) => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use trojan_kit::buf::Buffer;
    use trojan_kit::trojan::RelayConn;

    const TEST_WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> ConnConfig {
        ConnConfig {
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            buffer_size: 4096,
            tcp_nodelay: true,
        }
    }

    fn metadata_for(destination: Socksaddr) -> Metadata {
        Metadata {
            protocol: Some("trojan"),
            source: Some("127.0.0.1:50000".parse().unwrap()),
            destination: Some(destination),
        }
    }

    #[tokio::test]
    async fn test_resolve_ip_and_fqdn() {
        let ip = Socksaddr::ipv4([127, 0, 0, 1], 80);
        assert_eq!(resolve(&ip).await.unwrap(), "127.0.0.1:80".parse().unwrap());

        let local = resolve(&Socksaddr::fqdn("localhost", 8080)).await.unwrap();
        assert!(local.ip().is_loopback());
        assert_eq!(local.port(), 8080);
    }

    #[tokio::test]
    async fn test_target_cache_reuses_resolved_names() {
        let mut targets = TargetCache::default();
        let name = Socksaddr::fqdn("localhost", 5353);
        let first = targets.resolve(&name).await.unwrap();
        assert!(first.ip().is_loopback());

        // A second lookup is served from the cache, not the resolver
        let pinned: SocketAddr = "192.0.2.7:5353".parse().unwrap();
        targets.resolved.insert(name.clone(), pinned);
        assert_eq!(targets.resolve(&name).await.unwrap(), pinned);

        let ip = Socksaddr::ipv4([127, 0, 0, 1], 53);
        targets.resolve(&ip).await.unwrap();
        assert_eq!(targets.resolved.len(), 1);
    }

    #[tokio::test]
    async fn test_target_cache_is_bounded() {
        let mut targets = TargetCache::default();
        let addr: SocketAddr = "192.0.2.1:53".parse().unwrap();
        for i in 0..MAX_CACHED_TARGETS {
            targets
                .resolved
                .insert(Socksaddr::fqdn(format!("host{i}.test"), 53), addr);
        }
        targets
            .resolve(&Socksaddr::fqdn("localhost", 53))
            .await
            .unwrap();
        assert_eq!(targets.resolved.len(), 1);
    }

    #[tokio::test]
    async fn test_tcp_relay_to_echo_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let (client, server_side) = tokio::io::duplex(1024);
        let handler = DirectHandler::new(test_config());
        let relay = tokio::spawn(async move {
            handler
                .new_connection(
                    Context::new().with_user("alice".to_string()),
                    Box::pin(server_side),
                    metadata_for(Socksaddr::from(target)),
                )
                .await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        wr.write_all(b"echo me").await.unwrap();
        let mut got = [0u8; 7];
        tokio::time::timeout(TEST_WAIT, rd.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"echo me");

        wr.shutdown().await.unwrap();
        drop(rd);
        drop(wr);
        tokio::time::timeout(TEST_WAIT, relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_destination_is_error() {
        let (_client, server_side) = tokio::io::duplex(64);
        let handler = DirectHandler::new(test_config());
        let err = handler
            .new_connection(Context::new(), Box::pin(server_side), Metadata::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no destination"));
    }

    #[tokio::test]
    async fn test_udp_relay_to_echo_socket() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let (client, server_side) = tokio::io::duplex(4096);
        let handler = DirectHandler::new(test_config());
        let cancel = CancellationToken::new();
        let ctx = Context::with_cancel(cancel.clone());
        let relay = tokio::spawn(async move {
            handler
                .new_packet_connection(
                    ctx,
                    Box::new(RelayConn::new(server_side)),
                    metadata_for(Socksaddr::from(echo_addr)),
                )
                .await
        });

        let mut client = RelayConn::new(client);
        client
            .write_packet(Buffer::from_slice(b"datagram"), &Socksaddr::from(echo_addr))
            .await
            .unwrap();

        let mut reply = Buffer::new(1500);
        let from = tokio::time::timeout(TEST_WAIT, client.read_packet(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.bytes(), b"datagram");
        assert_eq!(from.port(), echo_addr.port());

        cancel.cancel();
        tokio::time::timeout(TEST_WAIT, relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
