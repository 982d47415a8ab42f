use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::{self, Command, Key, KEY_LENGTH, MAX_CHUNK_HEADER_LEN};
use crate::address::{Socksaddr, SOCKS_SERIALIZER};
use crate::buf::Buffer;
use crate::error::{self, Error, Result, ResultExt};
use crate::logger::log;
use crate::network::{
    Context, Handler, Metadata, PacketConn, PacketRead, PacketWrite, TransportStream,
};

pub const PROTOCOL_NAME: &str = "trojan";

/// Server side of the Trojan protocol: user registry plus connection dispatch.
///
/// Registry changes take `&mut self` and accepting takes `&self`, so a service
/// shared between tasks needs an outer lock (for example `tokio::sync::RwLock`)
/// if users change while connections are being accepted.
pub struct Service<K, H> {
    handler: H,
    keys: HashMap<Key, K>,
    users: HashMap<K, Key>,
}

impl<K, H> Service<K, H>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    H: Handler,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            keys: HashMap::new(),
            users: HashMap::new(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Register `user` with the key derived from `password`.
    pub fn add_user(&mut self, user: K, password: &str) -> Result<()> {
        if self.users.contains_key(&user) {
            return Err(Error::UserExists);
        }
        let key = Key::from_password(password);
        if let Some(owner) = self.keys.get(&key) {
            return Err(Error::PasswordReused(owner.to_string()));
        }
        self.keys.insert(key, user.clone());
        self.users.insert(user, key);
        Ok(())
    }

    /// Returns whether the user was registered.
    pub fn remove_user(&mut self, user: &K) -> bool {
        match self.users.remove(user) {
            Some(key) => {
                self.keys.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn reset_users(&mut self) {
        self.keys = HashMap::new();
        self.users = HashMap::new();
    }

    /// Read the request from a fresh connection and hand it to the handler.
    ///
    /// TCP requests pass the stream through untouched; UDP requests wrap it in
    /// a [`RelayConn`]. Any failure before dispatch returns the connection and
    /// the metadata parsed so far inside [`HandshakeError`].
    pub async fn new_connection(
        &self,
        ctx: Context,
        mut conn: TransportStream,
        mut metadata: Metadata,
    ) -> std::result::Result<(), AcceptError> {
        let request = self.read_request(&mut conn, &metadata).await;
        let (user, command, destination) = match request {
            Ok(request) => request,
            Err(inner) => {
                return Err(HandshakeError {
                    conn,
                    metadata,
                    inner,
                }
                .into())
            }
        };

        metadata.protocol = Some(PROTOCOL_NAME);
        metadata.destination = Some(destination);
        log::debug!(
            peer = %SourceLabel(&metadata),
            user = %user,
            command = ?command,
            destination = ?metadata.destination,
            "trojan request accepted"
        );

        let ctx = ctx.with_user(user);
        let result = match command {
            Command::Tcp => self.handler.new_connection(ctx, conn, metadata).await,
            Command::Udp => {
                self.handler
                    .new_packet_connection(ctx, Box::new(RelayConn::new(conn)), metadata)
                    .await
            }
        };
        result.map_err(AcceptError::Handler)
    }

    async fn read_request(
        &self,
        conn: &mut TransportStream,
        metadata: &Metadata,
    ) -> Result<(K, Command, Socksaddr)> {
        let mut key = [0u8; KEY_LENGTH];
        conn.read_exact(&mut key)
            .await
            .map_err(Error::from_read)
            .context("read key")?;

        let peer = SourceLabel(metadata).to_string();
        let user = match self.keys.get(&Key::from_bytes(key)) {
            Some(user) => user.clone(),
            None => {
                log::authentication(&peer, false);
                return Err(Error::AuthFailure);
            }
        };
        log::authentication(&peer, true);

        protocol::skip_crlf(conn).await?;
        let command = conn
            .read_u8()
            .await
            .map_err(Error::from_read)
            .context("read command")?;
        let command = Command::try_from(command)?;
        let destination = SOCKS_SERIALIZER
            .read_addr_port(conn)
            .await
            .context("read destination")?;
        protocol::skip_crlf(conn).await?;

        Ok((user, command, destination))
    }
}

struct SourceLabel<'a>(&'a Metadata);

impl fmt::Display for SourceLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.source {
            Some(source) => write!(f, "{}", source),
            None => f.write_str("unknown"),
        }
    }
}

/// Request parsing failed. Owns the connection so the caller can close or
/// inspect it.
#[derive(thiserror::Error)]
#[error("process connection from {}: {}", SourceLabel(.metadata), .inner)]
pub struct HandshakeError {
    pub conn: TransportStream,
    pub metadata: Metadata,
    #[source]
    pub inner: Error,
}

impl HandshakeError {
    pub fn inner(&self) -> &Error {
        &self.inner
    }

    pub fn into_conn(self) -> TransportStream {
        self.conn
    }

    /// Shut down the write side of the connection.
    pub async fn close(mut self) -> std::io::Result<()> {
        self.conn.shutdown().await
    }
}

impl fmt::Debug for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeError")
            .field("metadata", &self.metadata)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

/// Failure of [`Service::new_connection`].
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The handler failed after a successful handshake
    #[error("{0:#}")]
    Handler(anyhow::Error),
}

impl AcceptError {
    pub fn is_closed_or_canceled(&self) -> bool {
        match self {
            AcceptError::Handshake(e) => e.inner.is_closed_or_canceled(),
            AcceptError::Handler(e) => error::is_closed_or_canceled_any(e),
        }
    }
}

/// Accepted UDP request: datagrams travel as relay chunks over the stream.
pub struct RelayConn<S> {
    inner: S,
}

impl<S> RelayConn<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + Unpin> PacketRead for RelayConn<S> {
    async fn read_packet(&mut self, buffer: &mut Buffer<'_>) -> Result<Socksaddr> {
        protocol::read_packet(&mut self.inner, buffer).await
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + Unpin> PacketWrite for RelayConn<S> {
    fn front_headroom(&self) -> usize {
        MAX_CHUNK_HEADER_LEN
    }

    async fn write_packet(&mut self, buffer: Buffer<'_>, destination: &Socksaddr) -> Result<()> {
        protocol::write_packet(&mut self.inner, buffer, destination).await
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> PacketConn for RelayConn<S> {
    fn split(self: Box<Self>) -> (Box<dyn PacketRead>, Box<dyn PacketWrite>) {
        let (reader, writer) = tokio::io::split(self.inner);
        (
            Box::new(RelayReader::new(reader)),
            Box::new(RelayWriter::new(writer)),
        )
    }
}

/// Receiving half of a split relay stream.
pub struct RelayReader<R> {
    inner: R,
}

impl<R> RelayReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> PacketRead for RelayReader<R> {
    async fn read_packet(&mut self, buffer: &mut Buffer<'_>) -> Result<Socksaddr> {
        protocol::read_packet(&mut self.inner, buffer).await
    }
}

/// Sending half of a split relay stream.
pub struct RelayWriter<W> {
    inner: W,
}

impl<W> RelayWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> PacketWrite for RelayWriter<W> {
    fn front_headroom(&self) -> usize {
        MAX_CHUNK_HEADER_LEN
    }

    async fn write_packet(&mut self, buffer: Buffer<'_>, destination: &Socksaddr) -> Result<()> {
        protocol::write_packet(&mut self.inner, buffer, destination).await
    }
}
