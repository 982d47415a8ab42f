//! Interfaces shared by protocol implementations and the code that drives them
//!
//! - [`TransportStream`]: any boxed bidirectional byte stream
//! - [`StreamHandler`] / [`PacketHandler`]: where accepted connections are delivered
//! - [`PacketRead`] / [`PacketWrite`] / [`PacketConn`]: datagram channels
//! - [`BufferWrite`]: optional zero-copy write path, advertised through [`Capabilities`]
//! - [`Context`] / [`Metadata`]: request-scoped data travelling with a connection

use async_trait::async_trait;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::address::Socksaddr;
use crate::buf::Buffer;
use crate::error::Result;

/// Unified transport stream trait combining AsyncRead + AsyncWrite + Send + Unpin
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Unified transport stream type
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

/// Connection metadata
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Protocol that accepted the connection, set once the handshake succeeds
    pub protocol: Option<&'static str>,
    /// Client peer address
    pub source: Option<SocketAddr>,
    /// Requested destination
    pub destination: Option<Socksaddr>,
}

impl Metadata {
    pub fn from_source(source: SocketAddr) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
struct AuthUser<K>(K);

/// Request-scoped values: a cancellation signal plus typed extensions such as
/// the authenticated user.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    extensions: http::Extensions,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            extensions: http::Extensions::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Attach the user a connection authenticated as.
    pub fn with_user<K>(mut self, user: K) -> Self
    where
        K: Clone + Send + Sync + 'static,
    {
        self.extensions.insert(AuthUser(user));
        self
    }

    /// User attached by [`with_user`](Context::with_user), if its type is `K`.
    pub fn user<K>(&self) -> Option<&K>
    where
        K: Clone + Send + Sync + 'static,
    {
        self.extensions.get::<AuthUser<K>>().map(|u| &u.0)
    }

    pub fn extensions(&self) -> &http::Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.extensions
    }
}

/// Optional write paths a writer supports beyond `AsyncWrite`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `write_buffer` frames the buffer in place instead of copying it
    pub buffer_write: bool,
    /// Headroom a buffer needs so `write_buffer` never has to copy
    pub front_headroom: usize,
}

/// Writers that can take ownership of a whole [`Buffer`].
///
/// The default implementation is the safe fallback for writers without a
/// zero-copy path: it writes the payload bytes and releases the buffer.
#[async_trait]
pub trait BufferWrite: AsyncWrite + Send + Unpin {
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Write the whole payload. The buffer is released on success and failure.
    async fn write_buffer(&mut self, buffer: Buffer<'_>) -> Result<()> {
        buffer.write_to(self).await
    }
}

impl BufferWrite for tokio::net::TcpStream {}
impl BufferWrite for tokio::io::DuplexStream {}
impl BufferWrite for TransportStream {}
impl<T: AsyncWrite + Send> BufferWrite for tokio::io::WriteHalf<T> {}

/// Copy `reader` into `writer` through pooled buffers until EOF.
///
/// The writer's capabilities are looked up once before the loop; buffers are
/// allocated with the headroom it asks for so framing writers can prepend their
/// header without copying. Returns the number of payload bytes copied.
pub async fn copy_buffered<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: BufferWrite + ?Sized,
{
    let caps = writer.capabilities();
    let pool = crate::buf::BufferPool::global();
    let mut total = 0u64;
    loop {
        let mut buffer = pool.allocate(buffer_size, caps.front_headroom, 0);
        let n = buffer.read_once_from(reader).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        if caps.buffer_write {
            writer.write_buffer(buffer).await?;
        } else {
            buffer.write_to(writer).await?;
        }
    }
}

/// Receiving side of a datagram channel.
#[async_trait]
pub trait PacketRead: Send {
    /// Read one datagram onto the end of `buffer` and return its source or destination.
    async fn read_packet(&mut self, buffer: &mut Buffer<'_>) -> Result<Socksaddr>;
}

/// Sending side of a datagram channel.
#[async_trait]
pub trait PacketWrite: Send {
    /// Headroom a buffer needs so framing happens in place.
    fn front_headroom(&self) -> usize {
        0
    }

    /// Send one datagram. The buffer is released on success and failure.
    async fn write_packet(&mut self, buffer: Buffer<'_>, destination: &Socksaddr) -> Result<()>;
}

/// Datagram channel that can be split so both directions run concurrently.
pub trait PacketConn: PacketRead + PacketWrite {
    fn split(self: Box<Self>) -> (Box<dyn PacketRead>, Box<dyn PacketWrite>);
}

/// Receives accepted stream connections.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn new_connection(
        &self,
        ctx: Context,
        conn: TransportStream,
        metadata: Metadata,
    ) -> anyhow::Result<()>;
}

/// Receives accepted datagram channels.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn new_packet_connection(
        &self,
        ctx: Context,
        conn: Box<dyn PacketConn>,
        metadata: Metadata,
    ) -> anyhow::Result<()>;
}

/// Both handler kinds, as required by protocol services.
pub trait Handler: StreamHandler + PacketHandler {}

impl<T: StreamHandler + PacketHandler> Handler for T {}
