use async_trait::async_trait;
use futures_util::future::poll_fn;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::protocol::{
    self, put_request, request_len, Command, Key, MAX_CHUNK_HEADER_LEN, MAX_COALESCED_WRITE,
    MAX_PACKET_REQUEST_LEN,
};
use super::service::RelayReader;
use crate::address::Socksaddr;
use crate::buf::Buffer;
use crate::error::Result;
use crate::network::{BufferWrite, Capabilities, PacketConn, PacketRead, PacketWrite};

enum WriteState {
    Unsent,
    /// `pending[..header_len]` is the request. Bytes after it belong to the
    /// write being polled and are discarded if that write returns `Pending`.
    Sending {
        pending: Vec<u8>,
        header_len: usize,
        written: usize,
    },
    HeaderSent,
}

pin_project! {
    /// Client stream that sends the Trojan request in front of the first write.
    ///
    /// Reads pass straight through. The server only answers once it has the
    /// request, so write (or flush) before waiting on a read.
    pub struct ClientConn<S> {
        #[pin]
        inner: S,
        key: Key,
        destination: Socksaddr,
        state: WriteState,
    }
}

impl<S> ClientConn<S> {
    pub fn new(inner: S, key: Key, destination: Socksaddr) -> Self {
        Self {
            inner,
            key,
            destination,
            state: WriteState::Unsent,
        }
    }

    pub fn destination(&self) -> &Socksaddr {
        &self.destination
    }

    pub fn is_header_sent(&self) -> bool {
        matches!(self.state, WriteState::HeaderSent)
    }

    /// Headroom a buffer passed to `write_buffer` needs for in-place framing.
    pub fn front_headroom(&self) -> usize {
        if self.is_header_sent() {
            0
        } else {
            request_len(&self.destination)
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite> ClientConn<S> {
    /// Drive the request onto the wire. Returns how many bytes of `payload`
    /// went out together with it, never more than `payload.len()`.
    fn poll_handshake(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        payload: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        loop {
            match this.state {
                WriteState::HeaderSent => return Poll::Ready(Ok(0)),
                WriteState::Unsent => {
                    let header_len = request_len(this.destination);
                    let mut pending =
                        Vec::with_capacity(header_len + payload.len().min(MAX_COALESCED_WRITE));
                    put_request(&mut pending, this.key, Command::Tcp, this.destination)?;
                    *this.state = WriteState::Sending {
                        pending,
                        header_len,
                        written: 0,
                    };
                }
                WriteState::Sending {
                    pending,
                    header_len,
                    written,
                } => {
                    let header_len = *header_len;
                    pending.truncate(header_len);
                    if !payload.is_empty() && header_len + payload.len() < MAX_COALESCED_WRITE {
                        pending.extend_from_slice(payload);
                    }
                    while *written < header_len {
                        let n = ready!(this.inner.as_mut().poll_write(cx, &pending[*written..]))?;
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                        }
                        *written += n;
                    }
                    let consumed = *written - header_len;
                    *this.state = WriteState::HeaderSent;
                    return Poll::Ready(Ok(consumed));
                }
            }
        }
    }
}

impl<S: AsyncRead> AsyncRead for ClientConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for ClientConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.is_header_sent() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let consumed = ready!(self.as_mut().poll_handshake(cx, buf))?;
            if consumed > 0 {
                return Poll::Ready(Ok(consumed));
            }
        }
        self.project().inner.poll_write(cx, buf)
    }

    /// Flushing an unused connection sends the bare request.
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.is_header_sent() {
            ready!(self.as_mut().poll_handshake(cx, &[]))?;
        }
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if matches!(self.state, WriteState::Sending { .. }) {
            ready!(self.as_mut().poll_handshake(cx, &[]))?;
        }
        self.project().inner.poll_shutdown(cx)
    }
}

#[async_trait]
impl<S: BufferWrite> BufferWrite for ClientConn<S> {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            buffer_write: true,
            front_headroom: self.front_headroom() + self.inner.capabilities().front_headroom,
        }
    }

    async fn write_buffer(&mut self, mut buffer: Buffer<'_>) -> Result<()> {
        if let WriteState::Sending { .. } = self.state {
            poll_fn(|cx| Pin::new(&mut *self).poll_handshake(cx, &[])).await?;
        }
        if let WriteState::Unsent = self.state {
            let header_len = request_len(&self.destination);
            if buffer.start() < header_len {
                protocol::client_handshake_buffer(
                    &mut self.inner,
                    &self.key,
                    &self.destination,
                    buffer,
                )
                .await?;
                self.state = WriteState::HeaderSent;
                return Ok(());
            }
            let mut header = buffer.extend_header(header_len)?;
            put_request(&mut header, &self.key, Command::Tcp, &self.destination)?;
            self.inner.write_buffer(buffer).await?;
            self.state = WriteState::HeaderSent;
            return Ok(());
        }
        self.inner.write_buffer(buffer).await
    }
}

/// Client side of a UDP request over a stream.
///
/// The first datagram carries the request; the state flips after that first
/// attempt whether or not it succeeded.
pub struct ClientPacketConn<S> {
    inner: S,
    key: Key,
    header_sent: bool,
}

impl<S> ClientPacketConn<S> {
    pub fn new(inner: S, key: Key) -> Self {
        Self {
            inner,
            key,
            header_sent: false,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> ClientPacketConn<S> {
    /// Read one datagram into `buf`, returning its length and source.
    pub async fn read_from(&mut self, buf: &mut [u8]) -> Result<(usize, Socksaddr)> {
        let mut buffer = Buffer::wrap(buf);
        let source = self.read_packet(&mut buffer).await?;
        Ok((buffer.len(), source))
    }

    /// Send `data` as one datagram to `destination`.
    pub async fn write_to(&mut self, data: &[u8], destination: &Socksaddr) -> Result<usize> {
        let mut buffer = Buffer::with_reserve(data.len(), self.front_headroom(), 0);
        buffer.write(data)?;
        self.write_packet(buffer, destination).await?;
        Ok(data.len())
    }
}

async fn send_packet<W>(
    conn: &mut W,
    key: &Key,
    header_sent: &mut bool,
    buffer: Buffer<'_>,
    destination: &Socksaddr,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if *header_sent {
        return protocol::write_packet(conn, buffer, destination).await;
    }
    *header_sent = true;
    protocol::client_handshake_packet(conn, key, destination, buffer).await
}

fn packet_headroom(header_sent: bool) -> usize {
    if header_sent {
        MAX_CHUNK_HEADER_LEN
    } else {
        MAX_PACKET_REQUEST_LEN
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + Unpin> PacketRead for ClientPacketConn<S> {
    async fn read_packet(&mut self, buffer: &mut Buffer<'_>) -> Result<Socksaddr> {
        protocol::read_packet(&mut self.inner, buffer).await
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + Unpin> PacketWrite for ClientPacketConn<S> {
    fn front_headroom(&self) -> usize {
        packet_headroom(self.header_sent)
    }

    async fn write_packet(&mut self, buffer: Buffer<'_>, destination: &Socksaddr) -> Result<()> {
        send_packet(&mut self.inner, &self.key, &mut self.header_sent, buffer, destination).await
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> PacketConn for ClientPacketConn<S> {
    fn split(self: Box<Self>) -> (Box<dyn PacketRead>, Box<dyn PacketWrite>) {
        let (reader, writer) = tokio::io::split(self.inner);
        (
            Box::new(RelayReader::new(reader)),
            Box::new(ClientPacketWriter {
                inner: writer,
                key: self.key,
                header_sent: self.header_sent,
            }),
        )
    }
}

/// Sending half of a split [`ClientPacketConn`]; still owes the request if
/// nothing was sent before the split.
struct ClientPacketWriter<W> {
    inner: W,
    key: Key,
    header_sent: bool,
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> PacketWrite for ClientPacketWriter<W> {
    fn front_headroom(&self) -> usize {
        packet_headroom(self.header_sent)
    }

    async fn write_packet(&mut self, buffer: Buffer<'_>, destination: &Socksaddr) -> Result<()> {
        send_packet(&mut self.inner, &self.key, &mut self.header_sent, buffer, destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufferPool;
    use crate::network::copy_buffered;
    use crate::trojan::protocol::{client_handshake, key};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    async fn drain(mut reader: tokio::io::DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    /// Sink that is not ready on its first write and takes everything after.
    #[derive(Default)]
    struct StallsOnce {
        stalled: bool,
        wire: Vec<u8>,
    }

    impl AsyncWrite for StallsOnce {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if !self.stalled {
                self.stalled = true;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            self.wire.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn tcp_request(key: &Key, dest: &Socksaddr) -> Vec<u8> {
        let mut request = Vec::new();
        put_request(&mut request, key, Command::Tcp, dest).unwrap();
        request
    }

    #[tokio::test]
    async fn test_pending_write_is_not_sent_by_flush() {
        let dest = Socksaddr::ipv4([10, 0, 0, 2], 80);
        let key = key("pw");
        let mut conn = ClientConn::new(StallsOnce::default(), key, dest.clone());

        poll_fn(|cx| {
            assert!(Pin::new(&mut conn).poll_write(cx, b"PAYLOAD").is_pending());
            Poll::Ready(())
        })
        .await;
        conn.flush().await.unwrap();
        assert!(conn.is_header_sent());
        conn.write_all(b"PAYLOAD").await.unwrap();

        let mut expected = tcp_request(&key, &dest);
        expected.extend_from_slice(b"PAYLOAD");
        assert_eq!(conn.get_ref().wire, expected);
    }

    #[tokio::test]
    async fn test_retried_write_reports_at_most_its_own_length() {
        let dest = Socksaddr::fqdn("example.net", 443);
        let key = key("pw");
        let mut conn = ClientConn::new(StallsOnce::default(), key, dest.clone());

        let n = poll_fn(|cx| {
            assert!(Pin::new(&mut conn).poll_write(cx, b"0123456789").is_pending());
            Pin::new(&mut conn).poll_write(cx, b"ab")
        })
        .await
        .unwrap();
        assert_eq!(n, 2);

        let mut expected = tcp_request(&key, &dest);
        expected.extend_from_slice(b"ab");
        assert_eq!(conn.get_ref().wire, expected);
    }

    #[tokio::test]
    async fn test_shutdown_after_pending_write_sends_request_only() {
        let dest = Socksaddr::ipv4([10, 0, 0, 3], 25);
        let key = key("pw");
        let mut conn = ClientConn::new(StallsOnce::default(), key, dest.clone());

        poll_fn(|cx| {
            assert!(Pin::new(&mut conn).poll_write(cx, b"HELO").is_pending());
            Poll::Ready(())
        })
        .await;
        conn.shutdown().await.unwrap();
        assert_eq!(conn.get_ref().wire, tcp_request(&key, &dest));
    }

    #[tokio::test]
    async fn test_first_write_carries_request() {
        let (a, b) = duplex(4096);
        let dest = Socksaddr::fqdn("example.com", 80);
        let key = key("pw");
        let mut conn = ClientConn::new(a, key, dest.clone());
        assert_eq!(conn.front_headroom(), request_len(&dest));

        conn.write_all(b"first").await.unwrap();
        assert!(conn.is_header_sent());
        assert_eq!(conn.front_headroom(), 0);
        conn.write_all(b" second").await.unwrap();
        conn.shutdown().await.unwrap();
        drop(conn);

        let mut expected = Vec::new();
        client_handshake(&mut expected, &key, &dest, b"first").await.unwrap();
        expected.extend_from_slice(b" second");
        assert_eq!(drain(b).await, expected);
    }

    #[tokio::test]
    async fn test_large_first_write_sends_header_alone() {
        let (a, b) = duplex(1 << 20);
        let dest = Socksaddr::ipv4([10, 1, 2, 3], 8443);
        let key = key("pw");
        let payload = vec![0x5a; 100_000];
        let mut conn = ClientConn::new(a, key, dest.clone());
        conn.write_all(&payload).await.unwrap();
        drop(conn);

        let wire = drain(b).await;
        let header_len = request_len(&dest);
        assert_eq!(wire.len(), header_len + payload.len());
        assert_eq!(&wire[..56], key.as_bytes());
        assert_eq!(&wire[header_len..], &payload[..]);
    }

    #[tokio::test]
    async fn test_flush_sends_bare_request() {
        let (a, b) = duplex(4096);
        let dest = Socksaddr::ipv4([127, 0, 0, 1], 22);
        let key = key("pw");
        let mut conn = ClientConn::new(a, key, dest.clone());
        conn.flush().await.unwrap();
        assert!(conn.is_header_sent());
        drop(conn);

        let mut expected = Vec::new();
        client_handshake(&mut expected, &key, &dest, &[]).await.unwrap();
        assert_eq!(drain(b).await, expected);
    }

    #[tokio::test]
    async fn test_write_buffer_frames_in_place() {
        let (a, b) = duplex(4096);
        let dest = Socksaddr::ipv4([192, 168, 0, 1], 80);
        let key = key("pw");
        let pool = BufferPool::new();
        let mut conn = ClientConn::new(a, key, dest.clone());

        let caps = conn.capabilities();
        assert!(caps.buffer_write);
        assert_eq!(caps.front_headroom, request_len(&dest));

        let mut first = pool.allocate(8, caps.front_headroom, 0);
        first.write(b"abc").unwrap();
        conn.write_buffer(first).await.unwrap();
        let mut second = pool.allocate(8, 0, 0);
        second.write(b"def").unwrap();
        conn.write_buffer(second).await.unwrap();
        drop(conn);
        assert_eq!(pool.stats().leased, 0);

        let mut expected = Vec::new();
        client_handshake(&mut expected, &key, &dest, b"abc").await.unwrap();
        expected.extend_from_slice(b"def");
        assert_eq!(drain(b).await, expected);
    }

    #[tokio::test]
    async fn test_write_buffer_without_headroom() {
        let (a, b) = duplex(4096);
        let dest = Socksaddr::ipv4([192, 168, 0, 1], 80);
        let key = key("pw");
        let mut conn = ClientConn::new(a, key, dest.clone());
        conn.write_buffer(Buffer::from_slice(b"abc")).await.unwrap();
        drop(conn);

        let mut expected = Vec::new();
        client_handshake(&mut expected, &key, &dest, b"abc").await.unwrap();
        assert_eq!(drain(b).await, expected);
    }

    #[tokio::test]
    async fn test_copy_buffered_through_client_conn() {
        let (a, b) = duplex(1 << 16);
        let dest = Socksaddr::fqdn("upstream.test", 9000);
        let key = key("pw");
        let mut conn = ClientConn::new(a, key, dest.clone());
        let mut source: &[u8] = b"relayed through pooled buffers";
        let copied = copy_buffered(&mut source, &mut conn, 8).await.unwrap();
        assert_eq!(copied, 30);
        drop(conn);

        let wire = drain(b).await;
        let header_len = request_len(&dest);
        assert_eq!(&wire[header_len..], b"relayed through pooled buffers");
    }

    #[tokio::test]
    async fn test_packet_conn_read_from_write_to() {
        let (a, mut b) = duplex(4096);
        let dest = Socksaddr::ipv4([1, 0, 0, 1], 53);
        let mut conn = ClientPacketConn::new(a, key("pw"));
        assert_eq!(conn.front_headroom(), MAX_PACKET_REQUEST_LEN);
        conn.write_to(b"one", &dest).await.unwrap();
        assert_eq!(conn.front_headroom(), MAX_CHUNK_HEADER_LEN);
        conn.write_to(b"two", &dest).await.unwrap();

        // server side: request, then two chunks
        let mut request = vec![0u8; request_len(&dest)];
        b.read_exact(&mut request).await.unwrap();
        assert_eq!(request[58], Command::Udp as u8);
        for expected in [&b"one"[..], b"two"] {
            let mut buffer = Buffer::new(16);
            let addr = protocol::read_packet(&mut b, &mut buffer).await.unwrap();
            assert_eq!(addr, dest);
            assert_eq!(buffer.bytes(), expected);
        }

        protocol::write_packet(&mut b, Buffer::from_slice(b"answer"), &dest)
            .await
            .unwrap();
        let mut buf = [0u8; 32];
        let (n, from) = conn.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(from, dest);
    }

    #[tokio::test]
    async fn test_split_writer_still_sends_request() {
        let (a, mut b) = duplex(4096);
        let dest = Socksaddr::ipv4([9, 9, 9, 9], 53);
        let conn: Box<dyn PacketConn> = Box::new(ClientPacketConn::new(a, key("pw")));
        let (_reader, mut writer) = conn.split();
        writer
            .write_packet(Buffer::from_slice(b"q1"), &dest)
            .await
            .unwrap();
        writer
            .write_packet(Buffer::from_slice(b"q2"), &dest)
            .await
            .unwrap();

        let mut request = vec![0u8; request_len(&dest)];
        b.read_exact(&mut request).await.unwrap();
        for expected in [&b"q1"[..], b"q2"] {
            let mut buffer = Buffer::new(16);
            protocol::read_packet(&mut b, &mut buffer).await.unwrap();
            assert_eq!(buffer.bytes(), expected);
        }
    }
}
