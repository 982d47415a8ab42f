//! Trojan wire format
//!
//! Request, sent once by the client right after connecting:
//! ```text
//! +-----------------------+---------+----------------+---------+----------+
//! | hex(SHA224(password)) |  CRLF   | Command | Addr |  CRLF   | Payload  |
//! +-----------------------+---------+----------------+---------+----------+
//! |          56           | X'0D0A' |   1     | Var  | X'0D0A' | Variable |
//! +-----------------------+---------+----------------+---------+----------+
//! ```
//!
//! UDP relay chunk, used in both directions once a UDP request is accepted:
//! ```text
//! +------+--------+---------+----------+
//! | Addr | Length |  CRLF   | Payload  |
//! +------+--------+---------+----------+
//! | Var  |   2    | X'0D0A' | Variable |
//! +------+--------+---------+----------+
//! ```
//!
//! `Addr` is a SOCKS5 address followed by a big-endian port.

use bytes::BufMut;
use sha2::{Digest, Sha224};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::{Socksaddr, SOCKS_SERIALIZER};
use crate::buf::Buffer;
use crate::error::{Error, Result, ResultExt};
use crate::logger::log;

pub const KEY_LENGTH: usize = 56;
pub const CRLF: [u8; 2] = *b"\r\n";

/// Longest SOCKS address plus port: tag, length prefix, 255-byte name, port.
pub const MAX_ADDR_PORT_LEN: usize = 1 + 1 + 255 + 2;
/// Headroom that fits the chunk header for any destination.
pub const MAX_CHUNK_HEADER_LEN: usize = MAX_ADDR_PORT_LEN + 4;
/// Headroom that fits the request plus first chunk header for any destination.
pub const MAX_PACKET_REQUEST_LEN: usize = KEY_LENGTH + 2 * MAX_ADDR_PORT_LEN + 9;

/// Header and payload are sent in one write below this size.
pub(super) const MAX_COALESCED_WRITE: usize = 65535;

/// Trojan command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// TCP connect
    Tcp = 1,
    /// UDP associate
    Udp = 3,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Command::Tcp),
            3 => Ok(Command::Udp),
            other => Err(Error::MalformedHeader(format!("unknown command: {other}"))),
        }
    }
}

/// Hex-encoded SHA-224 of a password, exactly as it appears on the wire.
///
/// The derivation is unsalted and must stay that way for compatibility with
/// other Trojan implementations.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; KEY_LENGTH]);

impl Key {
    pub fn from_password(password: &str) -> Self {
        let digest = Sha224::digest(password.as_bytes());
        let mut key = [0u8; KEY_LENGTH];
        // 28 digest bytes always encode to 56 hex bytes
        key.copy_from_slice(hex::encode(digest).as_bytes());
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Enough to tell keys apart in logs
        let prefix = String::from_utf8_lossy(&self.0[..8]);
        write!(f, "Key({prefix}..)")
    }
}

/// Derive the wire key for `password`.
pub fn key(password: &str) -> Key {
    Key::from_password(password)
}

/// Length of `key CRLF command addr CRLF`.
pub fn request_len(destination: &Socksaddr) -> usize {
    KEY_LENGTH + SOCKS_SERIALIZER.addr_port_len(destination) + 5
}

/// Length of `addr length CRLF` in front of a relay chunk.
pub fn chunk_header_len(destination: &Socksaddr) -> usize {
    SOCKS_SERIALIZER.addr_port_len(destination) + 4
}

/// Length of the request plus the first chunk header, sent before the first datagram.
pub fn packet_request_len(destination: &Socksaddr) -> usize {
    request_len(destination) + chunk_header_len(destination)
}

fn ensure_room<B: BufMut + ?Sized>(sink: &B, needed: usize) -> Result<()> {
    let available = sink.remaining_mut();
    if available < needed {
        return Err(Error::ShortBuffer { needed, available });
    }
    Ok(())
}

pub(super) fn put_request<B: BufMut + ?Sized>(
    sink: &mut B,
    key: &Key,
    command: Command,
    destination: &Socksaddr,
) -> Result<()> {
    ensure_room(sink, request_len(destination))?;
    sink.put_slice(key.as_bytes());
    sink.put_slice(&CRLF);
    sink.put_u8(command as u8);
    SOCKS_SERIALIZER.write_addr_port(sink, destination)?;
    sink.put_slice(&CRLF);
    Ok(())
}

pub(super) fn put_chunk_header<B: BufMut + ?Sized>(
    sink: &mut B,
    destination: &Socksaddr,
    payload_len: usize,
) -> Result<()> {
    let length = u16::try_from(payload_len).map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet of {payload_len} bytes does not fit a relay chunk"),
        ))
    })?;
    ensure_room(sink, chunk_header_len(destination))?;
    SOCKS_SERIALIZER.write_addr_port(sink, destination)?;
    sink.put_u16(length);
    sink.put_slice(&CRLF);
    Ok(())
}

/// Write the request field by field with an explicit command, then `payload` if any.
pub async fn client_handshake_raw<W>(
    conn: &mut W,
    key: &Key,
    command: Command,
    destination: &Socksaddr,
    payload: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    conn.write_all(key.as_bytes()).await?;
    conn.write_all(&CRLF).await?;
    conn.write_u8(command as u8).await?;
    let mut addr = Vec::with_capacity(SOCKS_SERIALIZER.addr_port_len(destination));
    SOCKS_SERIALIZER.write_addr_port(&mut addr, destination)?;
    conn.write_all(&addr).await?;
    conn.write_all(&CRLF).await?;
    if !payload.is_empty() {
        conn.write_all(payload).await?;
    }
    Ok(())
}

/// Send a TCP request followed by `payload`.
///
/// Small payloads go out in the same write as the header. Large or empty ones
/// are written after the header so no oversized temporary is allocated.
pub async fn client_handshake<W>(
    conn: &mut W,
    key: &Key,
    destination: &Socksaddr,
    payload: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header_len = request_len(destination);
    let coalesce = !payload.is_empty() && header_len + payload.len() < MAX_COALESCED_WRITE;

    let mut header = if coalesce {
        Buffer::new(header_len + payload.len())
    } else {
        Buffer::new(header_len)
    };
    put_request(&mut header.extend(header_len)?, key, Command::Tcp, destination)?;
    if coalesce {
        header.write(payload)?;
    }
    header.write_to(conn).await.context("write request")?;

    if !coalesce && !payload.is_empty() {
        conn.write_all(payload).await.context("write payload")?;
    }
    Ok(())
}

/// Send a TCP request with the header framed in front of `payload`.
///
/// Uses the buffer's headroom when it has enough, so header and payload leave
/// in one write without copying; otherwise the header is written first.
pub async fn client_handshake_buffer<W>(
    conn: &mut W,
    key: &Key,
    destination: &Socksaddr,
    mut payload: Buffer<'_>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header_len = request_len(destination);
    if payload.start() >= header_len {
        let mut header = payload.extend_header(header_len)?;
        put_request(&mut header, key, Command::Tcp, destination)?;
    } else {
        let mut header = Buffer::new(header_len);
        put_request(&mut header.extend(header_len)?, key, Command::Tcp, destination)?;
        header.write_to(conn).await.context("write request")?;
    }
    payload.write_to(conn).await.context("write request")
}

/// Send a UDP request combined with the first relay chunk.
pub async fn client_handshake_packet<W>(
    conn: &mut W,
    key: &Key,
    destination: &Socksaddr,
    mut payload: Buffer<'_>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header_len = packet_request_len(destination);
    let payload_len = payload.len();
    if payload.start() >= header_len {
        let mut header = payload.extend_header(header_len)?;
        put_request(&mut header, key, Command::Udp, destination)?;
        put_chunk_header(&mut header, destination, payload_len)?;
    } else {
        let mut header = Buffer::new(header_len);
        let mut sink = header.extend(header_len)?;
        put_request(&mut sink, key, Command::Udp, destination)?;
        put_chunk_header(&mut sink, destination, payload_len)?;
        header.write_to(conn).await.context("write request")?;
    }
    payload.write_to(conn).await.context("write payload")
}

/// Read one relay chunk onto the end of `buffer` and return its address.
///
/// Fails with [`Error::ShortBuffer`] right after the length field if the chunk
/// does not fit; the stream is then positioned before the CRLF and the caller
/// should drop the connection.
pub async fn read_packet<R>(reader: &mut R, buffer: &mut Buffer<'_>) -> Result<Socksaddr>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let destination = SOCKS_SERIALIZER
        .read_addr_port(reader)
        .await
        .context("read destination")?;
    let length = reader
        .read_u16()
        .await
        .map_err(Error::from_read)
        .context("read chunk length")? as usize;

    let available = buffer.free_len();
    if available < length {
        return Err(Error::ShortBuffer {
            needed: length,
            available,
        });
    }

    skip_crlf(reader).await?;
    buffer.read_full_from(reader, length).await?;
    log::trace!(destination = %destination, length, "read relay chunk");
    Ok(destination)
}

/// Frame `buffer` as a relay chunk for `destination` and write it.
pub async fn write_packet<W>(conn: &mut W, mut buffer: Buffer<'_>, destination: &Socksaddr) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header_len = chunk_header_len(destination);
    let payload_len = buffer.len();
    if buffer.start() >= header_len {
        let mut header = buffer.extend_header(header_len)?;
        put_chunk_header(&mut header, destination, payload_len)?;
    } else {
        let mut header = Buffer::new(header_len);
        put_chunk_header(&mut header.extend(header_len)?, destination, payload_len)?;
        header.write_to(conn).await.context("write packet")?;
    }
    log::trace!(destination = %destination, length = payload_len, "write relay chunk");
    buffer.write_to(conn).await.context("write packet")
}

/// Consume the two delimiter bytes. Their value is not checked.
pub(crate) async fn skip_crlf<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut crlf = [0u8; 2];
    reader
        .read_exact(&mut crlf)
        .await
        .map_err(Error::from_read)
        .context("skip crlf")?;
    Ok(())
}
