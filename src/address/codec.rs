use bytes::BufMut;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Family, Host, Socksaddr};
use crate::error::{Error, Result, ResultExt};

/// SOCKS5 tags, address before port. Used by Trojan.
pub static SOCKS_SERIALIZER: Lazy<Serializer> = Lazy::new(|| {
    Serializer::builder()
        .family_byte(0x01, Family::IPv4)
        .family_byte(0x04, Family::IPv6)
        .family_byte(0x03, Family::Fqdn)
        .build()
});

/// Tags used when tunnelling UDP over a stream.
pub static UOT_SERIALIZER: Lazy<Serializer> = Lazy::new(|| {
    Serializer::builder()
        .family_byte(0x00, Family::IPv4)
        .family_byte(0x01, Family::IPv6)
        .family_byte(0x02, Family::Fqdn)
        .build()
});

/// Destination that asks a server to switch the stream to UDP-over-TCP.
pub const UOT_MAGIC_ADDRESS: &str = "sp.udp-over-tcp.arpa";

const MAX_FQDN_LEN: usize = u8::MAX as usize;

/// Immutable address codec. Build once with [`Serializer::builder`], then share freely.
#[derive(Debug, Clone)]
pub struct Serializer {
    family_map: HashMap<u8, Family>,
    family_byte_map: HashMap<Family, u8>,
    port_first: bool,
}

/// Builder for [`Serializer`].
#[derive(Debug, Default)]
pub struct SerializerBuilder {
    family_map: HashMap<u8, Family>,
    family_byte_map: HashMap<Family, u8>,
    port_first: bool,
}

impl SerializerBuilder {
    /// Bind wire tag `byte` to `family`. A later binding for the same byte or the
    /// same family replaces the earlier one, so the table stays one-to-one.
    pub fn family_byte(mut self, byte: u8, family: Family) -> Self {
        if let Some(old_family) = self.family_map.insert(byte, family) {
            self.family_byte_map.remove(&old_family);
        }
        if let Some(old_byte) = self.family_byte_map.insert(family, byte) {
            if old_byte != byte {
                self.family_map.remove(&old_byte);
            }
        }
        self
    }

    /// Send the port before the address.
    pub fn port_then_address(mut self) -> Self {
        self.port_first = true;
        self
    }

    pub fn build(self) -> Serializer {
        Serializer {
            family_map: self.family_map,
            family_byte_map: self.family_byte_map,
            port_first: self.port_first,
        }
    }
}

fn ensure_room<B: BufMut + ?Sized>(sink: &B, needed: usize) -> Result<()> {
    let available = sink.remaining_mut();
    if available < needed {
        return Err(Error::ShortBuffer { needed, available });
    }
    Ok(())
}

impl Serializer {
    pub fn builder() -> SerializerBuilder {
        SerializerBuilder::default()
    }

    pub fn port_first(&self) -> bool {
        self.port_first
    }

    pub fn family_of(&self, byte: u8) -> Option<Family> {
        self.family_map.get(&byte).copied()
    }

    pub fn byte_of(&self, family: Family) -> Option<u8> {
        self.family_byte_map.get(&family).copied()
    }

    /// Encoded size of the tag and host.
    pub fn address_len(&self, addr: &Socksaddr) -> usize {
        match &addr.host {
            Host::Fqdn(name) => 2 + name.len(),
            host => match host.family() {
                Family::IPv4 => 5,
                _ => 17,
            },
        }
    }

    /// Encoded size of the host and port together.
    pub fn addr_port_len(&self, addr: &Socksaddr) -> usize {
        self.address_len(addr) + 2
    }

    /// Write the family tag and the host.
    ///
    /// Validation happens before any byte is written: an unmapped family, a name
    /// over 255 bytes or a sink without room leaves the sink untouched.
    pub fn write_address<B: BufMut + ?Sized>(&self, sink: &mut B, addr: &Socksaddr) -> Result<()> {
        let family = addr.family();
        let tag = self.byte_of(family).ok_or_else(|| {
            Error::MalformedHeader(format!("no wire tag for {:?}", family))
        })?;
        if let Host::Fqdn(name) = &addr.host {
            if name.len() > MAX_FQDN_LEN {
                return Err(Error::FqdnTooLong(name.len()));
            }
        }
        ensure_room(sink, self.address_len(addr))?;

        sink.put_u8(tag);
        match addr.host.clone().canonical() {
            Host::Ipv4(ip) => sink.put_slice(&ip.octets()),
            Host::Ipv6(ip) => sink.put_slice(&ip.octets()),
            Host::Fqdn(name) => {
                sink.put_u8(name.len() as u8);
                sink.put_slice(name.as_bytes());
            }
        }
        Ok(())
    }

    /// Big-endian port.
    pub fn write_port<B: BufMut + ?Sized>(&self, sink: &mut B, port: u16) -> Result<()> {
        ensure_room(sink, 2)?;
        sink.put_u16(port);
        Ok(())
    }

    /// Write host and port in the configured order.
    ///
    /// If the second field fails, the first one stays written.
    pub fn write_addr_port<B: BufMut + ?Sized>(&self, sink: &mut B, addr: &Socksaddr) -> Result<()> {
        if self.port_first {
            self.write_port(sink, addr.port)?;
            self.write_address(sink, addr)
        } else {
            self.write_address(sink, addr)?;
            self.write_port(sink, addr.port)
        }
    }

    /// Read a family tag and host.
    pub async fn read_address<R>(&self, reader: &mut R) -> Result<Host>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let tag = reader.read_u8().await.map_err(Error::from_read)?;
        match self.family_of(tag) {
            Some(Family::IPv4) => {
                let mut octets = [0u8; 4];
                reader
                    .read_exact(&mut octets)
                    .await
                    .map_err(Error::from_read)
                    .context("read ipv4 address")?;
                Ok(Host::Ipv4(Ipv4Addr::from(octets)))
            }
            Some(Family::IPv6) => {
                let mut octets = [0u8; 16];
                reader
                    .read_exact(&mut octets)
                    .await
                    .map_err(Error::from_read)
                    .context("read ipv6 address")?;
                Ok(Host::Ipv6(Ipv6Addr::from(octets)).canonical())
            }
            Some(Family::Fqdn) => {
                let name = read_socks_string(reader).await.context("read fqdn")?;
                Ok(Host::Fqdn(name))
            }
            None => Err(Error::UnknownAddressFamily(tag)),
        }
    }

    pub async fn read_port<R>(&self, reader: &mut R) -> Result<u16>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        reader
            .read_u16()
            .await
            .map_err(Error::from_read)
            .context("read port")
    }

    /// Read host and port in the configured order.
    pub async fn read_addr_port<R>(&self, reader: &mut R) -> Result<Socksaddr>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (host, port) = if self.port_first {
            let port = self.read_port(reader).await?;
            (self.read_address(reader).await?, port)
        } else {
            let host = self.read_address(reader).await?;
            (host, self.read_port(reader).await?)
        };
        Ok(Socksaddr::new(host, port))
    }
}

/// One length byte followed by that many UTF-8 bytes.
async fn read_socks_string<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u8().await.map_err(Error::from_read)? as usize;
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw).await.map_err(Error::from_read)?;
    String::from_utf8(raw).map_err(|_| Error::MalformedHeader("invalid fqdn encoding".into()))
}
