//! Trojan protocol
//!
//! - `protocol`: key derivation, request and relay chunk framing
//! - `client`: stream and packet connections that send the request lazily
//! - `service`: user registry and server-side request dispatch

mod client;
pub mod protocol;
mod service;

pub use client::{ClientConn, ClientPacketConn};
pub use protocol::{
    client_handshake, client_handshake_buffer, client_handshake_packet, client_handshake_raw,
    key, read_packet, write_packet, Command, Key, CRLF, KEY_LENGTH,
};
pub use service::{
    AcceptError, HandshakeError, RelayConn, RelayReader, RelayWriter, Service, PROTOCOL_NAME,
};
