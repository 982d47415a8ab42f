//! Building blocks for Trojan proxies
//!
//! - `buf`: pooled buffers with headroom for in-place framing
//! - `address`: SOCKS-style address values and configurable codecs
//! - `trojan`: the Trojan protocol, client and server side
//! - `task`: run groups of tasks, wait for all or race them
//! - `network`: handler, packet channel and writer traits shared by the above

pub mod address;
pub mod buf;
pub mod error;
pub mod logger;
pub mod network;
pub mod task;
pub mod trojan;

pub use error::{Error, Result};
