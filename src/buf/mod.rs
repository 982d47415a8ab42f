//! Pooled byte buffers with reserved head and tail room
//!
//! Layout of a [`Buffer`]:
//!
//! ```text
//! 0          start            end               capacity
//! | headroom | payload         | free tail        |
//! ```
//!
//! Protocol layers write a payload, then claim headroom with
//! [`Buffer::extend_header`] to frame it in place. Writers that take a
//! `Buffer` by value own it from then on; pooled storage is returned when the
//! buffer is released or dropped.

mod buffer;
mod pool;

pub use buffer::Buffer;
pub use pool::{BufferPool, PoolStats};
