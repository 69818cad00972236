//! A data store over a live byte stream.
//!
//! The process reads a record-structured stream on its standard input
//! and keeps a sliding window of recent data in a chain of buffers. At
//! any moment the most recent complete record (or a configured range of
//! records counted from the end) is served to clients connecting over a
//! Unix domain socket.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod chain;
pub mod client;
pub mod server;
pub mod sock;

pub use crate::chain::{Chain, Cursor, Mode};
pub use crate::server::{Range, Store, StoreError};
