#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Version tag carried in every negotiation message block.
pub const PROTOCOL_VERSION: u16 = 1;

/// Process identifier as carried on the wire.
pub type Pid = u32;

pub mod fd;
pub mod logging;
pub mod shared;
pub mod time;
