//! Peer-to-peer negotiation of an sgsh graph topology.
//!
//! Every tool in the graph calls the negotiation entry point once at
//! startup. A message block circulates among the tools over the stream
//! descriptors that will later carry data, accumulating the node and
//! edge sets until the topology stabilizes and the initiator announces
//! the end of the negotiation phase.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

use sgsh::fd::Fd;
use sgsh::logging;
use sgsh::shared::{env_flag, SgshError, SgshResult};

pub mod message;
pub mod protocol;

pub use crate::message::{Edge, MessageBlock, Node, Origin, Side, State};
pub use crate::protocol::{negotiate, Outcome, Participation};

/// Negotiate over the process' own standard streams.
///
/// Participation of the two sides is taken from the `SGSH_IN` and
/// `SGSH_OUT` environment variables set up by the host shell; both
/// descriptors are switched to non-blocking mode for the duration of
/// the exchange.
pub fn negotiate_stdio<'a, L: Into<Option<&'a logging::Logger>>>(
    tool_name: &str,
    channels_required: u32,
    channels_provided: u32,
    log: L,
) -> SgshResult<Outcome> {
    let participation = Participation {
        input: env_flag("SGSH_IN")?,
        output: env_flag("SGSH_OUT")?,
    };

    let input = Fd::stdin();
    let output = Fd::stdout();
    input.set_nonblocking().map_err(SgshError::from)?;
    output.set_nonblocking().map_err(SgshError::from)?;

    negotiate(
        tool_name,
        channels_required,
        channels_provided,
        participation,
        input,
        output,
        log,
    )
}
