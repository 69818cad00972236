use crate::message::{Edge, MessageBlock, Node, Origin, Side, State, HEADER_SIZE};
use sgsh::logging::{self, debug, error, trace, Logger};
use sgsh::shared::{ErrorKind, SgshError, SgshResult};
use sgsh::Pid;
use std::io::{self, Read, Write};

/// Consecutive quiet round trips observed by the initiator before the
/// negotiation phase is declared over. A round is quiet when the block
/// comes back carrying no serial bump.
const STABLE_ROUNDS: u32 = 3;

/// Upper bound on an incoming flat block; anything larger is garbage.
const MAX_BLOCK_SIZE: usize = 1 << 20;

/// Which of the tool's two stream sides take part in the sgsh graph,
/// as communicated by the host shell.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Participation {
    pub input: bool,
    pub output: bool,
}

/// Terminal result of a negotiation: the converged block plus the data
/// channels incident on this tool, from which the host wires up the
/// actual descriptors.
#[derive(Debug)]
pub struct Outcome {
    pub state: State,
    pub block: MessageBlock,
    pub inbound: Vec<Edge>,
    pub outbound: Vec<Edge>,
}

/// Where the next transmission goes: this tool's index in the block's
/// node array and the stream side to write to.
#[derive(Debug)]
struct Dispatcher {
    index: Option<usize>,
    side: Side,
}

/// Result of competing an incoming block against the chosen one.
#[derive(Debug)]
struct Round {
    transmit: bool,
    updated: bool,
    returned: bool,
}

/// Negotiate the graph topology over an arbitrary pair of duplex byte
/// channels. Production code passes the two standard streams; tests
/// pass in-memory channels.
pub fn negotiate<'a, I, O, L>(
    tool_name: &str,
    channels_required: u32,
    channels_provided: u32,
    participation: Participation,
    input: I,
    output: O,
    log: L,
) -> SgshResult<Outcome>
where
    I: Read + Write,
    O: Read + Write,
    L: Into<Option<&'a Logger>>,
{
    negotiate_as(
        tool_name,
        std::process::id(),
        channels_required,
        channels_provided,
        participation,
        input,
        output,
        log,
    )
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn negotiate_as<'a, I, O, L>(
    tool_name: &str,
    pid: Pid,
    channels_required: u32,
    channels_provided: u32,
    participation: Participation,
    mut input: I,
    mut output: O,
    log: L,
) -> SgshResult<Outcome>
where
    I: Read + Write,
    O: Read + Write,
    L: Into<Option<&'a Logger>>,
{
    let log = logging::child(log);

    if !participation.input && !participation.output {
        error!(log, "tool takes part in no stream side"; "tool" => tool_name);
        return Err(SgshError::Fatal(ErrorKind::Environment));
    }

    let self_node = Node {
        pid,
        name: tool_name.to_owned(),
        requires_channels: channels_required,
        provides_channels: channels_provided,
        sgsh_in: participation.input,
        sgsh_out: participation.output,
    };

    debug!(log, "entering negotiation";
           "tool" => tool_name,
           "pid" => pid,
           "requires" => channels_required,
           "provides" => channels_provided);

    // A tool whose output side alone takes part creates the block;
    // everyone else waits for one to arrive on either side.
    let (chosen, side) = if participation.output && !participation.input {
        debug!(log, "initiating with a fresh message block"; "pid" => pid);
        (MessageBlock::new(pid), Side::Output)
    } else {
        let (block, arrival) = read_block(&mut input, &mut output, participation)?;
        (block, dispatch_side(participation, arrival))
    };

    let origin = chosen.origin;
    let mut ctx = Context {
        pid,
        self_node,
        participation,
        dispatcher: Dispatcher { index: None, side },
        chosen,
        input,
        output,
        log,
    };

    ctx.add_self_node();
    ctx.add_incident_edge(origin)?;
    ctx.run()
}

struct Context<I, O> {
    pid: Pid,
    self_node: Node,
    participation: Participation,
    dispatcher: Dispatcher,
    chosen: MessageBlock,
    input: I,
    output: O,
    log: Logger,
}

impl<I: Read + Write, O: Read + Write> Context<I, O> {
    fn run(&mut self) -> SgshResult<Outcome> {
        let mut should_transmit = true;
        let mut quiet_rounds = 0u32;

        loop {
            if self.chosen.state == State::Error {
                error!(self.log, "received a block marking a failed negotiation");
                return Err(SgshError::Fatal(ErrorKind::Protocol));
            }

            if self.chosen.state == State::Negotiation
                && self.chosen.initiator_pid == self.pid
                && quiet_rounds >= STABLE_ROUNDS
            {
                debug!(self.log, "negotiation stable, announcing end"; "pid" => self.pid);
                self.chosen.state = State::NegotiationEnd;
                self.chosen.bump_serial();
            }

            if should_transmit {
                self.transmit()?;
            }

            if self.chosen.state == State::NegotiationEnd {
                // The end announcement has been passed on; leave the loop.
                break;
            }

            let (fresh, arrival) =
                read_block(&mut self.input, &mut self.output, self.participation)?;
            self.dispatcher.side = dispatch_side(self.participation, arrival);

            let round = self.compete(fresh)?;
            should_transmit = round.transmit;

            if self.chosen.initiator_pid == self.pid {
                if round.updated {
                    quiet_rounds = 0;
                } else if round.returned {
                    quiet_rounds += 1;
                    trace!(self.log, "quiet round"; "count" => quiet_rounds);
                }
            }
        }

        self.conclude()
    }

    /// Decide between the block just read and the chosen one. The
    /// initiator pid is a total order over blocks, so every connected
    /// component converges on the block of its smallest initiator.
    fn compete(&mut self, fresh: MessageBlock) -> SgshResult<Round> {
        let returned = fresh.initiator_pid == self.pid;
        let origin = fresh.origin;

        if fresh.initiator_pid < self.chosen.initiator_pid {
            debug!(self.log, "adopting block of earlier initiator";
                   "fresh_initiator" => fresh.initiator_pid,
                   "chosen_initiator" => self.chosen.initiator_pid);
            self.chosen = fresh;
            self.add_self_node();
            self.add_incident_edge(origin)?;
            Ok(Round {
                transmit: true,
                updated: true,
                returned,
            })
        } else if fresh.initiator_pid > self.chosen.initiator_pid {
            debug!(self.log, "discarding block of later initiator";
                   "fresh_initiator" => fresh.initiator_pid,
                   "chosen_initiator" => self.chosen.initiator_pid);
            Ok(Round {
                transmit: false,
                updated: false,
                returned,
            })
        } else {
            let mut updated = false;
            if fresh.serial_no > self.chosen.serial_no {
                self.chosen = fresh;
                self.add_self_node();
                updated = true;
            }
            let added = self.add_incident_edge(origin)?;
            Ok(Round {
                transmit: true,
                updated: updated || added,
                returned,
            })
        }
    }

    /// Ensure this tool's node is in the block and remember its index.
    fn add_self_node(&mut self) {
        let index = match self.chosen.find_node(self.self_node.pid) {
            Some(index) => index,
            None => {
                let index = self.chosen.add_node(self.self_node.clone());
                debug!(self.log, "added own node to graph"; "index" => index);
                index
            }
        };
        self.dispatcher.index = Some(index);
    }

    /// Record the data channel implied by the origin of the block just
    /// received. A block transmitted through the origin's input side
    /// travels over a pipe that carries data from this tool to the
    /// origin, and vice versa.
    fn add_incident_edge(&mut self, origin: Option<Origin>) -> SgshResult<bool> {
        let origin = match origin {
            Some(origin) => origin,
            None => return Ok(false),
        };

        if origin.index >= self.chosen.nodes.len() {
            error!(self.log, "origin node missing from graph"; "index" => origin.index);
            return Err(SgshError::Fatal(ErrorKind::Protocol));
        }
        let self_index = self
            .dispatcher
            .index
            .expect("Own node must be present in the graph") as u32;

        let edge = match origin.side {
            Side::Input => {
                if !self.self_node.sgsh_out {
                    return Err(SgshError::Fatal(ErrorKind::Protocol));
                }
                Edge {
                    from: self_index,
                    to: origin.index as u32,
                }
            }
            Side::Output => {
                if !self.self_node.sgsh_in {
                    return Err(SgshError::Fatal(ErrorKind::Protocol));
                }
                Edge {
                    from: origin.index as u32,
                    to: self_index,
                }
            }
        };

        let added = self.chosen.add_edge(edge);
        if added {
            debug!(self.log, "added edge to graph";
                   "from" => edge.from,
                   "to" => edge.to,
                   "edges" => self.chosen.edges.len());
        }
        Ok(added)
    }

    /// Stamp the origin and ship the flat block on the dispatch side.
    fn transmit(&mut self) -> SgshResult<()> {
        let index = self
            .dispatcher
            .index
            .expect("Own node must be present in the graph");
        self.chosen.origin = Some(Origin {
            index,
            side: self.dispatcher.side,
        });

        let flat = self.chosen.encode();
        trace!(self.log, "transmitting message block";
               "side" => ?self.dispatcher.side,
               "serial" => self.chosen.serial_no,
               "size" => flat.len());

        match self.dispatcher.side {
            Side::Input => write_all_retry(&mut self.input, &flat),
            Side::Output => write_all_retry(&mut self.output, &flat),
        }
    }

    /// Validate the converged topology against this tool's channel
    /// requirements and hand the incident edges to the caller.
    fn conclude(&self) -> SgshResult<Outcome> {
        let index = self
            .dispatcher
            .index
            .expect("Own node must be present in the graph");
        let (inbound, outbound) = self.chosen.edges_incident(index);

        if inbound.len() != self.self_node.requires_channels as usize
            || outbound.len() != self.self_node.provides_channels as usize
        {
            error!(self.log, "failed to satisfy channel requirements";
                   "tool" => %self.self_node.name,
                   "pid" => self.pid,
                   "requires" => self.self_node.requires_channels,
                   "gets" => inbound.len(),
                   "provides" => self.self_node.provides_channels,
                   "offered" => outbound.len());
            return Err(SgshError::Fatal(ErrorKind::Topology));
        }

        debug!(self.log, "negotiation complete";
               "pid" => self.pid,
               "nodes" => self.chosen.nodes.len(),
               "edges" => self.chosen.edges.len());

        Ok(Outcome {
            state: self.chosen.state,
            block: self.chosen.clone(),
            inbound,
            outbound,
        })
    }
}

/// After a block arrives on one side, the next transmission alternates
/// to the other side when that side takes part in the graph.
fn dispatch_side(participation: Participation, arrival: Side) -> Side {
    match arrival {
        Side::Input if participation.output => Side::Output,
        Side::Output if participation.input => Side::Input,
        side => side,
    }
}

/// Read one complete block from whichever participating side yields
/// bytes first, alternating non-blocking attempts between the two.
fn read_block<I: Read, O: Read>(
    input: &mut I,
    output: &mut O,
    participation: Participation,
) -> SgshResult<(MessageBlock, Side)> {
    loop {
        if participation.input {
            if let Some(block) = try_read_side(input)? {
                return Ok((block, Side::Input));
            }
        }
        if participation.output {
            if let Some(block) = try_read_side(output)? {
                return Ok((block, Side::Output));
            }
        }
    }
}

/// One non-blocking probe of a side. Returns `None` if the side has no
/// data yet; once the first bytes arrive the remainder of the block is
/// read out, retrying until the advertised length is in.
fn try_read_side<R: Read>(side: &mut R) -> SgshResult<Option<MessageBlock>> {
    let mut header = [0u8; HEADER_SIZE];
    let mut have = 0;

    while have < HEADER_SIZE {
        match side.read(&mut header[have..]) {
            Ok(0) => return Err(SgshError::Fatal(ErrorKind::Io(io::ErrorKind::UnexpectedEof))),
            Ok(n) => have += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if have == 0 {
                    return Ok(None);
                }
                // A block is in flight on this side; wait for the rest.
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let total = MessageBlock::peek_total_size(&header)?;
    if total < HEADER_SIZE || total > MAX_BLOCK_SIZE {
        return Err(SgshError::Fatal(ErrorKind::Protocol));
    }

    let mut flat = vec![0u8; total];
    flat[..HEADER_SIZE].copy_from_slice(&header);
    let mut have = HEADER_SIZE;
    while have < total {
        match side.read(&mut flat[have..]) {
            Ok(0) => return Err(SgshError::Fatal(ErrorKind::Io(io::ErrorKind::UnexpectedEof))),
            Ok(n) => have += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    MessageBlock::decode(&flat).map(Some)
}

/// Write the whole block, retrying over transient conditions.
fn write_all_retry<W: Write>(side: &mut W, mut flat: &[u8]) -> SgshResult<()> {
    while !flat.is_empty() {
        match side.write(flat) {
            Ok(0) => return Err(SgshError::Fatal(ErrorKind::Io(io::ErrorKind::WriteZero))),
            Ok(n) => flat = &flat[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    side.flush().map_err(SgshError::from)
}
