use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sgsh::shared::{Deserialize, ErrorKind, Serialize, SgshError, SgshResult, SizedRead, SizedWrite};
use sgsh::{Pid, PROTOCOL_VERSION};
use std::io::{Cursor, Read, Write};

/// Fixed width of the node name field in the flat layout.
pub const NAME_SIZE: usize = 64;

/// Flat header: version, state, initiator pid, serial, origin index,
/// origin side, node count, edge count, total size.
pub const HEADER_SIZE: usize = 2 + 1 + 4 + 4 + 4 + 1 + 4 + 4 + 4;
pub const NODE_SIZE: usize = 4 + NAME_SIZE + 4 + 4 + 1 + 1;
pub const EDGE_SIZE: usize = 4 + 4;

/// One of the two stream sides of a tool.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Input = 0,
    Output = 1,
}

impl Side {
    fn from_u8(value: u8) -> SgshResult<Side> {
        match value {
            0 => Ok(Side::Input),
            1 => Ok(Side::Output),
            _ => Err(SgshError::Fatal(ErrorKind::Protocol)),
        }
    }
}

/// Negotiation phase carried in the message block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Negotiation = 0,
    NegotiationEnd = 1,
    Error = 2,
}

impl State {
    fn from_u8(value: u8) -> SgshResult<State> {
        match value {
            0 => Ok(State::Negotiation),
            1 => Ok(State::NegotiationEnd),
            2 => Ok(State::Error),
            _ => Err(SgshError::Fatal(ErrorKind::Protocol)),
        }
    }
}

/// The node and stream side that last transmitted the block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Origin {
    pub index: usize,
    pub side: Side,
}

/// A tool participating in the sgsh graph.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Node {
    pub pid: Pid,
    pub name: String,
    pub requires_channels: u32,
    pub provides_channels: u32,
    pub sgsh_in: bool,
    pub sgsh_out: bool,
}

impl Serialize for Node {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> SgshResult<()> {
        if stream.free_capacity() < NODE_SIZE {
            return Err(SgshError::Wait);
        }
        stream.write_u32::<BigEndian>(self.pid)?;

        let mut name = [0u8; NAME_SIZE];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(NAME_SIZE);
        name[..len].copy_from_slice(&bytes[..len]);
        stream.write_all(&name)?;

        stream.write_u32::<BigEndian>(self.requires_channels)?;
        stream.write_u32::<BigEndian>(self.provides_channels)?;
        stream.write_u8(self.sgsh_in as u8)?;
        stream.write_u8(self.sgsh_out as u8)?;
        Ok(())
    }
}

impl Deserialize for Node {
    fn deserialize<R: SizedRead>(stream: &mut R) -> SgshResult<Node> {
        if stream.remaining_data() < NODE_SIZE {
            return Err(SgshError::Fatal(ErrorKind::Protocol));
        }
        let pid = stream.read_u32::<BigEndian>()?;

        let mut name = [0u8; NAME_SIZE];
        stream.read_exact(&mut name)?;
        let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        let name = String::from_utf8(name[..end].to_vec())
            .map_err(|_| SgshError::Fatal(ErrorKind::Protocol))?;

        Ok(Node {
            pid,
            name,
            requires_channels: stream.read_u32::<BigEndian>()?,
            provides_channels: stream.read_u32::<BigEndian>()?,
            sgsh_in: stream.read_u8()? != 0,
            sgsh_out: stream.read_u8()? != 0,
        })
    }
}

/// A data channel between two nodes, identified by node indices.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Edge {
    pub from: u32,
    pub to: u32,
}

impl Serialize for Edge {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> SgshResult<()> {
        if stream.free_capacity() < EDGE_SIZE {
            return Err(SgshError::Wait);
        }
        stream.write_u32::<BigEndian>(self.from)?;
        stream.write_u32::<BigEndian>(self.to)?;
        Ok(())
    }
}

impl Deserialize for Edge {
    fn deserialize<R: SizedRead>(stream: &mut R) -> SgshResult<Edge> {
        if stream.remaining_data() < EDGE_SIZE {
            return Err(SgshError::Fatal(ErrorKind::Protocol));
        }
        Ok(Edge {
            from: stream.read_u32::<BigEndian>()?,
            to: stream.read_u32::<BigEndian>()?,
        })
    }
}

/// The vehicle of the negotiation phase.
///
/// The block is held as plain node and edge vectors and materialized
/// into a single self-describing byte run on transmit, so copies moved
/// between address spaces never contain process-local references.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageBlock {
    pub version: u16,
    pub state: State,
    pub initiator_pid: Pid,
    pub serial_no: u32,
    pub origin: Option<Origin>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl MessageBlock {
    pub fn new(initiator_pid: Pid) -> MessageBlock {
        MessageBlock {
            version: PROTOCOL_VERSION,
            state: State::Negotiation,
            initiator_pid,
            serial_no: 0,
            origin: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Byte length of the flat form.
    #[inline]
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.nodes.len() * NODE_SIZE + self.edges.len() * EDGE_SIZE
    }

    #[inline]
    pub fn bump_serial(&mut self) {
        self.serial_no += 1;
    }

    #[inline]
    pub fn find_node(&self, pid: Pid) -> Option<usize> {
        self.nodes.iter().position(|node| node.pid == pid)
    }

    /// Append a node and bump the serial. Returns the node's index.
    pub fn add_node(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.bump_serial();
        self.nodes.len() - 1
    }

    #[inline]
    pub fn has_edge(&self, edge: Edge) -> bool {
        self.edges.iter().any(|e| *e == edge)
    }

    /// Append an edge unless it is already present, bumping the serial
    /// on append. Returns true if the edge was added.
    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if self.has_edge(edge) {
            return false;
        }
        self.edges.push(edge);
        self.bump_serial();
        true
    }

    /// The edges ending at and starting from the given node index.
    pub fn edges_incident(&self, index: usize) -> (Vec<Edge>, Vec<Edge>) {
        let index = index as u32;
        let incoming = self.edges.iter().copied().filter(|e| e.to == index).collect();
        let outgoing = self.edges.iter().copied().filter(|e| e.from == index).collect();
        (incoming, outgoing)
    }

    /// Materialize the flat form.
    pub fn encode(&self) -> Vec<u8> {
        let total = self.total_size();
        let mut buf = Vec::with_capacity(total);

        buf.write_u16::<BigEndian>(self.version).expect("Error writing version");
        buf.write_u8(self.state as u8).expect("Error writing state");
        buf.write_u32::<BigEndian>(self.initiator_pid)
            .expect("Error writing initiator pid");
        buf.write_u32::<BigEndian>(self.serial_no).expect("Error writing serial");
        match self.origin {
            Some(origin) => {
                buf.write_i32::<BigEndian>(origin.index as i32)
                    .expect("Error writing origin index");
                buf.write_u8(origin.side as u8).expect("Error writing origin side");
            }
            None => {
                buf.write_i32::<BigEndian>(-1).expect("Error writing origin index");
                buf.write_u8(0).expect("Error writing origin side");
            }
        }
        buf.write_u32::<BigEndian>(self.nodes.len() as u32)
            .expect("Error writing node count");
        buf.write_u32::<BigEndian>(self.edges.len() as u32)
            .expect("Error writing edge count");
        buf.write_u32::<BigEndian>(total as u32).expect("Error writing total size");

        for node in &self.nodes {
            node.serialize(&mut buf).expect("Error writing node");
        }
        for edge in &self.edges {
            edge.serialize(&mut buf).expect("Error writing edge");
        }

        debug_assert_eq!(buf.len(), total);
        buf
    }

    /// Parse and validate a flat block.
    pub fn decode(buf: &[u8]) -> SgshResult<MessageBlock> {
        if buf.len() < HEADER_SIZE {
            return Err(SgshError::Fatal(ErrorKind::Protocol));
        }
        let mut stream = Cursor::new(buf);

        let version = stream.read_u16::<BigEndian>()?;
        if version != PROTOCOL_VERSION {
            return Err(SgshError::Fatal(ErrorKind::Protocol));
        }
        let state = State::from_u8(stream.read_u8()?)?;
        let initiator_pid = stream.read_u32::<BigEndian>()?;
        let serial_no = stream.read_u32::<BigEndian>()?;
        let origin_index = stream.read_i32::<BigEndian>()?;
        let origin_side = stream.read_u8()?;
        let n_nodes = stream.read_u32::<BigEndian>()? as usize;
        let n_edges = stream.read_u32::<BigEndian>()? as usize;
        let total_size = stream.read_u32::<BigEndian>()? as usize;

        if total_size != buf.len()
            || total_size != HEADER_SIZE + n_nodes * NODE_SIZE + n_edges * EDGE_SIZE
        {
            return Err(SgshError::Fatal(ErrorKind::Protocol));
        }

        let origin = if origin_index < 0 {
            None
        } else {
            Some(Origin {
                index: origin_index as usize,
                side: Side::from_u8(origin_side)?,
            })
        };

        let mut nodes = Vec::with_capacity(n_nodes);
        for _ in 0..n_nodes {
            nodes.push(Node::deserialize(&mut stream)?);
        }
        let mut edges = Vec::with_capacity(n_edges);
        for _ in 0..n_edges {
            edges.push(Edge::deserialize(&mut stream)?);
        }

        // A tool appears at most once and edges must reference known nodes.
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|other| other.pid == node.pid) {
                return Err(SgshError::Fatal(ErrorKind::Protocol));
            }
        }
        for edge in &edges {
            if edge.from as usize >= n_nodes || edge.to as usize >= n_nodes {
                return Err(SgshError::Fatal(ErrorKind::Protocol));
            }
        }

        Ok(MessageBlock {
            version,
            state,
            initiator_pid,
            serial_no,
            origin,
            nodes,
            edges,
        })
    }

    /// Extract the total block length from a flat header.
    pub fn peek_total_size(header: &[u8; HEADER_SIZE]) -> SgshResult<usize> {
        let mut stream = Cursor::new(&header[HEADER_SIZE - 4..]);
        Ok(stream.read_u32::<BigEndian>()? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(pid: Pid, name: &str) -> Node {
        Node {
            pid,
            name: name.to_owned(),
            requires_channels: 1,
            provides_channels: 2,
            sgsh_in: true,
            sgsh_out: false,
        }
    }

    fn test_block() -> MessageBlock {
        let mut mb = MessageBlock::new(100);
        mb.add_node(test_node(100, "paste"));
        mb.add_node(test_node(200, "comm"));
        mb.add_edge(Edge { from: 0, to: 1 });
        mb.origin = Some(Origin {
            index: 1,
            side: Side::Output,
        });
        mb
    }

    #[test]
    fn test_roundtrip() {
        let mb = test_block();

        let flat = mb.encode();

        assert_eq!(flat.len(), HEADER_SIZE + 2 * NODE_SIZE + EDGE_SIZE);
        assert_eq!(MessageBlock::decode(&flat).unwrap(), mb);
    }

    #[test]
    fn test_roundtrip_fresh_block() {
        let mb = MessageBlock::new(42);

        let decoded = MessageBlock::decode(&mb.encode()).unwrap();

        assert_eq!(decoded.origin, None);
        assert_eq!(decoded.nodes.len(), 0);
        assert_eq!(decoded.edges.len(), 0);
    }

    #[test]
    fn test_peek_total_size() {
        let mb = test_block();
        let flat = mb.encode();

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&flat[..HEADER_SIZE]);

        assert_eq!(MessageBlock::peek_total_size(&header).unwrap(), flat.len());
    }

    #[test]
    fn test_decode_truncated() {
        let flat = test_block().encode();

        let result = MessageBlock::decode(&flat[..flat.len() - 1]);

        assert_eq!(result.unwrap_err(), SgshError::Fatal(ErrorKind::Protocol));
    }

    #[test]
    fn test_decode_total_size_mismatch() {
        let mut flat = test_block().encode();

        // Corrupt the total size field at the end of the header.
        flat[HEADER_SIZE - 1] ^= 0xff;

        let result = MessageBlock::decode(&flat);

        assert_eq!(result.unwrap_err(), SgshError::Fatal(ErrorKind::Protocol));
    }

    #[test]
    fn test_decode_edge_index_out_of_range() {
        let mut mb = test_block();
        mb.edges[0].to = 7;

        let result = MessageBlock::decode(&mb.encode());

        assert_eq!(result.unwrap_err(), SgshError::Fatal(ErrorKind::Protocol));
    }

    #[test]
    fn test_decode_duplicate_pid() {
        let mut mb = test_block();
        mb.nodes[1].pid = mb.nodes[0].pid;

        let result = MessageBlock::decode(&mb.encode());

        assert_eq!(result.unwrap_err(), SgshError::Fatal(ErrorKind::Protocol));
    }

    #[test]
    fn test_name_truncated_to_field_width() {
        let mut mb = MessageBlock::new(1);
        let long_name: String = std::iter::repeat('x').take(NAME_SIZE + 10).collect();
        mb.add_node(test_node(1, &long_name));

        let decoded = MessageBlock::decode(&mb.encode()).unwrap();

        assert_eq!(decoded.nodes[0].name.len(), NAME_SIZE);
    }

    #[test]
    fn test_serial_bumped_on_mutation() {
        let mut mb = MessageBlock::new(100);
        assert_eq!(mb.serial_no, 0);

        mb.add_node(test_node(100, "a"));
        assert_eq!(mb.serial_no, 1);

        mb.add_node(test_node(200, "b"));
        mb.add_edge(Edge { from: 0, to: 1 });
        assert_eq!(mb.serial_no, 3);

        // Duplicate edges are ignored.
        assert!(!mb.add_edge(Edge { from: 0, to: 1 }));
        assert_eq!(mb.serial_no, 3);
    }

    #[test]
    fn test_edges_incident() {
        let mut mb = MessageBlock::new(1);
        mb.add_node(test_node(1, "a"));
        mb.add_node(test_node(2, "b"));
        mb.add_node(test_node(3, "c"));
        mb.add_edge(Edge { from: 0, to: 2 });
        mb.add_edge(Edge { from: 1, to: 2 });
        mb.add_edge(Edge { from: 2, to: 0 });

        let (incoming, outgoing) = mb.edges_incident(2);

        assert_eq!(incoming, vec![Edge { from: 0, to: 2 }, Edge { from: 1, to: 2 }]);
        assert_eq!(outgoing, vec![Edge { from: 2, to: 0 }]);
    }
}
