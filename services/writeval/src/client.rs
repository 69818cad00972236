use crate::chain::{Chain, Cursor};
use sgsh::logging::{self, trace, Logger};
use sgsh::shared::{ErrorKind, SgshError, SgshResult};
use std::io::{self, IoSlice, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Fixed pool of client slots.
pub const MAX_CLIENTS: usize = 64;

/// Width of the ASCII content-length header preceding each response.
pub const CONTENT_LENGTH_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientState {
    /// Free (unused or closed).
    Inactive,
    /// Waiting for a command byte.
    ReadCommand,
    /// Waiting for the current value to become writable.
    SendCurrent,
    /// Waiting for the last (before EOF) value to become writable.
    SendLast,
    /// A response is being written.
    SendingResponse,
    /// Waiting for the client to close the connection.
    WaitClose,
}

/// Result of one command read attempt.
#[derive(Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    /// No data yet.
    Wait,
    /// The peer closed the connection.
    Closed,
    /// A command byte arrived.
    Command(u8),
}

/// Result of one response write attempt.
#[derive(Debug, Eq, PartialEq)]
pub enum WriteProgress {
    /// More data remains; retry on the next writable event.
    Again,
    /// The whole response has been written.
    Done,
}

/// One connected store client. The two cursors bracket the record range
/// being streamed while the slot is in `SendingResponse`.
pub struct Client {
    stream: Option<UnixStream>,
    state: ClientState,
    pub write_begin: Cursor,
    pub write_end: Cursor,
    interest: Option<mio::Ready>,
    log: Logger,
}

impl Client {
    pub fn new() -> Client {
        Client {
            stream: None,
            state: ClientState::Inactive,
            write_begin: Cursor::default(),
            write_end: Cursor::default(),
            interest: None,
            log: logging::child(None),
        }
    }

    /// Attach an accepted connection to this slot.
    pub fn open(&mut self, stream: UnixStream, log: &Logger) {
        debug_assert_eq!(self.state, ClientState::Inactive);
        self.stream = Some(stream);
        self.state = ClientState::ReadCommand;
        self.log = logging::child(log);
    }

    /// Release the connection and recycle the slot.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = ClientState::Inactive;
        self.interest = None;
        self.write_begin = Cursor::default();
        self.write_end = Cursor::default();
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: ClientState) {
        self.state = state;
    }

    #[inline]
    pub fn interest(&self) -> Option<mio::Ready> {
        self.interest
    }

    #[inline]
    pub fn set_interest(&mut self, interest: Option<mio::Ready>) {
        self.interest = interest;
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.stream
            .as_ref()
            .expect("Active client must have a stream")
            .as_raw_fd()
    }

    /// Read the single command byte off the connection.
    pub fn read_command(&mut self) -> SgshResult<ReadOutcome> {
        let stream = self.stream.as_mut().expect("Active client must have a stream");
        let mut cmd = [0u8; 1];
        match stream.read(&mut cmd) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(_) => Ok(ReadOutcome::Command(cmd[0])),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Wait),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::Wait),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot the record range to stream to this client.
    pub fn begin_response(&mut self, begin: Cursor, end: Cursor) {
        self.write_begin = begin;
        self.write_end = end;
        self.state = ClientState::SendingResponse;
    }

    /// Write the next slice of the response, at most one buffer's worth.
    ///
    /// The first write is preceded by the fixed-width content length;
    /// its bytes are consumed from the write count before the data
    /// cursor advances. A write shorter than the header itself cannot be
    /// resumed and is fatal.
    pub fn write_record(&mut self, chain: &Chain, first: bool) -> SgshResult<WriteProgress> {
        let begin = self.write_begin;
        let end = self.write_end;
        let buffer = chain.buffer(begin.seq);
        let towrite = if begin.seq == end.seq {
            end.pos - begin.pos
        } else {
            buffer.size() - begin.pos
        };
        let chunk = &buffer.bytes()[begin.pos..begin.pos + towrite];

        let stream = self.stream.as_mut().expect("Active client must have a stream");
        let result = if first {
            let length = chain.distance(begin, end);
            let header = format!("{:0width$}", length, width = CONTENT_LENGTH_DIGITS);
            let slices = [IoSlice::new(header.as_bytes()), IoSlice::new(chunk)];
            stream.write_vectored(&slices)
        } else {
            stream.write(chunk)
        };

        let mut written = match result {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteProgress::Again),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(WriteProgress::Again),
            Err(e) => return Err(e.into()),
        };

        if first {
            if written < CONTENT_LENGTH_DIGITS {
                return Err(SgshError::Fatal(ErrorKind::ShortWrite));
            }
            written -= CONTENT_LENGTH_DIGITS;
        }

        self.write_begin.pos += written;
        trace!(self.log, "wrote response bytes";
               "written" => written,
               "pos" => self.write_begin.pos,
               "seq" => self.write_begin.seq);

        // More data left in this buffer?
        if self.write_begin.pos < buffer.size()
            && (begin.seq != end.seq || self.write_begin.pos < end.pos)
        {
            return Ok(WriteProgress::Again);
        }

        // More buffers to write from?
        if begin.seq != end.seq {
            self.write_begin.seq += 1;
            self.write_begin.pos = 0;
            return Ok(WriteProgress::Again);
        }

        self.state = ClientState::WaitClose;
        Ok(WriteProgress::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Ingest, Mode};
    use std::io::Cursor as IoCursor;

    fn chain_from(data: &[u8], capacity: usize) -> Chain {
        let mut chain = Chain::new(capacity);
        let mut reader = IoCursor::new(data.to_vec());
        loop {
            match chain.ingest(&mut reader, Mode::Separator(b'\n')).unwrap() {
                Ingest::Eof => break,
                _ => {}
            }
        }
        chain
    }

    fn client_pair(log: &Logger) -> (Client, UnixStream) {
        let (local, remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let mut client = Client::new();
        client.open(local, log);
        (client, remote)
    }

    fn drain(remote: &UnixStream, out: &mut Vec<u8>) {
        let mut remote = remote;
        let mut buf = [0u8; 4096];
        loop {
            match remote.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("Unexpected read error {:?}", e),
            }
        }
    }

    #[test]
    fn test_read_command() {
        let log = logging::child(None);
        let (mut client, remote) = client_pair(&log);

        assert_eq!(client.read_command().unwrap(), ReadOutcome::Wait);

        (&remote).write_all(b"C").unwrap();
        assert_eq!(client.read_command().unwrap(), ReadOutcome::Command(b'C'));

        drop(remote);
        assert_eq!(client.read_command().unwrap(), ReadOutcome::Closed);
    }

    #[test]
    fn test_single_buffer_response() {
        let log = logging::child(None);
        let chain = chain_from(b"a\nbb\ncc", 4096);
        let (mut client, remote) = client_pair(&log);
        remote.set_nonblocking(true).unwrap();

        // The most recent complete record is "bb\n" at bytes 2..5.
        client.begin_response(Cursor { seq: 0, pos: 2 }, Cursor { seq: 0, pos: 5 });

        assert_eq!(client.write_record(&chain, true).unwrap(), WriteProgress::Done);
        assert_eq!(client.state(), ClientState::WaitClose);

        let mut received = Vec::new();
        drain(&remote, &mut received);
        assert_eq!(received, b"0000000003bb\n");
    }

    #[test]
    fn test_response_spanning_buffers() {
        let log = logging::child(None);
        let chain = chain_from(b"a\nbb\ncc\n", 4);
        let (mut client, remote) = client_pair(&log);
        remote.set_nonblocking(true).unwrap();

        // Stream everything from the first byte to the last separator.
        let begin = Cursor { seq: 0, pos: 0 };
        let end = Cursor { seq: 1, pos: 4 };
        client.begin_response(begin, end);

        let mut received = Vec::new();
        let mut first = true;
        loop {
            match client.write_record(&chain, first).unwrap() {
                WriteProgress::Again => {
                    first = false;
                    drain(&remote, &mut received);
                }
                WriteProgress::Done => break,
            }
        }
        drain(&remote, &mut received);

        assert_eq!(received, b"0000000008a\nbb\ncc\n");
    }

    #[test]
    fn test_short_writes_resume() {
        let log = logging::child(None);

        // A record big enough to overflow the socket buffer so writes
        // return short counts and would-block conditions.
        let mut data = vec![b'x'; 1 << 20];
        data.push(b'\n');
        let chain = chain_from(&data, 65536);

        let (mut client, remote) = client_pair(&log);
        remote.set_nonblocking(true).unwrap();

        let begin = Cursor { seq: 0, pos: 0 };
        let end = Cursor {
            seq: chain.tail_seq(),
            pos: chain.tail().unwrap().size(),
        };
        client.begin_response(begin, end);

        let mut received = Vec::new();
        let mut first = true;
        loop {
            match client.write_record(&chain, first).unwrap() {
                WriteProgress::Again => {
                    first = false;
                    drain(&remote, &mut received);
                }
                WriteProgress::Done => break,
            }
        }
        drain(&remote, &mut received);

        let mut expected = format!("{:010}", data.len()).into_bytes();
        expected.extend_from_slice(&data);
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);
    }

    #[test]
    fn test_empty_record_response() {
        let log = logging::child(None);
        let mut chain = Chain::new(4096);
        let seq = chain.push_empty();
        let (mut client, remote) = client_pair(&log);
        remote.set_nonblocking(true).unwrap();

        client.begin_response(Cursor { seq, pos: 0 }, Cursor { seq, pos: 0 });

        assert_eq!(client.write_record(&chain, true).unwrap(), WriteProgress::Done);

        let mut received = Vec::new();
        drain(&remote, &mut received);
        assert_eq!(received, b"0000000000");
    }
}
