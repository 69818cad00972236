use crate::chain::{Chain, Cursor, Ingest, Mode, BUFFER_SIZE};
use crate::client::{Client, ClientState, ReadOutcome, WriteProgress, MAX_CLIENTS};
use crate::sock;
use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Token};
use sgsh::fd::Fd;
use sgsh::logging::{self, debug, trace, Logger};
use sgsh::shared::{ErrorKind, SgshError};
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

const LISTENER_TOKEN: Token = Token(MAX_CLIENTS);
const INPUT_TOKEN: Token = Token(MAX_CLIENTS + 1);

/// Fatal store conditions, mapped onto the process exit codes.
#[derive(Debug)]
pub enum StoreError {
    Usage(String),
    Setup(io::Error),
    Listen(io::Error),
    Accept(io::Error),
    Io(io::Error),
    Protocol(String),
    SlotsExhausted,
}

impl StoreError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StoreError::Usage(_) => 1,
            StoreError::Setup(_) => 2,
            StoreError::Io(_) => 3,
            StoreError::Listen(_) => 4,
            StoreError::Accept(_) => 5,
            StoreError::Protocol(_) => 1,
            StoreError::SlotsExhausted => 1,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::Usage(msg) => write!(f, "{}", msg),
            StoreError::Setup(err) => write!(f, "Error setting up socket: {}", err),
            StoreError::Listen(err) => write!(f, "listen: {}", err),
            StoreError::Accept(err) => write!(f, "accept: {}", err),
            StoreError::Io(err) => write!(f, "I/O error: {}", err),
            StoreError::Protocol(msg) => write!(f, "{}", msg),
            StoreError::SlotsExhausted => write!(f, "Maximum number of clients exceeded"),
        }
    }
}

/// The record range to serve, as reverse iterators counted from the end
/// of the stream: `rbegin` is inclusive, `rend` exclusive. The default
/// selects the single most recent record.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Range {
    pub rbegin: u32,
    pub rend: u32,
}

impl Default for Range {
    fn default() -> Range {
        Range { rbegin: 0, rend: 1 }
    }
}

enum Flow {
    Continue,
    Quit,
}

/// The value store server: a single-threaded poll loop over the input
/// stream, the listening socket and the active client connections.
pub struct Store {
    mode: Mode,
    range: Range,
    chain: Chain,
    clients: Vec<Client>,
    poll: Poll,
    listener: UnixListener,
    input: Fd,
    socket_path: PathBuf,
    reached_eof: bool,
    have_record: bool,
    current_begin: Cursor,
    current_end: Cursor,
    oldest_being_written: Option<u64>,
    log: Logger,
}

impl Store {
    pub fn new(
        input: Fd,
        socket_path: PathBuf,
        mode: Mode,
        range: Range,
        log: &Logger,
    ) -> Result<Store, StoreError> {
        Self::with_buffer_capacity(input, socket_path, mode, range, BUFFER_SIZE, log)
    }

    pub fn with_buffer_capacity(
        input: Fd,
        socket_path: PathBuf,
        mode: Mode,
        range: Range,
        capacity: usize,
        log: &Logger,
    ) -> Result<Store, StoreError> {
        // Clear any stale socket left over from a previous run.
        fs::remove_file(&socket_path).ok();

        let listener = sock::listen(&socket_path)?;
        input.set_nonblocking().map_err(StoreError::Setup)?;

        let poll = Poll::new().map_err(StoreError::Setup)?;
        poll.register(
            &EventedFd(&listener.as_raw_fd()),
            LISTENER_TOKEN,
            Ready::readable(),
            PollOpt::level(),
        )
        .map_err(StoreError::Setup)?;
        poll.register(
            &EventedFd(&input.as_raw_fd()),
            INPUT_TOKEN,
            Ready::readable(),
            PollOpt::level(),
        )
        .map_err(StoreError::Setup)?;

        let log = logging::child(log);
        debug!(log, "store listening";
               "path" => %socket_path.display(),
               "mode" => ?mode,
               "rbegin" => range.rbegin,
               "rend" => range.rend);

        Ok(Store {
            mode,
            range,
            chain: Chain::new(capacity),
            clients: (0..MAX_CLIENTS).map(|_| Client::new()).collect(),
            poll,
            listener,
            input,
            socket_path,
            reached_eof: false,
            have_record: false,
            current_begin: Cursor::default(),
            current_end: Cursor::default(),
            oldest_being_written: None,
            log,
        })
    }

    /// Run the event loop until a client sends the quit command. The
    /// socket path is unlinked before returning.
    pub fn run(&mut self) -> Result<(), StoreError> {
        let mut events = Events::with_capacity(256);

        loop {
            self.refresh_interests()?;
            self.poll.poll(&mut events, None).map_err(StoreError::Io)?;

            let ready: Vec<(Token, Ready)> =
                events.iter().map(|e| (e.token(), e.readiness())).collect();

            // Input first so responses snapshot the freshest record,
            // then client traffic, then new connections.
            if ready.iter().any(|&(token, _)| token == INPUT_TOKEN) {
                self.handle_input()?;
            }
            for &(token, readiness) in ready.iter().filter(|&&(token, _)| token.0 < MAX_CLIENTS) {
                if let Flow::Quit = self.handle_client(token.0, readiness)? {
                    debug!(self.log, "quit command received, shutting down");
                    fs::remove_file(&self.socket_path).ok();
                    return Ok(());
                }
            }
            if ready.iter().any(|&(token, _)| token == LISTENER_TOKEN) {
                self.handle_accept()?;
            }
        }
    }

    /// Derive each active client's poll interest from its state: command
    /// and close waits read, responses write, and the write side is only
    /// armed once the requested record can actually be served.
    fn refresh_interests(&mut self) -> Result<(), StoreError> {
        for i in 0..MAX_CLIENTS {
            let desired = match self.clients[i].state() {
                ClientState::Inactive => continue,
                ClientState::ReadCommand | ClientState::WaitClose => Ready::readable(),
                ClientState::SendLast => {
                    if self.reached_eof {
                        Ready::writable()
                    } else {
                        Ready::empty()
                    }
                }
                ClientState::SendCurrent => {
                    if self.have_record {
                        Ready::writable()
                    } else {
                        Ready::empty()
                    }
                }
                ClientState::SendingResponse => Ready::writable(),
            };

            if self.clients[i].interest() != Some(desired) {
                let fd = self.clients[i].fd();
                self.poll
                    .reregister(&EventedFd(&fd), Token(i), desired, PollOpt::level())
                    .map_err(StoreError::Io)?;
                self.clients[i].set_interest(Some(desired));
            }
        }
        Ok(())
    }

    fn handle_input(&mut self) -> Result<(), StoreError> {
        match self.chain.ingest(&mut self.input, self.mode) {
            Ok(Ingest::Data(size)) => {
                trace!(self.log, "read input"; "bytes" => size, "buffers" => self.chain.len());
                self.update_current_record();
                Ok(())
            }
            Ok(Ingest::Retry) => Ok(()),
            Ok(Ingest::Eof) => {
                self.handle_input_eof();
                Ok(())
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    fn handle_input_eof(&mut self) {
        debug!(self.log, "reached end of input"; "have_record" => self.have_record);
        self.reached_eof = true;
        self.poll
            .deregister(&EventedFd(&self.input.as_raw_fd()))
            .ok();

        if self.have_record {
            return;
        }
        if self.chain.is_empty() {
            // Serve an empty record.
            let seq = self.chain.push_empty();
            self.current_begin = Cursor { seq, pos: 0 };
            self.current_end = self.current_begin;
        } else {
            // No record terminator ever arrived; the whole input is the
            // record.
            self.current_begin = Cursor {
                seq: self.chain.head_seq(),
                pos: 0,
            };
            self.current_end = Cursor {
                seq: self.chain.tail_seq(),
                pos: self.chain.tail().expect("Chain is not empty").size(),
            };
        }
        self.have_record = true;
    }

    /// Re-derive the cursors bracketing the requested record range from
    /// the tail of the chain, then trim buffers nothing points at.
    fn update_current_record(&mut self) {
        let tail = self.chain.tail().expect("Chain must hold data after a read");
        if tail.record_count() < u64::from(self.range.rend) {
            // Not enough records yet.
            return;
        }

        let mut end = Cursor {
            seq: tail.seq(),
            pos: tail.size(),
        };
        let tail_bytes = tail.byte_count();

        match self.mode {
            Mode::Separator(rs) => {
                // Skip any bytes of an incomplete trailing record, then
                // walk back over the requested range.
                self.chain.move_back_records(&mut end, 0, rs);
                self.chain
                    .move_back_records(&mut end, self.range.rbegin as usize, rs);
                let mut begin = end;
                self.chain.move_back_records(
                    &mut begin,
                    (self.range.rend - self.range.rbegin) as usize,
                    rs,
                );
                self.current_begin = begin;
                self.current_end = end;
            }
            Mode::Length(rl) => {
                self.chain.subtract(&mut end, (tail_bytes % rl as u64) as usize);
                self.chain
                    .subtract(&mut end, self.range.rbegin as usize * rl);
                let mut begin = end;
                self.chain
                    .subtract(&mut begin, (self.range.rend - self.range.rbegin) as usize * rl);
                self.current_begin = begin;
                self.current_end = end;
            }
        }

        self.have_record = true;
        trace!(self.log, "current record updated";
               "begin_seq" => self.current_begin.seq,
               "begin_pos" => self.current_begin.pos,
               "end_seq" => self.current_end.seq,
               "end_pos" => self.current_end.pos);
        self.trim_chain();
    }

    /// Free head buffers no cursor can reach: everything before both the
    /// current record and the oldest buffer still being written out.
    fn trim_chain(&mut self) {
        let keep = match self.oldest_being_written {
            Some(seq) => seq.min(self.current_begin.seq),
            None => self.current_begin.seq,
        };
        self.chain.trim(keep);
    }

    /// Recompute the oldest buffer referenced by any in-flight response.
    fn update_oldest(&mut self) {
        self.oldest_being_written = self
            .clients
            .iter()
            .filter(|c| c.state() == ClientState::SendingResponse)
            .map(|c| c.write_begin.seq)
            .min();
    }

    fn handle_client(&mut self, i: usize, readiness: Ready) -> Result<Flow, StoreError> {
        match self.clients[i].state() {
            ClientState::Inactive => Ok(Flow::Continue),
            ClientState::ReadCommand | ClientState::WaitClose => {
                if !readiness.is_readable() {
                    return Ok(Flow::Continue);
                }
                match self.clients[i].read_command() {
                    Ok(ReadOutcome::Wait) => Ok(Flow::Continue),
                    Ok(ReadOutcome::Closed) => {
                        debug!(self.log, "client closed connection"; "slot" => i);
                        self.disconnect(i);
                        Ok(Flow::Continue)
                    }
                    Ok(ReadOutcome::Command(cmd)) => self.dispatch_command(i, cmd),
                    Err(SgshError::Wait) => Ok(Flow::Continue),
                    Err(SgshError::Fatal(ErrorKind::Io(kind))) => {
                        Err(StoreError::Io(kind.into()))
                    }
                    Err(_) => Err(StoreError::Protocol("Read from socket failed".to_owned())),
                }
            }
            ClientState::SendLast | ClientState::SendCurrent => {
                if !readiness.is_writable() || !self.have_record {
                    return Ok(Flow::Continue);
                }
                // Start streaming the freshest record range.
                self.clients[i].begin_response(self.current_begin, self.current_end);
                self.oldest_being_written = Some(match self.oldest_being_written {
                    Some(seq) => seq.min(self.current_begin.seq),
                    None => self.current_begin.seq,
                });
                self.drive_write(i, true)
            }
            ClientState::SendingResponse => {
                if !readiness.is_writable() {
                    return Ok(Flow::Continue);
                }
                self.drive_write(i, false)
            }
        }
    }

    fn drive_write(&mut self, i: usize, first: bool) -> Result<Flow, StoreError> {
        match self.clients[i].write_record(&self.chain, first) {
            Ok(WriteProgress::Again) => Ok(Flow::Continue),
            Ok(WriteProgress::Done) => {
                trace!(self.log, "response complete"; "slot" => i);
                self.update_oldest();
                Ok(Flow::Continue)
            }
            Err(SgshError::Wait) => Ok(Flow::Continue),
            Err(SgshError::Fatal(ErrorKind::ShortWrite)) => Err(StoreError::Protocol(
                "Short content length record write".to_owned(),
            )),
            Err(SgshError::Fatal(ErrorKind::Io(kind))) => Err(StoreError::Io(kind.into())),
            Err(_) => Err(StoreError::Protocol("Write to socket failed".to_owned())),
        }
    }

    fn dispatch_command(&mut self, i: usize, cmd: u8) -> Result<Flow, StoreError> {
        debug!(self.log, "read command"; "slot" => i, "command" => cmd as char);
        match cmd {
            b'L' => {
                self.clients[i].set_state(ClientState::SendLast);
                Ok(Flow::Continue)
            }
            b'C' => {
                self.clients[i].set_state(ClientState::SendCurrent);
                Ok(Flow::Continue)
            }
            b'Q' => Ok(Flow::Quit),
            other => Err(StoreError::Protocol(format!(
                "Unknown command [{}]",
                other as char
            ))),
        }
    }

    fn disconnect(&mut self, i: usize) {
        let fd = self.clients[i].fd();
        self.poll.deregister(&EventedFd(&fd)).ok();
        self.clients[i].close();
        self.update_oldest();
    }

    fn handle_accept(&mut self) -> Result<(), StoreError> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                let slot = self.free_slot()?;
                stream.set_nonblocking(true).map_err(StoreError::Setup)?;
                let fd = stream.as_raw_fd();
                self.clients[slot].open(stream, &self.log);
                self.poll
                    .register(&EventedFd(&fd), Token(slot), Ready::readable(), PollOpt::level())
                    .map_err(StoreError::Io)?;
                self.clients[slot].set_interest(Some(Ready::readable()));
                debug!(self.log, "accepted client"; "slot" => slot);
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(StoreError::Accept(e)),
        }
    }

    fn free_slot(&self) -> Result<usize, StoreError> {
        self.clients
            .iter()
            .position(|c| c.state() == ClientState::Inactive)
            .ok_or(StoreError::SlotsExhausted)
    }
}
