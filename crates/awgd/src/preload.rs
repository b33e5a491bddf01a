//! Queue-port preload protocol server.
//!
//! One client at a time feeds the two play lists over a small opcode
//! protocol (all integers big-endian):
//!
//! ```text
//! 'B'  u8 list_id, u32 total_frames     begin a load
//! 'P'  u8 list_id, u16 count, count*u32 append one frame
//! 'E'  u8 list_id                       finalize a partial list
//! 'Z'                                   reset: clear, silence, idle
//! 'X'                                   reset, then optional power-off
//! ```
//!
//! Any other opcode, any validation failure, any I/O error, or a read
//! timeout drops the connection; a list left LOADING by that client is
//! cancelled back to IDLE.

use std::{
    io::{self, Read},
    net::{SocketAddr, Shutdown},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use awg_words::MAX_WORDS_PER_FRAME;
use mio::{
    Events, Interest, Poll, Token,
    net::{TcpListener, TcpStream},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    net::{POLL_CAP, SOCK_RCVBUF, set_rcvbuf},
    notify::Notifier,
    sequencer::Sequencer,
    store::{FrameBuf, ListId, Store, StoreError},
};

const LISTENER: Token = Token(0);
const CLIENT: Token = Token(1);

const OP_BEGIN: u8 = b'B';
const OP_PUSH: u8 = b'P';
const OP_END: u8 = b'E';
const OP_RESET: u8 = b'Z';
const OP_SHUTDOWN: u8 = b'X';

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("list id {0} out of range")]
    BadListId(u8),
    #[error("frame word count {0} out of range (1..={MAX_WORDS_PER_FRAME})")]
    BadWordCount(u16),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A fully decoded, range-checked client command.
#[derive(Debug)]
pub enum Command {
    Begin { list: ListId, total: u32 },
    Push { list: ListId, frame: FrameBuf },
    End { list: ListId },
    Reset,
    Shutdown,
}

enum DecodeState {
    Op,
    BeginArgs { buf: [u8; 5], have: usize },
    EndArgs,
    PushHeader { buf: [u8; 3], have: usize },
    PushWords { list: ListId, count: usize, raw: [u8; 4 * MAX_WORDS_PER_FRAME], have: usize },
}

/// Incremental decoder over the client byte stream. TCP may hand us any
/// segmentation, so each state records how far through its fixed-size
/// chunk it got and resumes on the next read.
pub struct Decoder {
    state: DecodeState,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self { state: DecodeState::Op }
    }

    /// Consumes `bytes`, appending every completed command to `out`.
    /// Validation happens as soon as a field is complete; an error leaves
    /// the decoder in an unspecified state and the connection must drop.
    pub fn feed(&mut self, mut bytes: &[u8], out: &mut Vec<Command>) -> Result<(), ProtocolError> {
        while !bytes.is_empty() {
            self.state = match std::mem::replace(&mut self.state, DecodeState::Op) {
                DecodeState::Op => {
                    let op = bytes[0];
                    bytes = &bytes[1..];
                    match op {
                        OP_BEGIN => DecodeState::BeginArgs { buf: [0; 5], have: 0 },
                        OP_PUSH => DecodeState::PushHeader { buf: [0; 3], have: 0 },
                        OP_END => DecodeState::EndArgs,
                        OP_RESET => {
                            out.push(Command::Reset);
                            DecodeState::Op
                        }
                        OP_SHUTDOWN => {
                            out.push(Command::Shutdown);
                            DecodeState::Op
                        }
                        other => return Err(ProtocolError::UnknownOpcode(other)),
                    }
                }
                DecodeState::BeginArgs { mut buf, mut have } => {
                    let take = (buf.len() - have).min(bytes.len());
                    buf[have..have + take].copy_from_slice(&bytes[..take]);
                    have += take;
                    bytes = &bytes[take..];
                    if have < buf.len() {
                        DecodeState::BeginArgs { buf, have }
                    } else {
                        let list = list_id(buf[0])?;
                        let total = u32::from_be_bytes(buf[1..5].try_into().unwrap());
                        out.push(Command::Begin { list, total });
                        DecodeState::Op
                    }
                }
                DecodeState::EndArgs => {
                    let list = list_id(bytes[0])?;
                    bytes = &bytes[1..];
                    out.push(Command::End { list });
                    DecodeState::Op
                }
                DecodeState::PushHeader { mut buf, mut have } => {
                    let take = (buf.len() - have).min(bytes.len());
                    buf[have..have + take].copy_from_slice(&bytes[..take]);
                    have += take;
                    bytes = &bytes[take..];
                    if have < buf.len() {
                        DecodeState::PushHeader { buf, have }
                    } else {
                        let list = list_id(buf[0])?;
                        let count = u16::from_be_bytes([buf[1], buf[2]]);
                        if count == 0 || count as usize > MAX_WORDS_PER_FRAME {
                            return Err(ProtocolError::BadWordCount(count));
                        }
                        DecodeState::PushWords {
                            list,
                            count: count as usize,
                            raw: [0; 4 * MAX_WORDS_PER_FRAME],
                            have: 0,
                        }
                    }
                }
                DecodeState::PushWords { list, count, mut raw, mut have } => {
                    let need = 4 * count;
                    let take = (need - have).min(bytes.len());
                    raw[have..have + take].copy_from_slice(&bytes[..take]);
                    have += take;
                    bytes = &bytes[take..];
                    if have < need {
                        DecodeState::PushWords { list, count, raw, have }
                    } else {
                        // The only big-endian -> host conversion on the
                        // whole ingest path.
                        let mut words = [0u32; MAX_WORDS_PER_FRAME];
                        for (word, chunk) in words.iter_mut().zip(raw[..need].chunks_exact(4)) {
                            *word = u32::from_be_bytes(chunk.try_into().unwrap());
                        }
                        out.push(Command::Push { list, frame: FrameBuf::new(&words[..count]) });
                        DecodeState::Op
                    }
                }
            };
        }
        Ok(())
    }
}

fn list_id(raw: u8) -> Result<ListId, ProtocolError> {
    ListId::from_wire(raw).ok_or(ProtocolError::BadListId(raw))
}

enum DropReason {
    PeerClosed,
    Timeout,
    Protocol(ProtocolError),
    Io(io::Error),
    Superseded,
    ShutdownOp,
    Stopping,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::PeerClosed => write!(f, "peer closed"),
            DropReason::Timeout => write!(f, "read timeout"),
            DropReason::Protocol(e) => write!(f, "protocol error: {e}"),
            DropReason::Io(e) => write!(f, "i/o error: {e}"),
            DropReason::Superseded => write!(f, "superseded by new client"),
            DropReason::ShutdownOp => write!(f, "shutdown requested"),
            DropReason::Stopping => write!(f, "server stopping"),
        }
    }
}

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: Decoder,
    last_rx: Instant,
}

struct PreloadServer {
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    sequencer: Sequencer,
    stop: Arc<AtomicBool>,
    read_timeout: Duration,
}

/// Binds the queue port and spawns the protocol thread. Returns the bound
/// address.
pub fn spawn(
    addr: SocketAddr,
    read_timeout: Duration,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    sequencer: Sequencer,
    stop: Arc<AtomicBool>,
) -> io::Result<(thread::JoinHandle<()>, SocketAddr)> {
    let mut listener = TcpListener::bind(addr)?;
    let local = listener.local_addr()?;
    let poll = Poll::new()?;
    poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

    let server = PreloadServer { store, notifier, sequencer, stop, read_timeout };
    let handle = thread::Builder::new()
        .name("awg-preload".into())
        .spawn(move || server.run(listener, poll))?;
    Ok((handle, local))
}

impl PreloadServer {
    fn run(&self, listener: TcpListener, mut poll: Poll) {
        let mut events = Events::with_capacity(16);
        let mut client: Option<Client> = None;

        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = poll.poll(&mut events, Some(POLL_CAP)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "queue poll failed");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(&listener, &poll, &mut client),
                    CLIENT => {
                        if let Some(active) = client.as_mut() {
                            if let Err(reason) = self.service(active) {
                                self.drop_client(&poll, &mut client, &reason);
                            }
                        }
                    }
                    _ => {}
                }
            }

            if let Some(active) = client.as_ref() {
                if active.last_rx.elapsed() > self.read_timeout {
                    self.drop_client(&poll, &mut client, &DropReason::Timeout);
                }
            }
        }

        // Drain the in-flight client so a mid-load list never survives the
        // process as LOADING.
        if client.is_some() {
            self.drop_client(&poll, &mut client, &DropReason::Stopping);
        }
        debug!("queue loop finished");
    }

    fn accept_all(&self, listener: &TcpListener, poll: &Poll, client: &mut Option<Client>) {
        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    if client.is_some() {
                        self.drop_client(poll, client, &DropReason::Superseded);
                    }
                    let _ = stream.set_nodelay(true);
                    set_rcvbuf(&stream, SOCK_RCVBUF);
                    if let Err(e) =
                        poll.registry().register(&mut stream, CLIENT, Interest::READABLE)
                    {
                        warn!(error = %e, %peer, "couldn't register queue client");
                        let _ = stream.shutdown(Shutdown::Both);
                        continue;
                    }
                    info!(%peer, "queue client connected");
                    *client =
                        Some(Client { stream, peer, decoder: Decoder::new(), last_rx: Instant::now() });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "queue accept failed");
                    break;
                }
            }
        }
    }

    /// Reads everything currently buffered for the client and applies the
    /// commands that completed.
    fn service(&self, client: &mut Client) -> Result<(), DropReason> {
        let mut scratch = [0u8; 8192];
        let mut commands = Vec::new();
        loop {
            match client.stream.read(&mut scratch) {
                Ok(0) => return Err(DropReason::PeerClosed),
                Ok(n) => {
                    client.last_rx = Instant::now();
                    client
                        .decoder
                        .feed(&scratch[..n], &mut commands)
                        .map_err(DropReason::Protocol)?;
                    for command in commands.drain(..) {
                        self.apply(command)?;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(DropReason::Io(e)),
            }
        }
    }

    fn apply(&self, command: Command) -> Result<(), DropReason> {
        let applied = match command {
            Command::Begin { list, total } => {
                debug!(%list, total, "begin");
                self.store.begin(list, total)
            }
            Command::Push { list, frame } => self.store.push(list, frame.words()),
            Command::End { list } => {
                debug!(%list, "end");
                self.store.end(list)
            }
            Command::Reset => {
                info!("reset requested");
                self.sequencer.reset();
                Ok(Vec::new())
            }
            Command::Shutdown => {
                info!("shutdown requested");
                self.sequencer.reset();
                self.request_poweroff();
                return Err(DropReason::ShutdownOp);
            }
        };
        let transitions =
            applied.map_err(|e| DropReason::Protocol(ProtocolError::Store(e)))?;
        self.notifier.apply(&transitions);
        Ok(())
    }

    #[cfg(feature = "poweroff")]
    fn request_poweroff(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(e) = std::process::Command::new("poweroff").spawn() {
            error!(error = %e, "couldn't invoke poweroff");
        }
    }

    #[cfg(not(feature = "poweroff"))]
    fn request_poweroff(&self) {}

    /// Closes the client and cancels whatever it left LOADING.
    fn drop_client(&self, poll: &Poll, client: &mut Option<Client>, reason: &DropReason) {
        let Some(mut active) = client.take() else {
            return;
        };
        info!(peer = %active.peer, reason = %reason, "queue client dropped");
        let _ = poll.registry().deregister(&mut active.stream);
        let _ = active.stream.shutdown(Shutdown::Both);
        let cancelled = self.store.cancel_loading();
        self.notifier.apply(&cancelled);
    }
}
