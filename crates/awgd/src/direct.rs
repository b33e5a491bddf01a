//! Direct port: one frame per message, applied without queueing.
//!
//! Wire format per message: `[u16 count_be][count x u32_be]`, count in
//! 1..=64. No commit injection, no list bookkeeping; the decoded words go
//! to the hardware verbatim. To keep the bus single-writer the frame
//! travels over a capacity-1 channel and the player dispatches it at the
//! head of its next tick; if a frame is still pending the new one is
//! dropped and logged.

use std::{
    io::{self, Read},
    net::{Shutdown, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use awg_words::MAX_WORDS_PER_FRAME;
use crossbeam_channel::{Sender, TrySendError};
use mio::{
    Events, Interest, Poll, Token,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, error, info, warn};

use crate::{
    net::{POLL_CAP, SOCK_RCVBUF, set_rcvbuf},
    store::FrameBuf,
};

const LISTENER: Token = Token(0);

enum DecodeState {
    Header { buf: [u8; 2], have: usize },
    Words { count: usize, raw: [u8; 4 * MAX_WORDS_PER_FRAME], have: usize },
}

struct FrameDecoder {
    state: DecodeState,
}

impl FrameDecoder {
    fn new() -> Self {
        Self { state: DecodeState::Header { buf: [0; 2], have: 0 } }
    }

    /// Consumes `bytes`, appending each completed frame to `out`. A count
    /// outside 1..=64 poisons the stream and the connection must drop.
    fn feed(&mut self, mut bytes: &[u8], out: &mut Vec<FrameBuf>) -> Result<(), u16> {
        while !bytes.is_empty() {
            self.state = match std::mem::replace(
                &mut self.state,
                DecodeState::Header { buf: [0; 2], have: 0 },
            ) {
                DecodeState::Header { mut buf, mut have } => {
                    let take = (buf.len() - have).min(bytes.len());
                    buf[have..have + take].copy_from_slice(&bytes[..take]);
                    have += take;
                    bytes = &bytes[take..];
                    if have < buf.len() {
                        DecodeState::Header { buf, have }
                    } else {
                        let count = u16::from_be_bytes(buf);
                        if count == 0 || count as usize > MAX_WORDS_PER_FRAME {
                            return Err(count);
                        }
                        DecodeState::Words {
                            count: count as usize,
                            raw: [0; 4 * MAX_WORDS_PER_FRAME],
                            have: 0,
                        }
                    }
                }
                DecodeState::Words { count, mut raw, mut have } => {
                    let need = 4 * count;
                    let take = (need - have).min(bytes.len());
                    raw[have..have + take].copy_from_slice(&bytes[..take]);
                    have += take;
                    bytes = &bytes[take..];
                    if have < need {
                        DecodeState::Words { count, raw, have }
                    } else {
                        let mut words = [0u32; MAX_WORDS_PER_FRAME];
                        for (word, chunk) in words.iter_mut().zip(raw[..need].chunks_exact(4)) {
                            *word = u32::from_be_bytes(chunk.try_into().unwrap());
                        }
                        out.push(FrameBuf::new(&words[..count]));
                        DecodeState::Header { buf: [0; 2], have: 0 }
                    }
                }
            };
        }
        Ok(())
    }
}

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder,
    last_rx: Instant,
}

/// Binds the direct port and spawns its thread. Unlike the queue port,
/// several clients may be connected at once.
pub fn spawn(
    addr: SocketAddr,
    read_timeout: Duration,
    frame_tx: Sender<FrameBuf>,
    stop: Arc<AtomicBool>,
) -> io::Result<(thread::JoinHandle<()>, SocketAddr)> {
    let mut listener = TcpListener::bind(addr)?;
    let local = listener.local_addr()?;
    let poll = Poll::new()?;
    poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

    let handle = thread::Builder::new()
        .name("awg-direct".into())
        .spawn(move || run(listener, poll, &frame_tx, read_timeout, &stop))?;
    Ok((handle, local))
}

fn run(
    listener: TcpListener,
    mut poll: Poll,
    frame_tx: &Sender<FrameBuf>,
    read_timeout: Duration,
    stop: &AtomicBool,
) {
    let mut events = Events::with_capacity(32);
    let mut clients: Vec<(Token, Client)> = Vec::new();
    let mut next_token = 1usize;

    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_CAP)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "direct poll failed");
            break;
        }

        for event in events.iter() {
            if event.token() == LISTENER {
                accept_all(&listener, &poll, &mut clients, &mut next_token);
            } else if let Some(at) = clients.iter().position(|(t, _)| *t == event.token()) {
                if !service(&mut clients[at].1, frame_tx) {
                    close_at(&poll, &mut clients, at, "stream ended");
                }
            }
        }

        let mut at = clients.len();
        while at != 0 {
            at -= 1;
            if clients[at].1.last_rx.elapsed() > read_timeout {
                close_at(&poll, &mut clients, at, "read timeout");
            }
        }
    }

    while let Some(at) = clients.len().checked_sub(1) {
        close_at(&poll, &mut clients, at, "server stopping");
    }
    debug!("direct loop finished");
}

fn accept_all(
    listener: &TcpListener,
    poll: &Poll,
    clients: &mut Vec<(Token, Client)>,
    next_token: &mut usize,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let _ = stream.set_nodelay(true);
                set_rcvbuf(&stream, SOCK_RCVBUF);
                let token = Token(*next_token);
                *next_token += 1;
                if let Err(e) = poll.registry().register(&mut stream, token, Interest::READABLE) {
                    warn!(error = %e, %peer, "couldn't register direct client");
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                }
                info!(%peer, "direct client connected");
                clients.push((
                    token,
                    Client { stream, peer, decoder: FrameDecoder::new(), last_rx: Instant::now() },
                ));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "direct accept failed");
                break;
            }
        }
    }
}

/// Returns false when the connection should close.
fn service(client: &mut Client, frame_tx: &Sender<FrameBuf>) -> bool {
    let mut scratch = [0u8; 8192];
    let mut frames = Vec::new();
    loop {
        match client.stream.read(&mut scratch) {
            Ok(0) => return false,
            Ok(n) => {
                client.last_rx = Instant::now();
                if let Err(count) = client.decoder.feed(&scratch[..n], &mut frames) {
                    warn!(peer = %client.peer, count, "bad direct frame count");
                    return false;
                }
                for frame in frames.drain(..) {
                    match frame_tx.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(peer = %client.peer, "direct frame dropped, dispatch busy");
                        }
                        Err(TrySendError::Disconnected(_)) => return false,
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(peer = %client.peer, error = %e, "direct read failed");
                return false;
            }
        }
    }
}

fn close_at(poll: &Poll, clients: &mut Vec<(Token, Client)>, at: usize, why: &str) {
    let (_, mut client) = clients.swap_remove(at);
    info!(peer = %client.peer, why, "direct client closed");
    let _ = poll.registry().deregister(&mut client.stream);
    let _ = client.stream.shutdown(Shutdown::Both);
}
