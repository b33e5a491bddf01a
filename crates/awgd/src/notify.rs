//! Single-subscriber status channel.
//!
//! One line per observed list-state transition, `LIST<id>:<STATE>\n`.
//! Emission is edge-triggered against a per-subscriber cache, so a line
//! goes out only when the state differs from the last one that subscriber
//! saw. The notifier owns its own mutex; callers must have released the
//! store lock before reporting transitions here.

use std::{
    io::{self, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, warn};

use crate::{
    net::POLL_CAP,
    store::{ListId, ListStatus, Transitions},
};

const LISTENER: Token = Token(0);

struct NotifyInner {
    subscriber: Option<TcpStream>,
    /// Latest observed state per list; keeps accumulating with no
    /// subscriber attached.
    status: [ListStatus; 2],
    /// Last state actually written to the current subscriber. `None`
    /// means unknown, so a fresh subscriber always gets both lists.
    last_sent: [Option<ListStatus>; 2],
}

pub struct Notifier {
    inner: Mutex<NotifyInner>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(NotifyInner {
                subscriber: None,
                status: [ListStatus::Idle; 2],
                last_sent: [None; 2],
            }),
        }
    }

    /// Installs a subscriber, closing any prior one, and immediately
    /// emits the current state of both lists.
    pub fn attach(&self, stream: TcpStream) {
        // A stuck peer must not wedge every status producer behind the
        // notifier mutex; a timed-out write counts as a send error.
        let _ = stream.set_write_timeout(Some(Duration::from_secs(1)));
        let mut inner = self.inner.lock().expect("notifier mutex poisoned");
        if let Some(old) = inner.subscriber.take() {
            debug!("superseding notify subscriber");
            let _ = old.shutdown(Shutdown::Both);
        }
        inner.last_sent = [None; 2];
        inner.subscriber = Some(stream);
        for id in ListId::BOTH {
            emit(&mut inner, id);
        }
    }

    /// Records a state change and emits it if it is an edge for the
    /// current subscriber.
    pub fn set_status(&self, id: ListId, status: ListStatus) {
        let mut inner = self.inner.lock().expect("notifier mutex poisoned");
        inner.status[id.index()] = status;
        emit(&mut inner, id);
    }

    /// Forwards a transition set produced under the store lock.
    pub fn apply(&self, transitions: &Transitions) {
        for &(id, status) in transitions {
            self.set_status(id, status);
        }
    }

    /// Drops the subscriber, if any. Used at teardown.
    pub fn close_subscriber(&self) {
        let mut inner = self.inner.lock().expect("notifier mutex poisoned");
        if let Some(stream) = inner.subscriber.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn emit(inner: &mut NotifyInner, id: ListId) {
    let status = inner.status[id.index()];
    if inner.last_sent[id.index()] == Some(status) {
        return;
    }
    let Some(stream) = inner.subscriber.as_mut() else {
        return;
    };
    let line = format!("LIST{}:{}\n", id.number(), status.as_str());
    match stream.write_all(line.as_bytes()) {
        Ok(()) => inner.last_sent[id.index()] = Some(status),
        Err(e) => {
            debug!(error = %e, "notify send failed, dropping subscriber");
            inner.subscriber = None;
        }
    }
}

/// Binds the notification port and spawns the accept loop. Returns the
/// bound address (useful when the port was 0).
pub fn spawn_listener(
    notifier: Arc<Notifier>,
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
) -> io::Result<(thread::JoinHandle<()>, SocketAddr)> {
    let mut listener = mio::net::TcpListener::bind(addr)?;
    let local = listener.local_addr()?;
    let poll = Poll::new()?;
    poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

    let handle = thread::Builder::new()
        .name("awg-notify".into())
        .spawn(move || accept_loop(listener, poll, &notifier, &stop))?;
    Ok((handle, local))
}

fn accept_loop(
    listener: mio::net::TcpListener,
    mut poll: Poll,
    notifier: &Notifier,
    stop: &AtomicBool,
) {
    let mut events = Events::with_capacity(4);
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_CAP)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "notify poll failed");
            break;
        }
        if events.is_empty() {
            continue;
        }
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    info!(%peer, "notify subscriber connected");
                    match into_blocking(stream) {
                        Ok(stream) => notifier.attach(stream),
                        Err(e) => warn!(error = %e, "couldn't adopt notify subscriber"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "notify accept failed");
                    break;
                }
            }
        }
    }
    debug!("notify accept loop finished");
}

/// The subscriber only ever receives short one-shot writes, done under the
/// notifier mutex, so it lives as a plain blocking socket outside the poll.
fn into_blocking(stream: mio::net::TcpStream) -> io::Result<TcpStream> {
    use std::os::fd::{FromRawFd, IntoRawFd};
    let stream = unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) };
    stream.set_nonblocking(false)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader},
        net::TcpListener,
    };

    use super::*;

    fn pair() -> (TcpStream, BufReader<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        (server_side, BufReader::new(client))
    }

    fn next_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }

    #[test]
    fn attach_emits_both_lists() {
        let notifier = Notifier::new();
        let (server, mut client) = pair();
        notifier.attach(server);
        assert_eq!(next_line(&mut client), "LIST0:IDLE\n");
        assert_eq!(next_line(&mut client), "LIST1:IDLE\n");
    }

    #[test]
    fn emission_is_edge_triggered() {
        let notifier = Notifier::new();
        let (server, mut client) = pair();
        notifier.attach(server);
        next_line(&mut client);
        next_line(&mut client);

        notifier.set_status(ListId::L0, ListStatus::Loading);
        // Same value again: no line.
        notifier.set_status(ListId::L0, ListStatus::Loading);
        notifier.set_status(ListId::L0, ListStatus::Ready);
        assert_eq!(next_line(&mut client), "LIST0:LOADING\n");
        assert_eq!(next_line(&mut client), "LIST0:READY\n");
    }

    #[test]
    fn silent_accumulation_without_subscriber() {
        let notifier = Notifier::new();
        // No subscriber: updates must not error or block.
        notifier.set_status(ListId::L1, ListStatus::Loading);
        notifier.set_status(ListId::L1, ListStatus::Ready);

        let (server, mut client) = pair();
        notifier.attach(server);
        assert_eq!(next_line(&mut client), "LIST0:IDLE\n");
        assert_eq!(next_line(&mut client), "LIST1:READY\n");
    }

    #[test]
    fn new_subscriber_supersedes_old() {
        let notifier = Notifier::new();
        let (first_server, mut first_client) = pair();
        notifier.attach(first_server);
        next_line(&mut first_client);
        next_line(&mut first_client);

        let (second_server, mut second_client) = pair();
        notifier.attach(second_server);
        assert_eq!(next_line(&mut second_client), "LIST0:IDLE\n");
        // The first subscriber sees EOF.
        assert_eq!(next_line(&mut first_client), "");
    }
}
