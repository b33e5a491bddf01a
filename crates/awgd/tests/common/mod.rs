//! Shared rig for the end-to-end tests: real servers on loopback ports, a
//! recording bus instead of hardware.

#![allow(dead_code)]

use std::{
    io::{self, BufRead, BufReader, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use awg_mmio::AwgBus;
use awgd::{
    direct,
    notify::{self, Notifier},
    player::{self, PlayerConfig, PlayerHandle},
    preload,
    sequencer::Sequencer,
    store::Store,
    thread::ThreadPriority,
};

pub struct RecordingBus {
    frames: Arc<Mutex<Vec<Vec<u32>>>>,
}

impl AwgBus for RecordingBus {
    fn send_words(&mut self, words: &[u32]) -> io::Result<()> {
        self.frames.lock().unwrap().push(words.to_vec());
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub struct RigOptions {
    pub period: Duration,
    pub prime_frames: u32,
    pub read_timeout: Duration,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1),
            prime_frames: 3,
            read_timeout: Duration::from_secs(2),
        }
    }
}

pub struct Rig {
    pub store: Arc<Store>,
    pub notifier: Arc<Notifier>,
    pub sequencer: Sequencer,
    pub queue_addr: SocketAddr,
    pub notify_addr: SocketAddr,
    pub direct_addr: SocketAddr,
    frames: Arc<Mutex<Vec<Vec<u32>>>>,
    stop: Arc<AtomicBool>,
    player: Option<PlayerHandle<RecordingBus>>,
    threads: Vec<JoinHandle<()>>,
}

pub fn rig() -> Rig {
    rig_with(RigOptions::default())
}

pub fn rig_with(opts: RigOptions) -> Rig {
    let store = Arc::new(Store::new());
    let notifier = Arc::new(Notifier::new());
    let frames = Arc::new(Mutex::new(Vec::new()));
    let stop = Arc::new(AtomicBool::new(false));
    let (direct_tx, direct_rx) = crossbeam_channel::bounded(1);

    let player = player::spawn(
        RecordingBus { frames: frames.clone() },
        store.clone(),
        notifier.clone(),
        direct_rx,
        PlayerConfig { period: opts.period, core: None, priority: ThreadPriority::OsDefault },
    );
    let sequencer = Sequencer::new(store.clone(), notifier.clone(), opts.prime_frames, opts.period);

    let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (notify_thread, notify_addr) =
        notify::spawn_listener(notifier.clone(), loopback, stop.clone()).unwrap();
    let (queue_thread, queue_addr) = preload::spawn(
        loopback,
        opts.read_timeout,
        store.clone(),
        notifier.clone(),
        sequencer.clone(),
        stop.clone(),
    )
    .unwrap();
    let (direct_thread, direct_addr) =
        direct::spawn(loopback, opts.read_timeout, direct_tx, stop.clone()).unwrap();

    Rig {
        store,
        notifier,
        sequencer,
        queue_addr,
        notify_addr,
        direct_addr,
        frames,
        stop,
        player: Some(player),
        threads: vec![notify_thread, queue_thread, direct_thread],
    }
}

impl Rig {
    pub fn recorded(&self) -> Vec<Vec<u32>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        if let Some(player) = self.player.take() {
            let _bus = player.stop();
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        // Belt and braces for tests that panic before shutdown().
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Queue-port client speaking the preload opcodes.
pub struct QueueClient {
    pub stream: TcpStream,
}

impl QueueClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_nodelay(true).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self { stream }
    }

    pub fn begin(&mut self, list: u8, total: u32) {
        let mut bytes = vec![b'B', list];
        bytes.extend_from_slice(&total.to_be_bytes());
        self.send_raw(&bytes);
    }

    pub fn push(&mut self, list: u8, words: &[u32]) {
        let mut bytes = vec![b'P', list];
        bytes.extend_from_slice(&(words.len() as u16).to_be_bytes());
        for word in words {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        self.send_raw(&bytes);
    }

    pub fn end(&mut self, list: u8) {
        self.send_raw(&[b'E', list]);
    }

    pub fn reset(&mut self) {
        self.send_raw(&[b'Z']);
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Blocks until the server closes the connection (or errors out),
    /// which is how every protocol violation surfaces to the client.
    pub fn expect_disconnect(&mut self) {
        let mut scratch = [0u8; 16];
        loop {
            match io::Read::read(&mut self.stream, &mut scratch) {
                Ok(0) => return,
                Ok(_) => {}
                Err(_) => return,
            }
        }
    }
}

/// Notification-port subscriber.
pub struct Subscriber {
    reader: BufReader<TcpStream>,
}

impl Subscriber {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self { reader: BufReader::new(stream) }
    }

    /// Next status line, without the newline. Empty string on EOF.
    pub fn next_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end().to_string()
    }
}

/// Polls `cond` until it holds, panicking with `what` after 5 seconds.
pub fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}
