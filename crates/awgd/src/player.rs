//! Periodic dispatch thread.
//!
//! One frame per tick, paced by absolute monotonic deadlines so transient
//! stalls compress the following intervals instead of drifting the cadence
//! forever. The player owns the hardware bus; nothing else writes to it
//! while the daemon runs.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use awg_mmio::AwgBus;
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::{
    notify::Notifier,
    store::{FrameBuf, Store},
    thread::{ThreadPriority, thread_boot},
};

#[derive(Clone, Copy, Debug)]
pub struct PlayerConfig {
    pub period: Duration,
    pub core: Option<usize>,
    pub priority: ThreadPriority,
}

/// Handle to the running player. Stopping joins the thread and hands the
/// bus back so teardown can zero the hardware.
pub struct PlayerHandle<B: AwgBus + 'static> {
    handle: thread::JoinHandle<B>,
    stop: Arc<AtomicBool>,
}

impl<B: AwgBus + 'static> PlayerHandle<B> {
    pub fn stop(self) -> B {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().expect("player thread panicked")
    }
}

pub fn spawn<B: AwgBus + 'static>(
    bus: B,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    direct_rx: Receiver<FrameBuf>,
    cfg: PlayerConfig,
) -> PlayerHandle<B> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let handle = thread::Builder::new()
        .name("awg-player".into())
        .spawn(move || run(bus, &store, &notifier, &direct_rx, cfg, &thread_stop))
        .expect("couldn't spawn player thread");
    PlayerHandle { handle, stop }
}

fn run<B: AwgBus>(
    mut bus: B,
    store: &Store,
    notifier: &Notifier,
    direct_rx: &Receiver<FrameBuf>,
    cfg: PlayerConfig,
    stop: &AtomicBool,
) -> B {
    thread_boot(cfg.core, cfg.priority);
    info!(period_us = cfg.period.as_micros() as u64, "player started");

    let mut deadline = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        deadline += cfg.period;
        let now = Instant::now();
        if now > deadline + cfg.period {
            // More than a full tick behind: drop the missed ticks and stay
            // on the original grid rather than bursting to catch up.
            let skip = ((now - deadline).as_nanos() / cfg.period.as_nanos()) as u32;
            deadline += cfg.period * skip;
            debug!(skipped = skip, "missed ticks dropped");
        }
        thread::sleep(deadline.saturating_duration_since(now));

        // Direct-port frames bypass the store and go out at the head of
        // the tick, verbatim.
        if let Ok(frame) = direct_rx.try_recv() {
            if let Err(e) = bus.send_words(frame.words()) {
                warn!(error = %e, "direct dispatch failed");
            }
        }

        let (frame, transitions) = store.tick();
        notifier.apply(&transitions);
        if let Some(frame) = frame {
            if let Err(e) = bus.send_words(frame.words()) {
                // The waveform is time-indexed; re-emitting a stale frame
                // would stutter, so errors skip to the next tick.
                warn!(error = %e, "frame dispatch failed");
            }
        }
    }

    info!("player stopped");
    bus
}
