//! Silence priming at startup, reset, and shutdown.
//!
//! Rather than poking the hardware directly, the sequencer loads synthetic
//! all-silence lists and lets the player drain them, so the bus keeps a
//! single writer and the zero output is proven through the same path real
//! frames take.

use std::{sync::Arc, time::Duration};

use awg_words::silence_frame;
use tracing::{info, warn};

use crate::{
    notify::Notifier,
    store::{ListId, Store},
};

#[derive(Clone)]
pub struct Sequencer {
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    /// Silence frames loaded per list.
    copies: u32,
    period: Duration,
}

impl Sequencer {
    pub fn new(store: Arc<Store>, notifier: Arc<Notifier>, copies: u32, period: Duration) -> Self {
        Self { store, notifier, copies: copies.max(1), period }
    }

    fn drain_budget(&self) -> Duration {
        // One tick per frame plus slack for scheduler noise.
        self.period * self.copies + Duration::from_secs(1)
    }

    /// Plays the silence list through L0, then L1. Each list's IDLE
    /// transition is emitted by the player when its drain completes, so a
    /// subscriber that sees IDLE knows the hardware has gone quiet.
    pub fn prime(&self) {
        let silence = silence_frame();
        for id in ListId::BOTH {
            let transitions = self.store.load_synthetic(id, &silence, self.copies);
            self.notifier.apply(&transitions);
            if !self.store.wait_drained(self.drain_budget()) {
                warn!(list = %id, "silence drain timed out");
                // Leave a sane store behind even if the player is wedged.
                self.store.halt_and_clear();
            }
        }
    }

    /// RESET: stop playback and free both lists without telling the
    /// subscriber, then prime. The terminal IDLE lines come out of the
    /// drain itself and therefore never precede it.
    pub fn reset(&self) {
        self.store.halt_and_clear();
        self.prime();
        info!("reset complete, output silenced");
    }
}
