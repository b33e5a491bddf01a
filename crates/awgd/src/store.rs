//! Double-buffered playlist store.
//!
//! Two fixed lists ping-pong between the preloader and the player. Every
//! field lives under one mutex; state transitions are returned to the
//! caller as a [`Transitions`] set and must be forwarded to the notifier
//! only after the lock is released.

use std::{
    fmt,
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};

use awg_words::MAX_WORDS_PER_FRAME;
use thiserror::Error;

/// Words the flat buffer grows by when a push would overflow.
const GROW_STEP: usize = 4096;
/// Upper bound a BEGIN may declare.
pub const MAX_TOTAL_FRAMES: u32 = 2_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListId {
    L0,
    L1,
}

impl ListId {
    pub const BOTH: [ListId; 2] = [ListId::L0, ListId::L1];

    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ListId::L0),
            1 => Some(ListId::L1),
            _ => None,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn number(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn other(self) -> Self {
        match self {
            ListId::L0 => ListId::L1,
            ListId::L1 => ListId::L0,
        }
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.number())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListStatus {
    #[default]
    Idle,
    Loading,
    Ready,
}

impl ListStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ListStatus::Idle => "IDLE",
            ListStatus::Loading => "LOADING",
            ListStatus::Ready => "READY",
        }
    }
}

/// `(list, new status)` pairs produced under the store lock. Callers hand
/// them to the notifier after releasing it, which keeps the store mutex
/// ordered strictly before the notifier mutex.
pub type Transitions = Vec<(ListId, ListStatus)>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("total_frames {0} out of range (1..={MAX_TOTAL_FRAMES})")]
    BadTotal(u32),
    #[error("frame word count {0} out of range (1..={MAX_WORDS_PER_FRAME})")]
    BadCount(usize),
    #[error("list is currently playing")]
    ListPlaying,
    #[error("list is not loading")]
    NotLoading,
    #[error("cannot finalize an empty list")]
    EmptyList,
    #[error("out of memory growing list buffers")]
    OutOfMemory,
}

/// One frame copied out of a list for dispatch. Small enough (256 bytes)
/// that taking it by value under the lock is cheaper than holding any
/// reference into the growable buffer across the unlock.
#[derive(Clone, Copy)]
pub struct FrameBuf {
    words: [u32; MAX_WORDS_PER_FRAME],
    len: u16,
}

impl FrameBuf {
    pub fn new(frame: &[u32]) -> Self {
        debug_assert!(!frame.is_empty() && frame.len() <= MAX_WORDS_PER_FRAME);
        let mut words = [0u32; MAX_WORDS_PER_FRAME];
        words[..frame.len()].copy_from_slice(frame);
        Self { words, len: frame.len() as u16 }
    }

    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words[..self.len as usize]
    }
}

impl fmt::Debug for FrameBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameBuf({} words)", self.len)
    }
}

/// Dispatch counters, logged at shutdown.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub frames_pushed: u64,
    pub bytes_rx: u64,
    pub switches: u64,
    pub holds: u64,
    pub resets: u64,
}

#[derive(Default)]
struct Playlist {
    status: ListStatus,
    total_frames: u32,
    loaded_frames: u32,
    words: Vec<u32>,
    offsets: Vec<u32>,
    counts: Vec<u16>,
}

impl Playlist {
    /// Frees all buffers and returns the list to IDLE.
    fn clear(&mut self) {
        *self = Playlist::default();
    }

    fn reserve_frames(&mut self, total: u32) -> Result<(), StoreError> {
        self.offsets
            .try_reserve_exact(total as usize)
            .and_then(|()| self.counts.try_reserve_exact(total as usize))
            .map_err(|_| StoreError::OutOfMemory)
    }

    /// Grows `words` in `GROW_STEP` chunks until `need` more fit.
    fn reserve_words(&mut self, need: usize) -> Result<(), StoreError> {
        let want = self.words.len() + need;
        if want <= self.words.capacity() {
            return Ok(());
        }
        let mut cap = self.words.capacity().max(GROW_STEP);
        while cap < want {
            cap += GROW_STEP;
        }
        self.words.try_reserve_exact(cap - self.words.len()).map_err(|_| StoreError::OutOfMemory)
    }

    fn push(&mut self, frame: &[u32]) {
        self.offsets.push(self.words.len() as u32);
        self.counts.push(frame.len() as u16);
        self.words.extend_from_slice(frame);
        self.loaded_frames += 1;
    }

    fn frame(&self, at: u32) -> &[u32] {
        let off = self.offsets[at as usize] as usize;
        let count = self.counts[at as usize] as usize;
        &self.words[off..off + count]
    }
}

struct StoreInner {
    lists: [Playlist; 2],
    playing: bool,
    /// Slot the player is (or was last) drawing from; the other is `next`.
    cur: ListId,
    cur_frame: u32,
    stats: Stats,
}

impl StoreInner {
    /// Auto-start rule: the first list to become READY while the player is
    /// idle becomes current.
    fn maybe_auto_start(&mut self, id: ListId) {
        if !self.playing {
            self.cur = id;
            self.cur_frame = 0;
            self.playing = true;
        }
    }
}

pub struct Store {
    inner: Mutex<StoreInner>,
    /// Signalled whenever playback drains to a stop.
    drained: Condvar,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                lists: [Playlist::default(), Playlist::default()],
                playing: false,
                cur: ListId::L0,
                cur_frame: 0,
                stats: Stats::default(),
            }),
            drained: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store mutex poisoned")
    }

    /// BEGIN: frees any prior contents and stages metadata for `total`
    /// frames. Targeting the currently playing list is rejected; preload
    /// must never overlap play.
    pub fn begin(&self, id: ListId, total: u32) -> Result<Transitions, StoreError> {
        if total == 0 || total > MAX_TOTAL_FRAMES {
            return Err(StoreError::BadTotal(total));
        }
        let mut inner = self.lock();
        if inner.playing && inner.cur == id {
            return Err(StoreError::ListPlaying);
        }
        let list = &mut inner.lists[id.index()];
        list.clear();
        list.reserve_frames(total)?;
        list.total_frames = total;
        list.status = ListStatus::Loading;
        Ok(vec![(id, ListStatus::Loading)])
    }

    /// PUSH: appends one frame. Reaching the declared total auto-promotes
    /// the list to READY and may auto-start the player.
    pub fn push(&self, id: ListId, frame: &[u32]) -> Result<Transitions, StoreError> {
        if frame.is_empty() || frame.len() > MAX_WORDS_PER_FRAME {
            return Err(StoreError::BadCount(frame.len()));
        }
        let mut inner = self.lock();
        let list = &mut inner.lists[id.index()];
        if list.status != ListStatus::Loading {
            return Err(StoreError::NotLoading);
        }
        list.reserve_words(frame.len())?;
        list.push(frame);
        let full = list.loaded_frames == list.total_frames;
        inner.stats.frames_pushed += 1;
        inner.stats.bytes_rx += 3 + 4 * frame.len() as u64;
        if full {
            inner.lists[id.index()].status = ListStatus::Ready;
            inner.maybe_auto_start(id);
            return Ok(vec![(id, ListStatus::Ready)]);
        }
        Ok(Transitions::new())
    }

    /// END: promotes a partially loaded list to READY. Empty lists are
    /// rejected.
    pub fn end(&self, id: ListId) -> Result<Transitions, StoreError> {
        let mut inner = self.lock();
        let list = &mut inner.lists[id.index()];
        if list.status != ListStatus::Loading {
            return Err(StoreError::NotLoading);
        }
        if list.loaded_frames == 0 {
            return Err(StoreError::EmptyList);
        }
        list.status = ListStatus::Ready;
        inner.maybe_auto_start(id);
        Ok(vec![(id, ListStatus::Ready)])
    }

    /// Cancels any list still LOADING (client dropped mid-preload).
    pub fn cancel_loading(&self) -> Transitions {
        let mut inner = self.lock();
        let mut transitions = Transitions::new();
        for id in ListId::BOTH {
            if inner.lists[id.index()].status == ListStatus::Loading {
                inner.lists[id.index()].clear();
                transitions.push((id, ListStatus::Idle));
            }
        }
        transitions
    }

    /// RESET first half: stops playback and frees both lists without
    /// reporting transitions. The IDLE lines are owed to the subscriber
    /// only after the safety drain, which the sequencer produces through
    /// the ordinary play-out path.
    pub fn halt_and_clear(&self) {
        let mut inner = self.lock();
        inner.playing = false;
        inner.cur = ListId::L0;
        inner.cur_frame = 0;
        inner.stats.resets += 1;
        for list in &mut inner.lists {
            list.clear();
        }
        self.drained.notify_all();
    }

    /// Installs `copies` repetitions of `frame` as a synthetic READY list.
    /// Used by the safety sequencer; the target list must not be playing.
    pub fn load_synthetic(&self, id: ListId, frame: &[u32], copies: u32) -> Transitions {
        let mut inner = self.lock();
        debug_assert!(!(inner.playing && inner.cur == id));
        let list = &mut inner.lists[id.index()];
        list.clear();
        list.total_frames = copies;
        list.offsets.reserve_exact(copies as usize);
        list.counts.reserve_exact(copies as usize);
        list.words.reserve_exact(frame.len() * copies as usize);
        for _ in 0..copies {
            list.push(frame);
        }
        list.status = ListStatus::Ready;
        inner.maybe_auto_start(id);
        vec![(id, ListStatus::Ready)]
    }

    /// One player tick. Handles end-of-list (seam-free switch or stop) and
    /// hands back the frame to dispatch, already copied out of the store.
    pub fn tick(&self) -> (Option<FrameBuf>, Transitions) {
        let mut transitions = Transitions::new();
        let mut inner = self.lock();
        if !inner.playing {
            return (None, transitions);
        }
        if inner.cur_frame >= inner.lists[inner.cur.index()].loaded_frames {
            let finished = inner.cur;
            let next = finished.other();
            let next_up = &inner.lists[next.index()];
            if next_up.status == ListStatus::Ready && next_up.loaded_frames > 0 {
                inner.cur = next;
                inner.cur_frame = 0;
                inner.lists[finished.index()].clear();
                inner.stats.switches += 1;
                transitions.push((finished, ListStatus::Idle));
            } else {
                inner.playing = false;
                inner.cur_frame = 0;
                inner.lists[finished.index()].clear();
                inner.stats.holds += 1;
                transitions.push((finished, ListStatus::Idle));
                self.drained.notify_all();
                return (None, transitions);
            }
        }
        let frame = FrameBuf::new(inner.lists[inner.cur.index()].frame(inner.cur_frame));
        inner.cur_frame += 1;
        (Some(frame), transitions)
    }

    /// Blocks until playback drains or `timeout` passes. Returns whether
    /// the drain was observed.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let (_inner, result) = self
            .drained
            .wait_timeout_while(inner, timeout, |inner| inner.playing)
            .expect("store mutex poisoned");
        !result.timed_out()
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    pub fn status(&self, id: ListId) -> ListStatus {
        self.lock().lists[id.index()].status
    }

    pub fn stats(&self) -> Stats {
        self.lock().stats
    }

    /// Checks the structural invariants that must hold whenever the lock
    /// is free.
    #[cfg(test)]
    fn assert_invariants(&self) {
        let inner = self.lock();
        for list in &inner.lists {
            assert!(list.loaded_frames <= list.total_frames);
            assert_eq!(list.offsets.len(), list.loaded_frames as usize);
            assert_eq!(list.counts.len(), list.loaded_frames as usize);
            for at in 0..list.loaded_frames as usize {
                let count = list.counts[at] as usize;
                assert!(count >= 1 && count <= MAX_WORDS_PER_FRAME);
                assert!(list.offsets[at] as usize + count <= list.words.len());
            }
            if list.status == ListStatus::Idle {
                assert_eq!(list.total_frames, 0);
                assert_eq!(list.loaded_frames, 0);
                assert!(list.words.is_empty());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u32, len: usize) -> Vec<u32> {
        (0..len as u32).map(|n| tag << 8 | n).collect()
    }

    #[test]
    fn begin_push_end_lifecycle() {
        let store = Store::new();
        assert_eq!(store.begin(ListId::L0, 2).unwrap(), vec![(ListId::L0, ListStatus::Loading)]);
        assert_eq!(store.push(ListId::L0, &frame(1, 3)).unwrap(), vec![]);
        store.assert_invariants();
        // Second push reaches the declared total: READY + auto-start.
        assert_eq!(
            store.push(ListId::L0, &frame(2, 3)).unwrap(),
            vec![(ListId::L0, ListStatus::Ready)]
        );
        assert!(store.is_playing());
        store.assert_invariants();
    }

    #[test]
    fn end_promotes_partial_list() {
        let store = Store::new();
        store.begin(ListId::L1, 10).unwrap();
        store.push(ListId::L1, &frame(1, 1)).unwrap();
        assert_eq!(store.end(ListId::L1).unwrap(), vec![(ListId::L1, ListStatus::Ready)]);
        assert!(store.is_playing());
    }

    #[test]
    fn end_rejects_empty_list() {
        let store = Store::new();
        store.begin(ListId::L0, 5).unwrap();
        assert_eq!(store.end(ListId::L0), Err(StoreError::EmptyList));
    }

    #[test]
    fn bounds_are_enforced() {
        let store = Store::new();
        assert_eq!(store.begin(ListId::L0, 0), Err(StoreError::BadTotal(0)));
        assert_eq!(
            store.begin(ListId::L0, MAX_TOTAL_FRAMES + 1),
            Err(StoreError::BadTotal(MAX_TOTAL_FRAMES + 1))
        );
        store.begin(ListId::L0, 1).unwrap();
        assert_eq!(store.push(ListId::L0, &[]), Err(StoreError::BadCount(0)));
        assert_eq!(store.push(ListId::L0, &frame(0, 65)), Err(StoreError::BadCount(65)));
        assert_eq!(ListId::from_wire(2), None);
    }

    #[test]
    fn push_outside_loading_rejected() {
        let store = Store::new();
        assert_eq!(store.push(ListId::L0, &frame(0, 1)), Err(StoreError::NotLoading));
        store.begin(ListId::L0, 1).unwrap();
        store.push(ListId::L0, &frame(0, 1)).unwrap();
        // READY now (and playing): further pushes bounce.
        assert_eq!(store.push(ListId::L0, &frame(0, 1)), Err(StoreError::NotLoading));
    }

    #[test]
    fn begin_on_ready_is_clear_plus_begin() {
        let store = Store::new();
        store.begin(ListId::L0, 1).unwrap();
        store.push(ListId::L0, &frame(0, 1)).unwrap();
        // L0 is READY and playing; L1 preloads and parks READY behind it.
        store.begin(ListId::L1, 1).unwrap();
        store.push(ListId::L1, &frame(1, 1)).unwrap();
        assert_eq!(store.status(ListId::L1), ListStatus::Ready);
        // Re-begin the parked READY list: fresh LOADING with zero frames.
        assert_eq!(store.begin(ListId::L1, 4).unwrap(), vec![(ListId::L1, ListStatus::Loading)]);
        assert_eq!(store.status(ListId::L1), ListStatus::Loading);
        store.assert_invariants();
    }

    #[test]
    fn begin_on_playing_list_rejected() {
        let store = Store::new();
        store.begin(ListId::L0, 1).unwrap();
        store.push(ListId::L0, &frame(0, 1)).unwrap();
        assert!(store.is_playing());
        assert_eq!(store.begin(ListId::L0, 1), Err(StoreError::ListPlaying));
    }

    #[test]
    fn tick_dispatches_in_push_order_and_stops() {
        let store = Store::new();
        store.begin(ListId::L0, 2).unwrap();
        store.push(ListId::L0, &frame(1, 2)).unwrap();
        store.push(ListId::L0, &frame(2, 2)).unwrap();

        let (first, t) = store.tick();
        assert!(t.is_empty());
        assert_eq!(first.unwrap().words(), frame(1, 2).as_slice());
        let (second, _) = store.tick();
        assert_eq!(second.unwrap().words(), frame(2, 2).as_slice());

        // End of list, nothing queued: stop and free.
        let (none, t) = store.tick();
        assert!(none.is_none());
        assert_eq!(t, vec![(ListId::L0, ListStatus::Idle)]);
        assert!(!store.is_playing());
        store.assert_invariants();
    }

    #[test]
    fn seamfree_switch_dispatches_same_tick() {
        let store = Store::new();
        store.begin(ListId::L0, 1).unwrap();
        store.push(ListId::L0, &frame(1, 1)).unwrap();
        store.begin(ListId::L1, 1).unwrap();
        store.push(ListId::L1, &frame(9, 1)).unwrap();

        let (f, _) = store.tick();
        assert_eq!(f.unwrap().words(), frame(1, 1).as_slice());
        // L0 exhausted, L1 READY: the same tick switches and dispatches.
        let (f, t) = store.tick();
        assert_eq!(t, vec![(ListId::L0, ListStatus::Idle)]);
        assert_eq!(f.unwrap().words(), frame(9, 1).as_slice());
        assert_eq!(store.status(ListId::L0), ListStatus::Idle);
        assert_eq!(store.stats().switches, 1);
    }

    #[test]
    fn cancel_clears_loading_only() {
        let store = Store::new();
        store.begin(ListId::L0, 3).unwrap();
        store.push(ListId::L0, &frame(0, 1)).unwrap();
        assert_eq!(store.cancel_loading(), vec![(ListId::L0, ListStatus::Idle)]);
        assert_eq!(store.status(ListId::L0), ListStatus::Idle);
        // Nothing loading: cancel is a no-op.
        assert_eq!(store.cancel_loading(), vec![]);
        store.assert_invariants();
    }

    #[test]
    fn halt_and_clear_resets_everything() {
        let store = Store::new();
        store.begin(ListId::L0, 1).unwrap();
        store.push(ListId::L0, &frame(0, 1)).unwrap();
        store.halt_and_clear();
        assert!(!store.is_playing());
        for id in ListId::BOTH {
            assert_eq!(store.status(id), ListStatus::Idle);
        }
        // Idempotent on observable state.
        store.halt_and_clear();
        assert!(!store.is_playing());
        store.assert_invariants();
    }

    #[test]
    fn synthetic_load_plays_n_copies() {
        let store = Store::new();
        let silence = awg_words::silence_frame();
        store.load_synthetic(ListId::L0, &silence, 3);
        assert!(store.is_playing());
        for _ in 0..3 {
            let (f, _) = store.tick();
            assert_eq!(f.unwrap().words(), silence.as_slice());
        }
        let (none, t) = store.tick();
        assert!(none.is_none());
        assert_eq!(t, vec![(ListId::L0, ListStatus::Idle)]);
    }

    #[test]
    fn growth_spans_many_chunks() {
        let store = Store::new();
        store.begin(ListId::L0, 200).unwrap();
        let big = frame(7, MAX_WORDS_PER_FRAME);
        for _ in 0..199 {
            store.push(ListId::L0, &big).unwrap();
        }
        store.assert_invariants();
        store.push(ListId::L0, &big).unwrap();
        assert_eq!(store.status(ListId::L0), ListStatus::Ready);
    }
}
