//! Scheduling setup for the dispatch thread.

use core_affinity::CoreId;
#[cfg(target_os = "linux")]
use libc::{SCHED_FIFO, sched_param, sched_setscheduler};
use tracing::warn;

/// Scheduling class for the player. `Fifo` requests `SCHED_FIFO` realtime
/// scheduling, which needs CAP_SYS_NICE; if the request fails the thread
/// keeps running under the OS default (CFS) with softer tick timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadPriority {
    OsDefault,
    Fifo(i32),
}

impl ThreadPriority {
    /// CLI form: `none`, or a SCHED_FIFO priority in `1..=99`.
    pub fn parse(arg: &str) -> Result<Self, String> {
        if arg.eq_ignore_ascii_case("none") {
            return Ok(ThreadPriority::OsDefault);
        }
        match arg.parse::<i32>() {
            Ok(prio) if (1..=99).contains(&prio) => Ok(ThreadPriority::Fifo(prio)),
            _ => Err(format!("expected \"none\" or a priority in 1..=99, got {arg:?}")),
        }
    }
}

#[cfg(target_os = "linux")]
fn set_thread_prio(prio: ThreadPriority) {
    let ThreadPriority::Fifo(sched_priority) = prio else {
        return;
    };
    let param = sched_param { sched_priority };
    unsafe {
        let code = sched_setscheduler(0, SCHED_FIFO, &param);
        if code != 0 {
            warn!(%code, ?param, "couldn't set thread priority");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_prio(prio: ThreadPriority) {
    if !matches!(prio, ThreadPriority::OsDefault) {
        warn!(?prio, "thread priority setting only supported on linux");
    }
}

fn set_thread_affinity(core: usize) {
    if !core_affinity::set_for_current(CoreId { id: core }) {
        warn!(?core, "couldn't set core affinity");
    }
}

pub fn thread_boot(core: Option<usize>, prio: ThreadPriority) {
    if let Some(core) = core {
        set_thread_affinity(core);
    }

    set_thread_prio(prio);
}
