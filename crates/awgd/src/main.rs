use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use awg_mmio::{AwgBus, MmioBus};
use awgd::{
    config::Config,
    direct,
    notify::{self, Notifier},
    player,
    preload,
    sequencer::Sequencer,
    store::Store,
};
use clap::Parser;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag as signal_flag,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cfg = Config::parse();

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        if let Err(e) = signal_flag::register(signal, stop.clone()) {
            error!(signal, error = %e, "couldn't register signal handler");
            return ExitCode::FAILURE;
        }
    }
    // A panicking thread takes the whole process through graceful teardown.
    let panic_stop = stop.clone();
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        panic_stop.store(true, Ordering::Relaxed);
        default_hook(panic_info);
    }));

    // Fatal startup: without the hardware there is nothing to serve, so no
    // port gets bound.
    let bus = match MmioBus::open(cfg.mmio()) {
        Ok(bus) => bus,
        Err(e) => {
            error!(error = %e, "AWG bus init failed");
            return ExitCode::FAILURE;
        }
    };

    let store = Arc::new(Store::new());
    let notifier = Arc::new(Notifier::new());
    let (direct_tx, direct_rx) = crossbeam_channel::bounded(1);
    let player = player::spawn(bus, store.clone(), notifier.clone(), direct_rx, cfg.player());
    let sequencer = Sequencer::new(store.clone(), notifier.clone(), cfg.prime_frames, cfg.period());

    // Prime the output to zero before any client can reach us. This also
    // proves the dispatch pipeline is alive.
    sequencer.prime();

    let listeners = (|| {
        let (notify_thread, notify_addr) =
            notify::spawn_listener(notifier.clone(), cfg.notify_addr(), stop.clone())?;
        let (queue_thread, queue_addr) = preload::spawn(
            cfg.queue_addr(),
            cfg.read_timeout,
            store.clone(),
            notifier.clone(),
            sequencer.clone(),
            stop.clone(),
        )?;
        let (direct_thread, direct_addr) =
            direct::spawn(cfg.direct_addr(), cfg.read_timeout, direct_tx, stop.clone())?;
        info!(%queue_addr, %notify_addr, %direct_addr, "servers up");
        Ok::<_, std::io::Error>((notify_thread, queue_thread, direct_thread))
    })();
    let (notify_thread, queue_thread, direct_thread) = match listeners {
        Ok(threads) => threads,
        Err(e) => {
            error!(error = %e, "couldn't bind listeners");
            stop.store(true, Ordering::Relaxed);
            let mut bus = player.stop();
            let _ = bus.zero_all();
            return ExitCode::FAILURE;
        }
    };

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
    info!("stop signal received, shutting down");

    // Ingress first: the queue thread drains its in-flight client on the
    // way out, the direct thread closes its connections.
    let _ = queue_thread.join();
    let _ = direct_thread.join();

    // Final silence pass through the still-running player, then take the
    // bus back and zero the hardware one last time.
    sequencer.prime();
    let stats = store.stats();
    info!(
        frames_pushed = stats.frames_pushed,
        bytes_rx = stats.bytes_rx,
        switches = stats.switches,
        holds = stats.holds,
        resets = stats.resets,
        "dispatch totals"
    );
    let mut bus = player.stop();

    let _ = notify_thread.join();
    notifier.close_subscriber();

    if let Err(e) = bus.zero_all() {
        warn!(error = %e, "final zero_all failed");
    }
    drop(bus);
    info!("stopped");
    ExitCode::SUCCESS
}
