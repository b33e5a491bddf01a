//! Command-line configuration.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use awg_mmio::MmioConfig;
use clap::Parser;

use crate::{player::PlayerConfig, thread::ThreadPriority};

#[derive(Clone, Debug, Parser)]
#[command(name = "awgd", version, about = "Streaming control plane for the 2x8-tone AWG fabric")]
pub struct Config {
    /// Address all three listeners bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Preload/queue protocol port.
    #[arg(long, default_value_t = 9100)]
    pub queue_port: u16,

    /// Status notification port.
    #[arg(long, default_value_t = 9101)]
    pub notify_port: u16,

    /// Direct (unbuffered) frame port.
    #[arg(long, default_value_t = 9000)]
    pub direct_port: u16,

    /// Player tick period in microseconds.
    #[arg(long, default_value_t = 1000)]
    pub period_us: u64,

    /// Preload/direct connections are dropped after this much silence.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub read_timeout: Duration,

    /// Silence frames played into each list at startup, reset and shutdown.
    #[arg(long, default_value_t = 100)]
    pub prime_frames: u32,

    /// Pin the player thread to this core.
    #[arg(long)]
    pub player_core: Option<usize>,

    /// SCHED_FIFO priority for the player: "none" or 1..=99.
    #[arg(long, value_parser = ThreadPriority::parse, default_value = "75")]
    pub rt_priority: ThreadPriority,

    /// Physical address of the data-bus GPIO block.
    #[arg(long, value_parser = parse_phys_addr, default_value = "0x41200000")]
    pub data_addr: u64,

    /// Physical address of the WEN GPIO block.
    #[arg(long, value_parser = parse_phys_addr, default_value = "0x41210000")]
    pub wen_addr: u64,

    /// WEN idles high and strobes low instead of the default active-high.
    #[arg(long)]
    pub wen_active_low: bool,

    /// Hold time between the WEN edges; omit for edge-only strobing.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub wen_pulse: Option<Duration>,
}

fn parse_phys_addr(arg: &str) -> Result<u64, String> {
    let parsed = arg
        .strip_prefix("0x")
        .or_else(|| arg.strip_prefix("0X"))
        .map_or_else(|| arg.parse::<u64>(), |hex| u64::from_str_radix(hex, 16));
    parsed.map_err(|e| format!("bad physical address {arg:?}: {e}"))
}

impl Config {
    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us.max(1))
    }

    pub fn queue_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.queue_port)
    }

    pub fn notify_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.notify_port)
    }

    pub fn direct_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.direct_port)
    }

    pub fn mmio(&self) -> MmioConfig {
        MmioConfig {
            data_addr: self.data_addr,
            wen_addr: self.wen_addr,
            wen_active_high: !self.wen_active_low,
            pulse: self.wen_pulse,
        }
    }

    pub fn player(&self) -> PlayerConfig {
        PlayerConfig {
            period: self.period(),
            core: self.player_core,
            priority: self.rt_priority,
        }
    }
}
