//! `/dev/mem` AXI-GPIO backend.
//!
//! Two single-page mappings: one for the 32-bit data bus GPIO, one for the
//! WEN strobe GPIO. Each word write is a volatile store to the data
//! register followed by a fenced WEN pulse that latches it into the fabric.

use std::{
    io,
    ptr,
    sync::atomic::{AtomicBool, Ordering, fence},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{AwgBus, MmioError};

// Zynq PL defaults; override via the daemon's --data-addr / --wen-addr.
const DEFAULT_DATA_ADDR: u64 = 0x4120_0000;
const DEFAULT_WEN_ADDR: u64 = 0x4121_0000;

static BUS_OPEN: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Copy, Debug)]
pub struct MmioConfig {
    /// Physical address of the data-bus GPIO register.
    pub data_addr: u64,
    /// Physical address of the WEN GPIO register.
    pub wen_addr: u64,
    /// WEN polarity. The strobe toggles idle -> active -> idle per word.
    pub wen_active_high: bool,
    /// Busy-wait between the WEN edges. `None` means edge-only, the
    /// default: the AXI round trip itself is enough settle time.
    pub pulse: Option<Duration>,
}

impl Default for MmioConfig {
    fn default() -> Self {
        Self {
            data_addr: DEFAULT_DATA_ADDR,
            wen_addr: DEFAULT_WEN_ADDR,
            wen_active_high: true,
            pulse: None,
        }
    }
}

struct Mapping {
    base: *mut libc::c_void,
    len: usize,
    reg: *mut u32,
}

impl Mapping {
    fn map(fd: libc::c_int, region: &'static str, addr: u64) -> Result<Self, MmioError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let page_base = addr & !(page - 1);
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                page as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                page_base as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MmioError::Map { region, addr, source: io::Error::last_os_error() });
        }
        let reg = unsafe { base.cast::<u8>().add((addr - page_base) as usize) }.cast::<u32>();
        Ok(Self { base, len: page as usize, reg })
    }

    #[inline(always)]
    fn write(&self, value: u32) {
        unsafe { ptr::write_volatile(self.reg, value) };
        fence(Ordering::SeqCst);
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base, self.len) };
    }
}

/// Memory-mapped AWG bus. Single instance per process; `open` rejects a
/// second caller until the first handle is dropped.
pub struct MmioBus {
    data: Mapping,
    wen: Mapping,
    wen_active: u32,
    wen_idle: u32,
    pulse: Option<Duration>,
}

// The raw register pointers are only ever touched through the owning
// handle, which moves into exactly one thread.
unsafe impl Send for MmioBus {}

impl MmioBus {
    pub fn open(cfg: MmioConfig) -> Result<Self, MmioError> {
        if BUS_OPEN.swap(true, Ordering::SeqCst) {
            return Err(MmioError::AlreadyOpen);
        }
        match Self::open_inner(cfg) {
            Ok(bus) => Ok(bus),
            Err(e) => {
                BUS_OPEN.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn open_inner(cfg: MmioConfig) -> Result<Self, MmioError> {
        let fd = unsafe { libc::open(c"/dev/mem".as_ptr(), libc::O_RDWR | libc::O_SYNC) };
        if fd < 0 {
            return Err(MmioError::Open(io::Error::last_os_error()));
        }

        let mapped = Mapping::map(fd, "data", cfg.data_addr)
            .and_then(|data| Mapping::map(fd, "wen", cfg.wen_addr).map(|wen| (data, wen)));
        // The mappings outlive the descriptor.
        unsafe { libc::close(fd) };
        let (data, wen) = mapped?;

        let (wen_active, wen_idle) = if cfg.wen_active_high { (1, 0) } else { (0, 1) };
        wen.write(wen_idle);
        debug!(data_addr = cfg.data_addr, wen_addr = cfg.wen_addr, "AWG bus mapped");

        Ok(Self { data, wen, wen_active, wen_idle, pulse: cfg.pulse })
    }

    #[inline]
    fn hold_pulse(&self) {
        if let Some(width) = self.pulse {
            let until = Instant::now() + width;
            while Instant::now() < until {
                std::hint::spin_loop();
            }
        }
    }
}

impl AwgBus for MmioBus {
    fn send_words(&mut self, words: &[u32]) -> io::Result<()> {
        for &word in words {
            self.data.write(word);
            self.wen.write(self.wen_active);
            self.hold_pulse();
            self.wen.write(self.wen_idle);
        }
        Ok(())
    }
}

impl Drop for MmioBus {
    fn drop(&mut self) {
        self.wen.write(self.wen_idle);
        BUS_OPEN.store(false, Ordering::SeqCst);
    }
}
