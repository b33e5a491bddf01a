mod mmap;

use std::io;

pub use mmap::{MmioBus, MmioConfig};
use thiserror::Error;

/// The write side of the AWG hardware.
///
/// One owner at a time: the handle is created at startup and moved into
/// the player thread, which is the only caller during normal operation.
pub trait AwgBus: Send {
    /// Writes each word to the data register and latches it with a WEN
    /// pulse. Word order is preserved exactly.
    fn send_words(&mut self, words: &[u32]) -> io::Result<()>;

    /// Drives every (channel, tone) gain to zero and commits.
    fn zero_all(&mut self) -> io::Result<()> {
        self.send_words(&awg_words::silence_frame())
    }
}

#[derive(Debug, Error)]
pub enum MmioError {
    #[error("couldn't open /dev/mem: {0}")]
    Open(#[source] io::Error),
    #[error("couldn't map {region} region at {addr:#010x}: {source}")]
    Map {
        region: &'static str,
        addr: u64,
        #[source]
        source: io::Error,
    },
    #[error("AWG bus is already open in this process")]
    AlreadyOpen,
}
