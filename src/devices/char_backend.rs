//! Host character streams behind a stream bridge device

use std::io::Write;

use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Sink for bytes the guest writes. Writes never block the guest.
pub trait CharBackend {
    /// Forward `data` to the host side
    fn write(&mut self, data: &[u8]);
}

/// Forwards guest output to a tokio channel, dropping bytes when it is full
pub struct ChannelBackend {
    output_tx: mpsc::Sender<u8>,
    dropped: u64,
}

impl ChannelBackend {
    pub fn new(output_tx: mpsc::Sender<u8>) -> Self {
        Self {
            output_tx,
            dropped: 0,
        }
    }

    /// Bytes lost because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl CharBackend for ChannelBackend {
    fn write(&mut self, data: &[u8]) {
        for &byte in data {
            if self.output_tx.try_send(byte).is_err() {
                self.dropped += 1;
            }
        }
        trace!("stream bridge TX {} bytes", data.len());
    }
}

/// Forwards guest output to any `Write` (a file, a pty, stdout)
pub struct StreamBackend<W: Write> {
    inner: W,
}

impl<W: Write> StreamBackend<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> CharBackend for StreamBackend<W> {
    fn write(&mut self, data: &[u8]) {
        if let Err(e) = self.inner.write_all(data).and_then(|_| self.inner.flush()) {
            warn!("stream bridge output dropped {} bytes: {}", data.len(), e);
        }
    }
}
