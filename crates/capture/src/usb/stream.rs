//! Bulk endpoint streams
//!
//! The IN endpoint is drained by a dedicated pump thread that keeps up to
//! `queue_depth` transfers in flight through a bounded channel, so the frame
//! reader never waits on libusb directly. The OUT endpoint is a plain
//! synchronous writer owned by the session.

use crate::error::{CaptureError, Result};
use crate::usb::catalog::Connection;
use async_channel::{Receiver, Sender, TryRecvError};
use std::io::{self, Read};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queued bulk read parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Bytes requested per bulk transfer
    pub transfer_size: usize,
    /// Completed transfers buffered ahead of the reader
    pub queue_depth: usize,
    /// Per-transfer timeout; bounds how long a close takes to be noticed
    pub poll_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            transfer_size: 4096,
            queue_depth: 5,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

type Chunk = io::Result<Vec<u8>>;

/// Open a queued read stream on `endpoint`
///
/// Returns the reading half and the handle used to close it.
pub fn open_bulk_stream(
    conn: Connection,
    endpoint: u8,
    settings: StreamSettings,
) -> Result<(BulkStream, StreamCloser)> {
    let (tx, rx) = async_channel::bounded::<Chunk>(settings.queue_depth.max(1));

    let pump_tx = tx.clone();
    let handle = thread::Builder::new()
        .name("bulk-in-pump".to_string())
        .spawn(move || run_pump(conn, endpoint, settings, pump_tx))?;

    debug!(
        "Opened bulk stream on {:#04x} (transfer size {}, queue depth {})",
        endpoint, settings.transfer_size, settings.queue_depth
    );

    let stream = BulkStream {
        rx: rx.clone(),
        pending: Vec::new(),
        pos: 0,
    };
    let closer = StreamCloser {
        tx,
        rx,
        handle: Some(handle),
    };
    Ok((stream, closer))
}

fn run_pump(conn: Connection, endpoint: u8, settings: StreamSettings, tx: Sender<Chunk>) {
    debug!("Bulk pump started on {:#04x}", endpoint);
    let mut buf = vec![0u8; settings.transfer_size];

    while !tx.is_closed() {
        match conn.read_bulk(endpoint, &mut buf, settings.poll_timeout) {
            Ok(0) => continue,
            Ok(n) => {
                if tx.send_blocking(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => continue,
            Err(e) => {
                if !tx.is_closed() {
                    warn!("Bulk read on {:#04x} failed: {}", endpoint, e);
                    let _ = tx.send_blocking(Err(io::Error::other(e)));
                }
                break;
            }
        }
    }

    tx.close();
    debug!("Bulk pump on {:#04x} stopped", endpoint);
}

/// Reading half of a bulk IN stream
///
/// Owned by exactly one reader. Reads block until a transfer completes and
/// fail once the stream is closed.
pub struct BulkStream {
    rx: Receiver<Chunk>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for BulkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos >= self.pending.len() {
            match self.rx.recv_blocking() {
                Ok(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "bulk stream closed",
                    ));
                }
            }
        }

        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Closes a bulk stream from outside the reader
pub struct StreamCloser {
    tx: Sender<Chunk>,
    rx: Receiver<Chunk>,
    handle: Option<JoinHandle<()>>,
}

impl StreamCloser {
    /// Whether the stream has already been closed, by either side
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the stream and wait for the pump to exit
    ///
    /// A pending read on the [`BulkStream`] fails once the queued transfers
    /// are dropped. Calling this again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.tx.close();

        let mut dropped = 0usize;
        loop {
            match self.rx.try_recv() {
                Ok(_) => dropped += 1,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if dropped > 0 {
            debug!("Dropped {} queued bulk transfers", dropped);
        }

        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| {
                CaptureError::Io(io::Error::other("bulk pump thread panicked"))
            })?;
            info!("Bulk stream closed");
        }
        Ok(())
    }
}

impl Drop for StreamCloser {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing bulk stream: {}", e);
        }
    }
}

/// Host to device bulk writer
pub struct BulkOut {
    conn: Connection,
    endpoint: u8,
    timeout: Duration,
}

impl BulkOut {
    pub fn new(conn: Connection, endpoint: u8) -> Self {
        Self {
            conn,
            endpoint,
            timeout: Duration::from_secs(1),
        }
    }

    /// Write `data` to the OUT endpoint, returning the bytes accepted
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        match self.conn.write_bulk(self.endpoint, data, self.timeout) {
            Ok(n) => {
                if n < data.len() {
                    warn!(
                        "Short bulk write on {:#04x}: {}/{} bytes",
                        self.endpoint,
                        n,
                        data.len()
                    );
                }
                Ok(n)
            }
            Err(e) => {
                warn!("Failed writing {} bytes to {:#04x}: {}", data.len(), self.endpoint, e);
                Err(CaptureError::usb("bulk write", e))
            }
        }
    }
}
