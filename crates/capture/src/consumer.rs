//! Frame consumers
//!
//! The reader hands every reassembled frame to a [`FrameConsumer`] through a
//! [`ConsumerGate`]. Closing the gate is the first teardown step: once
//! [`ConsumerGate::close`] returns, the reader delivers no further frame.
//!
//! Closing never waits for a frame that is still being consumed. The consumer
//! gets its close notification as soon as that frame is done with.

use anyhow::Context;
use protocol::{Endianness, ProtocolFrame, write_frame};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::{debug, warn};

/// Unblocks a consumer stuck inside [`FrameConsumer::consume`]
pub type Interrupter = Box<dyn Fn() + Send + Sync>;

/// Receives frames in device order, then a single close notification
pub trait FrameConsumer: Send {
    fn consume(&mut self, frame: ProtocolFrame) -> anyhow::Result<()>;

    fn close_session(&mut self);

    /// Hook the gate calls on close, from the closing thread, while a
    /// `consume` call may still be in flight
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }
}

struct ConsumerSlot {
    notified: bool,
    consumer: Box<dyn FrameConsumer>,
}

impl ConsumerSlot {
    fn notify(&mut self, delivered: u64) {
        if !self.notified {
            self.notified = true;
            self.consumer.close_session();
            debug!("Consumer closed after {} frames", delivered);
        }
    }
}

struct GateShared {
    accepting: AtomicBool,
    delivered: AtomicU64,
    interrupter: Option<Interrupter>,
    // Locked only by `deliver` and `close`
    slot: Mutex<ConsumerSlot>,
}

/// Shared switch between the reader and the session
#[derive(Clone)]
pub struct ConsumerGate {
    shared: Arc<GateShared>,
}

impl ConsumerGate {
    pub fn new(consumer: Box<dyn FrameConsumer>) -> Self {
        Self {
            shared: Arc::new(GateShared {
                accepting: AtomicBool::new(true),
                delivered: AtomicU64::new(0),
                interrupter: consumer.interrupter(),
                slot: Mutex::new(ConsumerSlot {
                    notified: false,
                    consumer,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConsumerSlot> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pass `frame` to the consumer
    ///
    /// Returns false once the gate is closed. A consumer error drops only the
    /// frame it was handed.
    pub fn deliver(&self, frame: ProtocolFrame) -> bool {
        if !self.is_accepting() {
            return false;
        }

        {
            let mut slot = self.lock();
            if !self.is_accepting() {
                slot.notify(self.delivered());
                return false;
            }

            let len = frame.len();
            if let Err(e) = slot.consumer.consume(frame) {
                warn!("Consumer rejected {} byte frame: {:#}", len, e);
            }
            self.shared.delivered.fetch_add(1, Ordering::SeqCst);
        }

        // A close that found the slot busy left the notification to us
        if self.is_accepting() {
            true
        } else {
            self.lock().notify(self.delivered());
            false
        }
    }

    /// Stop accepting frames and notify the consumer
    ///
    /// Returns whether this call closed the gate. Does not wait for an
    /// in-flight `consume`.
    pub fn close(&self) -> bool {
        if !self.shared.accepting.swap(false, Ordering::SeqCst) {
            return false;
        }

        if let Some(interrupt) = &self.shared.interrupter {
            interrupt();
        }

        match self.shared.slot.try_lock() {
            Ok(mut slot) => slot.notify(self.delivered()),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().notify(self.delivered()),
            Err(TryLockError::WouldBlock) => {
                debug!("Frame in flight, consumer is notified once it returns");
            }
        }
        true
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Frames handed to the consumer so far
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }
}

/// Writes every frame, re-prefixed with its length header, to `W`
pub struct FrameDump<W> {
    writer: W,
    order: Endianness,
}

impl<W: Write + Send> FrameDump<W> {
    pub fn new(writer: W, order: Endianness) -> Self {
        Self { writer, order }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> FrameConsumer for FrameDump<W> {
    fn consume(&mut self, frame: ProtocolFrame) -> anyhow::Result<()> {
        write_frame(&mut self.writer, &frame, self.order).context("Failed writing frame")?;
        Ok(())
    }

    fn close_session(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("Failed flushing frame dump: {}", e);
        }
    }
}

/// Forwards frames into an async channel, closing it with the session
pub struct ChannelConsumer {
    tx: async_channel::Sender<ProtocolFrame>,
}

impl ChannelConsumer {
    /// Create a consumer and the receiving end of its bounded channel
    pub fn bounded(capacity: usize) -> (Self, async_channel::Receiver<ProtocolFrame>) {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl FrameConsumer for ChannelConsumer {
    fn consume(&mut self, frame: ProtocolFrame) -> anyhow::Result<()> {
        self.tx
            .send_blocking(frame)
            .map_err(|_| anyhow::anyhow!("frame receiver dropped"))
    }

    fn close_session(&mut self) {
        self.tx.close();
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let tx = self.tx.clone();
        Some(Box::new(move || {
            tx.close();
        }))
    }
}
