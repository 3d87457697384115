//! Bulk frame reader
//!
//! Runs on its own OS thread, reassembling length-prefixed frames from the
//! bulk IN stream and delivering them through a [`ConsumerGate`].

use crate::consumer::ConsumerGate;
use protocol::{ExactFrameReader, FrameExtractor, HeaderByteOrder, MAX_FRAME_SIZE, ProtocolError};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Default size of each read from the bulk stream
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// How frame boundaries are recovered from bulk reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingStrategy {
    /// Accumulate reads and pop every complete frame
    #[default]
    Streaming,
    /// Read one header then one payload; requires reads aligned to frames
    Exact,
}

/// Reader tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSettings {
    pub strategy: FramingStrategy,
    pub byte_order: HeaderByteOrder,
    pub read_buffer_size: usize,
    pub max_frame_size: usize,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            strategy: FramingStrategy::Streaming,
            byte_order: HeaderByteOrder::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Why the reader stopped
#[derive(Debug)]
pub enum ReaderExit {
    /// The gate closed or the stream was closed during teardown
    Closed,
    /// The source reported end of stream
    EndOfStream,
    /// An invalid header was read; the session must end
    Corrupted(ProtocolError),
    /// The stream failed while the session was still accepting frames
    Failed(io::Error),
}

impl ReaderExit {
    /// Whether the exit happened while the session was running
    pub fn is_failure(&self) -> bool {
        matches!(self, ReaderExit::Corrupted(_) | ReaderExit::Failed(_))
    }
}

/// Reassembles frames from `R` and delivers them in order
pub struct BulkFrameReader<R> {
    source: R,
    settings: ReaderSettings,
}

impl<R: Read> BulkFrameReader<R> {
    pub fn new(source: R, settings: ReaderSettings) -> Self {
        Self { source, settings }
    }

    /// Read until the gate closes or the stream ends
    pub fn run(self, gate: &ConsumerGate) -> ReaderExit {
        let exit = match self.settings.strategy {
            FramingStrategy::Streaming => self.run_streaming(gate),
            FramingStrategy::Exact => self.run_exact(gate),
        };

        match &exit {
            ReaderExit::Closed => debug!("Reader stopped: closed"),
            ReaderExit::EndOfStream => info!("Reader stopped: end of stream"),
            ReaderExit::Corrupted(e) => error!("Reader stopped on corrupt stream: {}", e),
            ReaderExit::Failed(e) => error!("Reader stopped on read failure: {}", e),
        }
        exit
    }

    fn run_streaming(mut self, gate: &ConsumerGate) -> ReaderExit {
        let mut extractor = FrameExtractor::new(self.settings.byte_order)
            .with_max_frame_size(self.settings.max_frame_size);
        let mut buf = vec![0u8; self.settings.read_buffer_size.max(1)];

        loop {
            let n = match self.source.read(&mut buf) {
                Ok(0) => {
                    discard_partial(&mut extractor);
                    return ReaderExit::EndOfStream;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    discard_partial(&mut extractor);
                    return read_error_exit(gate, e);
                }
            };

            extractor.extend(&buf[..n]);

            loop {
                match extractor.next_frame() {
                    Ok(Some(frame)) => {
                        if !gate.deliver(frame) {
                            discard_partial(&mut extractor);
                            return ReaderExit::Closed;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return ReaderExit::Corrupted(e),
                }
            }
        }
    }

    fn run_exact(self, gate: &ConsumerGate) -> ReaderExit {
        let mut reader = ExactFrameReader::new(self.source, self.settings.byte_order)
            .with_max_frame_size(self.settings.max_frame_size);

        loop {
            match reader.read_frame() {
                Ok(frame) => {
                    if !gate.deliver(frame) {
                        return ReaderExit::Closed;
                    }
                }
                Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return ReaderExit::EndOfStream;
                }
                Err(ProtocolError::Io(e)) => return read_error_exit(gate, e),
                Err(e) => return ReaderExit::Corrupted(e),
            }
        }
    }
}

impl<R: Read + Send + 'static> BulkFrameReader<R> {
    /// Run the reader on a dedicated thread
    ///
    /// The exit reason is sent on the returned channel when the thread ends.
    pub fn spawn(
        self,
        gate: ConsumerGate,
    ) -> io::Result<(JoinHandle<()>, oneshot::Receiver<ReaderExit>)> {
        let (exit_tx, exit_rx) = oneshot::channel();

        let handle = thread::Builder::new()
            .name("bulk-reader".to_string())
            .spawn(move || {
                let exit = self.run(&gate);
                if exit_tx.send(exit).is_err() {
                    debug!("Reader exit not observed");
                }
            })?;

        Ok((handle, exit_rx))
    }
}

fn read_error_exit(gate: &ConsumerGate, err: io::Error) -> ReaderExit {
    if gate.is_accepting() {
        ReaderExit::Failed(err)
    } else {
        // Closing the stream during teardown fails the pending read
        ReaderExit::Closed
    }
}

fn discard_partial(extractor: &mut FrameExtractor) {
    let dropped = extractor.discard_partial();
    if dropped > 0 {
        warn!("Discarding {} bytes of a partial frame", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CollectingConsumer;
    use protocol::{Endianness, encode_frame};
    use std::io::Cursor;

    /// Source returning one scripted chunk per read
    struct ChunkedSource {
        chunks: Vec<Vec<u8>>,
        next: usize,
        then: Option<io::ErrorKind>,
    }

    impl ChunkedSource {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks,
                next: 0,
                then: None,
            }
        }

        fn then_fail(mut self, kind: io::ErrorKind) -> Self {
            self.then = Some(kind);
            self
        }
    }

    impl Read for ChunkedSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.get(self.next) {
                Some(chunk) => {
                    self.next += 1;
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                None => match self.then {
                    Some(kind) => Err(io::Error::new(kind, "scripted failure")),
                    None => Ok(0),
                },
            }
        }
    }

    fn frames(payloads: &[&[u8]]) -> Vec<u8> {
        payloads
            .iter()
            .flat_map(|p| encode_frame(p, Endianness::Little).unwrap())
            .collect()
    }

    #[test]
    fn test_streaming_reassembles_split_frames() {
        let wire = frames(&[b"F1F1", b"F2F2F2F2", b"F3F3"]);
        let source = ChunkedSource::new(vec![
            wire[..1].to_vec(),
            wire[1..7].to_vec(),
            wire[7..].to_vec(),
        ]);
        let (consumer, collected) = CollectingConsumer::new();
        let gate = ConsumerGate::new(Box::new(consumer));

        let exit = BulkFrameReader::new(source, ReaderSettings::default()).run(&gate);

        assert!(matches!(exit, ReaderExit::EndOfStream));
        assert_eq!(
            collected.payloads(),
            vec![b"F1F1".to_vec(), b"F2F2F2F2".to_vec(), b"F3F3".to_vec()]
        );
    }

    #[test]
    fn test_short_length_is_corruption() {
        let mut wire = frames(&[b"good"]);
        wire.extend_from_slice(&[3, 0, 0, 0, 0xaa]);
        let (consumer, collected) = CollectingConsumer::new();
        let gate = ConsumerGate::new(Box::new(consumer));

        let exit = BulkFrameReader::new(
            ChunkedSource::new(vec![wire]),
            ReaderSettings::default(),
        )
        .run(&gate);

        assert!(matches!(
            exit,
            ReaderExit::Corrupted(ProtocolError::LengthTooSmall { declared: 3, .. })
        ));
        assert!(exit.is_failure());
        assert_eq!(collected.payloads(), vec![b"good".to_vec()]);
    }

    #[test]
    fn test_exact_strategy() {
        let wire = frames(&[b"abcd", b"", b"xyz"]);
        let settings = ReaderSettings {
            strategy: FramingStrategy::Exact,
            ..ReaderSettings::default()
        };
        let (consumer, collected) = CollectingConsumer::new();
        let gate = ConsumerGate::new(Box::new(consumer));

        let exit = BulkFrameReader::new(Cursor::new(wire), settings).run(&gate);

        assert!(matches!(exit, ReaderExit::EndOfStream));
        assert_eq!(
            collected.payloads(),
            vec![b"abcd".to_vec(), Vec::new(), b"xyz".to_vec()]
        );
    }

    #[test]
    fn test_read_failure_while_accepting() {
        let source = ChunkedSource::new(vec![frames(&[b"one!"])]).then_fail(io::ErrorKind::Other);
        let (consumer, collected) = CollectingConsumer::new();
        let gate = ConsumerGate::new(Box::new(consumer));

        let exit = BulkFrameReader::new(source, ReaderSettings::default()).run(&gate);
        assert!(matches!(exit, ReaderExit::Failed(_)));
        assert_eq!(collected.payloads().len(), 1);
    }

    #[test]
    fn test_read_failure_after_close_is_normal() {
        let source = ChunkedSource::new(vec![]).then_fail(io::ErrorKind::BrokenPipe);
        let (consumer, _collected) = CollectingConsumer::new();
        let gate = ConsumerGate::new(Box::new(consumer));
        gate.close();

        let exit = BulkFrameReader::new(source, ReaderSettings::default()).run(&gate);
        assert!(matches!(exit, ReaderExit::Closed));
        assert!(!exit.is_failure());
    }

    #[test]
    fn test_closed_gate_discards_remaining_frames() {
        let wire = frames(&[b"1111", b"2222"]);
        let (consumer, collected) = CollectingConsumer::new();
        let gate = ConsumerGate::new(Box::new(consumer));
        gate.close();

        let exit = BulkFrameReader::new(
            ChunkedSource::new(vec![wire]),
            ReaderSettings::default(),
        )
        .run(&gate);

        assert!(matches!(exit, ReaderExit::Closed));
        assert!(collected.payloads().is_empty());
    }

    #[test]
    fn test_spawn_reports_exit() {
        let wire = frames(&[b"abcd"]);
        let (consumer, collected) = CollectingConsumer::new();
        let gate = ConsumerGate::new(Box::new(consumer));

        let (handle, exit_rx) = BulkFrameReader::new(Cursor::new(wire), ReaderSettings::default())
            .spawn(gate)
            .unwrap();
        handle.join().unwrap();

        let exit = exit_rx.blocking_recv().unwrap();
        assert!(matches!(exit, ReaderExit::EndOfStream));
        assert_eq!(collected.payloads(), vec![b"abcd".to_vec()]);
    }
}
