//! Streaming frame extraction
//!
//! Raw bulk reads arrive in arbitrary chunks: a single read may carry part of
//! a frame, exactly one frame, or several frames back to back. The extractor
//! accumulates raw bytes and pops complete frames in receive order, keeping
//! any trailing partial frame for the next read.
//!
//! A corrupt length field poisons the extractor. Every later call returns the
//! same error; there is no attempt to resynchronise.

use crate::codec::{
    Endianness, HEADER_LEN, HeaderByteOrder, MAX_FRAME_SIZE, ProtocolFrame, decode_payload_len,
};
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BytesMut};

/// Initial accumulation buffer capacity
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Reassembles length-prefixed frames from arbitrarily chunked input
#[derive(Debug)]
pub struct FrameExtractor {
    buffer: BytesMut,
    order: HeaderByteOrder,
    resolved: Option<Endianness>,
    max_frame_size: usize,
    /// Header that failed validation, kept so the failure repeats
    poisoned: Option<[u8; HEADER_LEN]>,
}

impl FrameExtractor {
    /// Create an extractor for the given header byte order
    pub fn new(order: HeaderByteOrder) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            order,
            resolved: None,
            max_frame_size: MAX_FRAME_SIZE,
            poisoned: None,
        }
    }

    /// Override the maximum payload size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Append one raw read
    pub fn extend(&mut self, chunk: &[u8]) {
        if self.poisoned.is_none() {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Pop the next complete frame
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Example
    /// ```
    /// use protocol::{Endianness, FrameExtractor, HeaderByteOrder, encode_frame};
    ///
    /// let bytes = encode_frame(b"hello", Endianness::Little).unwrap();
    /// let mut extractor = FrameExtractor::new(HeaderByteOrder::Little);
    ///
    /// extractor.extend(&bytes[..6]);
    /// assert!(extractor.next_frame().unwrap().is_none());
    ///
    /// extractor.extend(&bytes[6..]);
    /// assert_eq!(extractor.next_frame().unwrap().unwrap().payload(), b"hello");
    /// ```
    pub fn next_frame(&mut self) -> Result<Option<ProtocolFrame>> {
        if let Some(header) = self.poisoned {
            return Err(self.header_error(&header));
        }

        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buffer[..HEADER_LEN]);

        let payload_len = match self.payload_len(&header) {
            Ok(len) => len,
            Err(e) => {
                self.poisoned = Some(header);
                self.buffer.clear();
                return Err(e);
            }
        };

        if self.buffer.len() < HEADER_LEN + payload_len {
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(payload_len).freeze();
        Ok(Some(ProtocolFrame::new(payload)))
    }

    /// Number of buffered bytes not yet returned as frames
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Byte order in use, once the first header has been seen
    pub fn byte_order(&self) -> Option<Endianness> {
        self.resolved
    }

    /// Whether a corrupt header has been seen
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Discard any buffered partial frame
    pub fn discard_partial(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    fn payload_len(&mut self, header: &[u8; HEADER_LEN]) -> Result<usize> {
        let order = match self.resolved {
            Some(order) => order,
            None => {
                let order = self.order.resolve(header, self.max_frame_size)?;
                self.resolved = Some(order);
                order
            }
        };
        decode_payload_len(header, order, self.max_frame_size)
    }

    fn header_error(&self, header: &[u8; HEADER_LEN]) -> ProtocolError {
        let order = match self.resolved {
            Some(order) => order,
            None => match self.order.resolve(header, self.max_frame_size) {
                Ok(order) => order,
                Err(e) => return e,
            },
        };
        match decode_payload_len(header, order, self.max_frame_size) {
            Err(e) => e,
            Ok(_) => ProtocolError::UndetectableByteOrder { header: *header },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;

    fn drain(extractor: &mut FrameExtractor) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = extractor.next_frame().unwrap() {
            frames.push(frame.payload().to_vec());
        }
        frames
    }

    #[test]
    fn test_partial_header_waits() {
        let mut extractor = FrameExtractor::new(HeaderByteOrder::Little);
        extractor.extend(&[8, 0]);
        assert!(extractor.next_frame().unwrap().is_none());
        assert_eq!(extractor.buffered(), 2);
    }

    #[test]
    fn test_coalesced_frames_in_one_read() {
        let mut bytes = encode_frame(b"a", Endianness::Little).unwrap();
        bytes.extend(encode_frame(b"bb", Endianness::Little).unwrap());
        bytes.extend(encode_frame(b"ccc", Endianness::Little).unwrap());
        bytes.extend(&[9, 0, 0]);

        let mut extractor = FrameExtractor::new(HeaderByteOrder::Little);
        extractor.extend(&bytes);

        assert_eq!(drain(&mut extractor), vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
        // Trailing partial header persists
        assert_eq!(extractor.buffered(), 3);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut extractor = FrameExtractor::new(HeaderByteOrder::Big);
        extractor.extend(&[0, 0, 0, 4]);
        let frame = extractor.next_frame().unwrap().unwrap();
        assert!(frame.is_empty());
        assert_eq!(extractor.buffered(), 0);
    }

    #[test]
    fn test_short_length_poisons() {
        let mut extractor = FrameExtractor::new(HeaderByteOrder::Little);
        extractor.extend(&[3, 0, 0, 0, 0xaa, 0xbb]);

        let err = extractor.next_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::LengthTooSmall { declared: 3, .. }));
        assert!(extractor.is_poisoned());

        // No resynchronisation, even with a valid frame following
        extractor.extend(&encode_frame(b"ok", Endianness::Little).unwrap());
        assert!(matches!(
            extractor.next_frame(),
            Err(ProtocolError::LengthTooSmall { declared: 3, .. })
        ));
        assert_eq!(extractor.buffered(), 0);
    }

    #[test]
    fn test_frame_before_corruption_is_kept() {
        let mut bytes = encode_frame(b"good", Endianness::Little).unwrap();
        bytes.extend(&[1, 0, 0, 0]);

        let mut extractor = FrameExtractor::new(HeaderByteOrder::Little);
        extractor.extend(&bytes);

        assert_eq!(extractor.next_frame().unwrap().unwrap().payload(), b"good");
        assert!(extractor.next_frame().unwrap_err().is_corruption());
    }

    #[test]
    fn test_max_frame_size_enforced() {
        let mut extractor = FrameExtractor::new(HeaderByteOrder::Little).with_max_frame_size(16);
        extractor.extend(&encode_frame(&[0u8; 17], Endianness::Little).unwrap());
        assert!(matches!(
            extractor.next_frame(),
            Err(ProtocolError::FrameTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_auto_order_locks_after_first_header() {
        let mut extractor = FrameExtractor::new(HeaderByteOrder::Auto);
        extractor.extend(&encode_frame(b"first", Endianness::Big).unwrap());
        assert_eq!(extractor.next_frame().unwrap().unwrap().payload(), b"first");
        assert_eq!(extractor.byte_order(), Some(Endianness::Big));

        extractor.extend(&encode_frame(b"second", Endianness::Big).unwrap());
        assert_eq!(extractor.next_frame().unwrap().unwrap().payload(), b"second");
    }

    #[test]
    fn test_discard_partial() {
        let bytes = encode_frame(b"unfinished", Endianness::Little).unwrap();
        let mut extractor = FrameExtractor::new(HeaderByteOrder::Little);
        extractor.extend(&bytes[..7]);
        assert!(extractor.next_frame().unwrap().is_none());
        assert_eq!(extractor.discard_partial(), 7);
        assert_eq!(extractor.buffered(), 0);
    }
}
