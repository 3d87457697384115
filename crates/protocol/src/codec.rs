//! Frame header encoding and the exact-framing reader
//!
//! Every frame on the bulk IN endpoint carries a 4-byte length prefix whose
//! value counts the prefix itself:
//!
//! ```text
//! [Length: u32 = payload_len + 4][Payload bytes]
//! ```
//!
//! The byte order of the length field differs between device protocol
//! generations, so it is a configured property ([`HeaderByteOrder`]) that can
//! also be detected from the first header seen on a stream.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Size of the length prefix in bytes
pub const HEADER_LEN: usize = 4;

/// Maximum allowed payload size (32 MiB)
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Concrete byte order of a frame length field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    fn read(self, header: &[u8; HEADER_LEN]) -> u32 {
        match self {
            Endianness::Little => LittleEndian::read_u32(header),
            Endianness::Big => BigEndian::read_u32(header),
        }
    }

    fn write(self, buf: &mut [u8], value: u32) {
        match self {
            Endianness::Little => LittleEndian::write_u32(buf, value),
            Endianness::Big => BigEndian::write_u32(buf, value),
        }
    }
}

/// Configured byte order of the frame length field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderByteOrder {
    /// Little-endian length field
    #[default]
    Little,
    /// Big-endian length field
    Big,
    /// Detect from the first header on the stream
    Auto,
}

impl HeaderByteOrder {
    /// Resolve to a concrete byte order, inspecting `header` when set to `Auto`.
    ///
    /// Detection accepts a reading only if it is at least [`HEADER_LEN`] and
    /// the payload fits in `max_frame_size`. Little-endian wins when both
    /// readings qualify.
    ///
    /// A header whose bytes read as a length below [`HEADER_LEN`] in either
    /// order is reported as [`ProtocolError::LengthTooSmall`]. This rejects
    /// the few legitimate frames of exactly 16 or 32 MiB little-endian.
    pub fn resolve(self, header: &[u8; HEADER_LEN], max_frame_size: usize) -> Result<Endianness> {
        match self {
            HeaderByteOrder::Little => Ok(Endianness::Little),
            HeaderByteOrder::Big => Ok(Endianness::Big),
            HeaderByteOrder::Auto => {
                let plausible = |value: u32| {
                    value as usize >= HEADER_LEN && value as usize - HEADER_LEN <= max_frame_size
                };
                let little = LittleEndian::read_u32(header);
                let big = BigEndian::read_u32(header);

                let smallest = little.min(big);
                if (smallest as usize) < HEADER_LEN {
                    return Err(ProtocolError::LengthTooSmall {
                        declared: smallest,
                        min: HEADER_LEN as u32,
                    });
                }

                match (plausible(little), plausible(big)) {
                    (true, _) => Ok(Endianness::Little),
                    (false, true) => Ok(Endianness::Big),
                    (false, false) => Err(ProtocolError::UndetectableByteOrder { header: *header }),
                }
            }
        }
    }
}

/// One reassembled unit of the length-prefixed wire protocol
///
/// The payload is opaque to this crate; interpreting it is left to the
/// consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFrame {
    payload: Bytes,
}

impl ProtocolFrame {
    /// Wrap a payload
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Payload bytes (without the length prefix)
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Length on the wire, including the prefix
    pub fn wire_len(&self) -> usize {
        self.payload.len() + HEADER_LEN
    }

    /// Consume the frame, returning its payload
    pub fn into_bytes(self) -> Bytes {
        self.payload
    }
}

/// Decode the payload length from a header in a resolved byte order
pub fn decode_payload_len(
    header: &[u8; HEADER_LEN],
    order: Endianness,
    max_frame_size: usize,
) -> Result<usize> {
    let declared = order.read(header);

    // The length counts its own 4 bytes
    if (declared as usize) < HEADER_LEN {
        return Err(ProtocolError::LengthTooSmall {
            declared,
            min: HEADER_LEN as u32,
        });
    }

    let payload_len = declared as usize - HEADER_LEN;
    if payload_len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: payload_len,
            max: max_frame_size,
        });
    }

    Ok(payload_len)
}

/// Encode a payload with its length prefix
///
/// # Example
/// ```
/// use protocol::{Endianness, encode_frame};
///
/// let framed = encode_frame(b"ping", Endianness::Little).unwrap();
/// assert_eq!(&framed[..4], &[8, 0, 0, 0]);
/// assert_eq!(&framed[4..], b"ping");
/// ```
pub fn encode_frame(payload: &[u8], order: Endianness) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = vec![0u8; HEADER_LEN + payload.len()];
    order.write(&mut frame[..HEADER_LEN], (payload.len() + HEADER_LEN) as u32);
    frame[HEADER_LEN..].copy_from_slice(payload);
    Ok(frame)
}

/// Write a frame with its length prefix to a writer
pub fn write_frame<W: Write>(writer: &mut W, frame: &ProtocolFrame, order: Endianness) -> Result<()> {
    let framed = encode_frame(frame.payload(), order)?;
    writer.write_all(&framed)?;
    Ok(())
}

/// Exact-framing reader
///
/// Reads exactly one header, then exactly one payload, per frame. This is only
/// correct when the underlying transport never splits or coalesces frames
/// across reads; use [`crate::FrameExtractor`] otherwise.
pub struct ExactFrameReader<R> {
    inner: R,
    order: HeaderByteOrder,
    resolved: Option<Endianness>,
    max_frame_size: usize,
}

impl<R: Read> ExactFrameReader<R> {
    /// Create a reader over `inner`
    pub fn new(inner: R, order: HeaderByteOrder) -> Self {
        Self {
            inner,
            order,
            resolved: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Override the maximum payload size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Byte order in use, once the first header has been seen
    pub fn byte_order(&self) -> Option<Endianness> {
        self.resolved
    }

    /// Read the next frame
    ///
    /// # Example
    /// ```
    /// use protocol::{Endianness, ExactFrameReader, HeaderByteOrder, encode_frame};
    /// use std::io::Cursor;
    ///
    /// let bytes = encode_frame(b"abcd", Endianness::Big).unwrap();
    /// let mut reader = ExactFrameReader::new(Cursor::new(bytes), HeaderByteOrder::Big);
    /// assert_eq!(reader.read_frame().unwrap().payload(), b"abcd");
    /// ```
    pub fn read_frame(&mut self) -> Result<ProtocolFrame> {
        let mut header = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut header)?;

        let order = match self.resolved {
            Some(order) => order,
            None => {
                let order = self.order.resolve(&header, self.max_frame_size)?;
                self.resolved = Some(order);
                order
            }
        };

        let payload_len = decode_payload_len(&header, order, self.max_frame_size)?;
        let mut payload = vec![0u8; payload_len];
        self.inner.read_exact(&mut payload)?;

        Ok(ProtocolFrame::new(payload))
    }

    /// Consume the reader, returning the underlying source
    pub fn into_inner(self) -> R {
        self.inner
    }
}
