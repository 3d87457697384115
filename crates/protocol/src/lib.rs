//! Frame protocol for the iOS screen mirroring bulk stream
//!
//! Once a device exposes its screen mirroring configuration, the bulk IN
//! endpoint carries a sequence of length-prefixed frames. This crate defines
//! the frame header, a streaming extractor that tolerates arbitrary read
//! chunking, and an exact-framing reader for transports that preserve frame
//! boundaries.
//!
//! # Example
//!
//! ```
//! use protocol::{Endianness, FrameExtractor, HeaderByteOrder, encode_frame};
//!
//! let mut wire = encode_frame(b"first", Endianness::Little).unwrap();
//! wire.extend(encode_frame(b"second", Endianness::Little).unwrap());
//!
//! let mut extractor = FrameExtractor::new(HeaderByteOrder::Little);
//! let mut frames = Vec::new();
//! for chunk in wire.chunks(3) {
//!     extractor.extend(chunk);
//!     while let Some(frame) = extractor.next_frame().unwrap() {
//!         frames.push(frame);
//!     }
//! }
//!
//! assert_eq!(frames[0].payload(), b"first");
//! assert_eq!(frames[1].payload(), b"second");
//! ```

pub mod codec;
pub mod error;
pub mod extractor;

pub use codec::{
    Endianness, ExactFrameReader, HEADER_LEN, HeaderByteOrder, MAX_FRAME_SIZE, ProtocolFrame,
    decode_payload_len, encode_frame, write_frame,
};
pub use error::{ProtocolError, Result};
pub use extractor::FrameExtractor;
