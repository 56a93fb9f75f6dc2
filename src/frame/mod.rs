//! HTTP/2 frame layer: types, reading, and writing.
//!
//! HTTP/2 frames share a common 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```
//!
//! [`FrameReader`] parses frames out of the read half of a connection
//! into a single reusable payload slab; the returned frame's
//! slab-backed fields are only valid until the next read. A
//! [`FrameWriter`] owns the write half and emits each frame with a
//! single buffered write.

mod decode;
mod encode;
mod error;
mod types;

pub use decode::FrameReader;
pub use encode::FrameWriter;
pub use error::{ErrorCode, ErrorScope, FrameError};
pub use types::*;

/// Largest frame size the protocol can express (2^24 - 1).
pub const MAX_FRAME_SIZE: u32 = 16_777_215;

/// Smallest legal value for SETTINGS_MAX_FRAME_SIZE, and the default.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// The 24-byte greeting every client connection must begin with.
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size for flow control.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// Default HPACK header table size.
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;
