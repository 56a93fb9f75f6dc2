//! Connection settings records.

use crate::frame;

/// One side's HTTP/2 settings.
///
/// The serve loop keeps a record for the peer (updated from SETTINGS
/// frames) and advertises its own at connection start.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// HPACK dynamic table size.
    pub header_table_size: u32,
    /// Whether server push is permitted.
    pub enable_push: bool,
    /// Maximum number of concurrent streams.
    pub max_concurrent_streams: u32,
    /// Initial per-stream window size.
    pub initial_window_size: u32,
    /// Maximum frame payload size.
    pub max_frame_size: u32,
    /// Maximum header list size (0 means unknown).
    pub max_header_list_size: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            header_table_size: frame::DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: 0,
        }
    }
}

impl ConnectionSettings {
    pub fn new() -> Self {
        Self::default()
    }
}
