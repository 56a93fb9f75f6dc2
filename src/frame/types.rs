//! HTTP/2 frame type definitions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

/// HTTP/2 frame types (draft-14 section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    /// Try to convert a byte to a frame type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::GoAway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }
}

/// Frame flags.
pub mod flags {
    /// DATA/HEADERS: last frame of the stream.
    pub const END_STREAM: u8 = 0x1;
    /// SETTINGS/PING: this frame is an acknowledgment.
    pub const ACK: u8 = 0x1;
    /// HEADERS/CONTINUATION: last fragment of the header block.
    pub const END_HEADERS: u8 = 0x4;
    /// DATA/HEADERS: padding is present.
    pub const PADDED: u8 = 0x8;
    /// HEADERS: priority information is present.
    pub const PRIORITY: u8 = 0x20;
}

/// Stream identifier (31 bits, high bit reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId(u32);

impl StreamId {
    /// Connection-level stream (stream 0).
    pub const CONNECTION: StreamId = StreamId(0);

    /// Create a new stream ID, masking the reserved bit.
    #[inline]
    pub fn new(id: u32) -> Self {
        StreamId(id & 0x7FFF_FFFF)
    }

    /// Get the raw stream ID value.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Check if this is the connection-level stream.
    #[inline]
    pub fn is_connection_level(self) -> bool {
        self.0 == 0
    }

    /// Check if this is a client-initiated stream (odd numbers).
    #[inline]
    pub fn is_client_initiated(self) -> bool {
        self.0 % 2 == 1
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        StreamId::new(id)
    }
}

/// Liveness tag shared between a frame and the reader that produced it.
///
/// The reader's payload slab is recycled on every read, so the frame
/// most recently returned is revoked before the next one is parsed.
/// Accessors for slab-backed fields check the tag and panic on use
/// after revocation.
#[derive(Debug, Clone)]
pub struct ValidityTag(Arc<AtomicBool>);

impl ValidityTag {
    pub(crate) fn new() -> Self {
        ValidityTag(Arc::new(AtomicBool::new(true)))
    }

    pub(crate) fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Raw frame header: the nine bytes prefixed to every frame.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Payload length (24 bits).
    pub length: u32,
    /// Frame type byte.
    pub frame_type: u8,
    /// Frame flags.
    pub flags: u8,
    /// Stream identifier (reserved bit already masked).
    pub stream_id: StreamId,
    valid: ValidityTag,
}

impl FrameHeader {
    /// Create a frame header with a fresh validity tag.
    pub fn new(frame_type: FrameType, flags: u8, stream_id: StreamId, length: u32) -> Self {
        Self::with_tag(frame_type as u8, flags, stream_id, length, ValidityTag::new())
    }

    pub(crate) fn with_tag(
        frame_type: u8,
        flags: u8,
        stream_id: StreamId,
        length: u32,
        valid: ValidityTag,
    ) -> Self {
        Self {
            length,
            frame_type,
            flags,
            stream_id,
            valid,
        }
    }

    /// Get the frame type as an enum, if known.
    pub fn get_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.frame_type)
    }

    /// Check if a flag is set.
    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Panic if this frame's slab-backed payload has been recycled by
    /// a subsequent read.
    #[track_caller]
    pub(crate) fn check_valid(&self) {
        if !self.valid.is_valid() {
            panic!("frame payload accessed after a subsequent frame read");
        }
    }
}

/// Parsed HTTP/2 frame.
#[derive(Debug)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    /// Unknown frame type (ignored per spec).
    Unknown(UnknownFrame),
}

impl Frame {
    /// Get the raw frame header.
    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::Data(f) => &f.header,
            Frame::Headers(f) => &f.header,
            Frame::Priority(f) => &f.header,
            Frame::RstStream(f) => &f.header,
            Frame::Settings(f) => &f.header,
            Frame::PushPromise(f) => &f.header,
            Frame::Ping(f) => &f.header,
            Frame::GoAway(f) => &f.header,
            Frame::WindowUpdate(f) => &f.header,
            Frame::Continuation(f) => &f.header,
            Frame::Unknown(f) => &f.header,
        }
    }

    /// Get the stream ID for this frame.
    pub fn stream_id(&self) -> StreamId {
        self.header().stream_id
    }
}

/// DATA frame (type=0x0).
#[derive(Debug)]
pub struct DataFrame {
    pub header: FrameHeader,
    pub stream_id: StreamId,
    pub end_stream: bool,
    data: Bytes,
}

impl DataFrame {
    pub(crate) fn new(header: FrameHeader, data: Bytes) -> Self {
        let stream_id = header.stream_id;
        let end_stream = header.has_flag(flags::END_STREAM);
        Self {
            header,
            stream_id,
            end_stream,
            data,
        }
    }

    /// The frame's data octets, without the padding byte or suffix.
    ///
    /// Only valid until the next frame read.
    pub fn data(&self) -> &[u8] {
        self.header.check_valid();
        &self.data
    }
}

/// Stream priority fields carried by HEADERS and PRIORITY frames.
///
/// Parsed but otherwise unused: the write scheduler is not
/// priority-aware.
#[derive(Debug, Clone, Copy)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: StreamId,
    /// Weight in the wire range [0, 255]; add 1 for the spec range.
    pub weight: u8,
}

/// HEADERS frame (type=0x1).
#[derive(Debug)]
pub struct HeadersFrame {
    pub header: FrameHeader,
    pub stream_id: StreamId,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<Priority>,
    fragment: Bytes,
}

impl HeadersFrame {
    pub(crate) fn new(header: FrameHeader, priority: Option<Priority>, fragment: Bytes) -> Self {
        let stream_id = header.stream_id;
        let end_stream = header.has_flag(flags::END_STREAM);
        let end_headers = header.has_flag(flags::END_HEADERS);
        Self {
            header,
            stream_id,
            end_stream,
            end_headers,
            priority,
            fragment,
        }
    }

    /// The header-block fragment. Only valid until the next frame read.
    pub fn fragment(&self) -> &[u8] {
        self.header.check_valid();
        &self.fragment
    }
}

/// PRIORITY frame (type=0x2).
#[derive(Debug)]
pub struct PriorityFrame {
    pub header: FrameHeader,
    pub stream_id: StreamId,
    pub priority: Priority,
}

/// RST_STREAM frame (type=0x3).
#[derive(Debug)]
pub struct RstStreamFrame {
    pub header: FrameHeader,
    pub stream_id: StreamId,
    pub error_code: u32,
}

/// Individual entry in a SETTINGS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: SettingId,
    pub value: u32,
}

/// Known setting identifiers (draft-14 section 6.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    /// Unknown setting ID (ignored).
    Unknown(u16),
}

impl SettingId {
    pub fn from_u16(id: u16) -> Self {
        match id {
            0x1 => SettingId::HeaderTableSize,
            0x2 => SettingId::EnablePush,
            0x3 => SettingId::MaxConcurrentStreams,
            0x4 => SettingId::InitialWindowSize,
            0x5 => SettingId::MaxFrameSize,
            0x6 => SettingId::MaxHeaderListSize,
            _ => SettingId::Unknown(id),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            SettingId::HeaderTableSize => 0x1,
            SettingId::EnablePush => 0x2,
            SettingId::MaxConcurrentStreams => 0x3,
            SettingId::InitialWindowSize => 0x4,
            SettingId::MaxFrameSize => 0x5,
            SettingId::MaxHeaderListSize => 0x6,
            SettingId::Unknown(id) => id,
        }
    }
}

/// SETTINGS frame (type=0x4).
#[derive(Debug)]
pub struct SettingsFrame {
    pub header: FrameHeader,
    pub ack: bool,
    pub settings: Vec<Setting>,
}

/// PUSH_PROMISE frame (type=0x5). Clients must not send these.
#[derive(Debug)]
pub struct PushPromiseFrame {
    pub header: FrameHeader,
    pub stream_id: StreamId,
    pub end_headers: bool,
    pub promised_stream_id: StreamId,
    fragment: Bytes,
}

impl PushPromiseFrame {
    pub(crate) fn new(header: FrameHeader, promised_stream_id: StreamId, fragment: Bytes) -> Self {
        let stream_id = header.stream_id;
        let end_headers = header.has_flag(flags::END_HEADERS);
        Self {
            header,
            stream_id,
            end_headers,
            promised_stream_id,
            fragment,
        }
    }

    /// The header-block fragment. Only valid until the next frame read.
    pub fn fragment(&self) -> &[u8] {
        self.header.check_valid();
        &self.fragment
    }
}

/// PING frame (type=0x6).
#[derive(Debug)]
pub struct PingFrame {
    pub header: FrameHeader,
    pub ack: bool,
    pub data: [u8; 8],
}

/// GOAWAY frame (type=0x7).
#[derive(Debug)]
pub struct GoAwayFrame {
    pub header: FrameHeader,
    pub last_stream_id: StreamId,
    pub error_code: u32,
    debug_data: Bytes,
}

impl GoAwayFrame {
    pub(crate) fn new(
        header: FrameHeader,
        last_stream_id: StreamId,
        error_code: u32,
        debug_data: Bytes,
    ) -> Self {
        Self {
            header,
            last_stream_id,
            error_code,
            debug_data,
        }
    }

    /// Opaque debug data. Only valid until the next frame read.
    pub fn debug_data(&self) -> &[u8] {
        self.header.check_valid();
        &self.debug_data
    }
}

/// WINDOW_UPDATE frame (type=0x8).
#[derive(Debug)]
pub struct WindowUpdateFrame {
    pub header: FrameHeader,
    pub stream_id: StreamId,
    pub increment: u32,
}

/// CONTINUATION frame (type=0x9).
#[derive(Debug)]
pub struct ContinuationFrame {
    pub header: FrameHeader,
    pub stream_id: StreamId,
    pub end_headers: bool,
    fragment: Bytes,
}

impl ContinuationFrame {
    pub(crate) fn new(header: FrameHeader, fragment: Bytes) -> Self {
        let stream_id = header.stream_id;
        let end_headers = header.has_flag(flags::END_HEADERS);
        Self {
            header,
            stream_id,
            end_headers,
            fragment,
        }
    }

    /// The header-block fragment. Only valid until the next frame read.
    pub fn fragment(&self) -> &[u8] {
        self.header.check_valid();
        &self.fragment
    }
}

/// Unknown frame type.
#[derive(Debug)]
pub struct UnknownFrame {
    pub header: FrameHeader,
    pub frame_type: u8,
    pub stream_id: StreamId,
    payload: Bytes,
}

impl UnknownFrame {
    pub(crate) fn new(header: FrameHeader, payload: Bytes) -> Self {
        let frame_type = header.frame_type;
        let stream_id = header.stream_id;
        Self {
            header,
            frame_type,
            stream_id,
            payload,
        }
    }

    /// The raw payload. Only valid until the next frame read.
    pub fn payload(&self) -> &[u8] {
        self.header.check_valid();
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_from_u8() {
        assert_eq!(FrameType::from_u8(0x0), Some(FrameType::Data));
        assert_eq!(FrameType::from_u8(0x4), Some(FrameType::Settings));
        assert_eq!(FrameType::from_u8(0x9), Some(FrameType::Continuation));
        assert_eq!(FrameType::from_u8(0xa), None);
        assert_eq!(FrameType::from_u8(0xff), None);
    }

    #[test]
    fn test_stream_id_masks_reserved_bit() {
        assert_eq!(StreamId::new(0x8000_0001).value(), 1);
    }

    #[test]
    fn test_stream_id_classification() {
        assert!(StreamId::CONNECTION.is_connection_level());
        assert!(StreamId::new(1).is_client_initiated());
        assert!(StreamId::new(3).is_client_initiated());
        assert!(!StreamId::new(2).is_client_initiated());
        assert!(!StreamId::new(0).is_client_initiated());
    }

    #[test]
    fn test_frame_header_flags() {
        let header = FrameHeader::new(
            FrameType::Headers,
            flags::END_STREAM | flags::END_HEADERS,
            StreamId::new(1),
            0,
        );
        assert!(header.has_flag(flags::END_STREAM));
        assert!(header.has_flag(flags::END_HEADERS));
        assert!(!header.has_flag(flags::PADDED));
        assert_eq!(header.get_type(), Some(FrameType::Headers));
    }

    #[test]
    fn test_setting_id_roundtrip() {
        let ids = [
            SettingId::HeaderTableSize,
            SettingId::EnablePush,
            SettingId::MaxConcurrentStreams,
            SettingId::InitialWindowSize,
            SettingId::MaxFrameSize,
            SettingId::MaxHeaderListSize,
            SettingId::Unknown(0x99),
        ];
        for id in ids {
            assert_eq!(SettingId::from_u16(id.to_u16()), id);
        }
    }

    #[test]
    fn test_data_accessor_while_valid() {
        let header = FrameHeader::new(FrameType::Data, flags::END_STREAM, StreamId::new(1), 5);
        let frame = DataFrame::new(header, Bytes::from_static(b"hello"));
        assert_eq!(frame.data(), b"hello");
        assert!(frame.end_stream);
    }

    #[test]
    #[should_panic(expected = "after a subsequent frame read")]
    fn test_data_accessor_after_revoke_panics() {
        let tag = ValidityTag::new();
        let header =
            FrameHeader::with_tag(0x0, 0, StreamId::new(1), 5, tag.clone());
        let frame = DataFrame::new(header, Bytes::from_static(b"hello"));
        tag.revoke();
        let _ = frame.data();
    }

    #[test]
    fn test_frame_stream_id_helper() {
        let header = FrameHeader::new(FrameType::WindowUpdate, 0, StreamId::new(7), 4);
        let frame = Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: header.stream_id,
            increment: 100,
            header,
        });
        assert_eq!(frame.stream_id().value(), 7);
    }
}
