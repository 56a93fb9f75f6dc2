//! HTTP/2 frame writing.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use super::error::ErrorCode;
use super::types::{FrameType, Setting, flags};
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};

/// Writes HTTP/2 frames to the write half of a connection.
///
/// Each typed write reserves nine bytes for the frame header, appends
/// the payload, patches the length field in place, and issues exactly
/// one write into the buffered writer. Bytes reach the wire when
/// [`FrameWriter::flush`] is called; the connection's write scheduler
/// interleaves flush steps with frame writes.
///
/// The writer also owns the connection's outbound HPACK encoder, so
/// header blocks are compressed against a single dynamic table in
/// wire order.
pub struct FrameWriter<W> {
    w: BufWriter<W>,
    buf: BytesMut,
    header_buf: Vec<u8>,
    hpack: hpack::Encoder<'static>,
    max_frame_size: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Create a frame writer with the default maximum frame size.
    pub fn new(w: W) -> Self {
        Self {
            w: BufWriter::new(w),
            buf: BytesMut::with_capacity(1024),
            header_buf: Vec::new(),
            hpack: hpack::Encoder::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the largest frame payload the peer accepts, clamped to the
    /// protocol's legal range.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size.clamp(DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE);
    }

    /// The largest frame payload the peer accepts.
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Access the underlying writer (after a flush, for inspection).
    pub fn get_ref(&self) -> &W {
        self.w.get_ref()
    }

    /// Append a frame header with a zero length field, returning the
    /// offset where the frame starts.
    fn start_frame(buf: &mut BytesMut, frame_type: FrameType, frame_flags: u8, stream_id: u32) -> usize {
        let start = buf.len();
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(frame_type as u8);
        buf.put_u8(frame_flags);
        buf.put_u32(stream_id & 0x7FFF_FFFF);
        start
    }

    /// Patch the length field of the frame begun at `start`.
    fn finish_frame(buf: &mut BytesMut, start: usize) {
        let length = buf.len() - start - FRAME_HEADER_SIZE;
        debug_assert!(length <= MAX_FRAME_SIZE as usize);
        buf[start] = (length >> 16) as u8;
        buf[start + 1] = (length >> 8) as u8;
        buf[start + 2] = length as u8;
    }

    /// Hand the assembled frame(s) to the buffered writer in a single
    /// write.
    async fn end_write(&mut self) -> io::Result<()> {
        self.w.write_all(&self.buf).await
    }

    /// Force buffered bytes out to the transport.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.w.flush().await
    }

    /// Write a DATA frame.
    pub async fn write_data(
        &mut self,
        stream_id: u32,
        data: &[u8],
        end_stream: bool,
    ) -> io::Result<()> {
        let frame_flags = if end_stream { flags::END_STREAM } else { 0 };
        self.buf.clear();
        self.buf.reserve(FRAME_HEADER_SIZE + data.len());
        let start = Self::start_frame(&mut self.buf, FrameType::Data, frame_flags, stream_id);
        self.buf.extend_from_slice(data);
        Self::finish_frame(&mut self.buf, start);
        self.end_write().await
    }

    /// Write a SETTINGS frame.
    pub async fn write_settings(&mut self, settings: &[Setting]) -> io::Result<()> {
        self.buf.clear();
        let start = Self::start_frame(&mut self.buf, FrameType::Settings, 0, 0);
        for setting in settings {
            self.buf.put_u16(setting.id.to_u16());
            self.buf.put_u32(setting.value);
        }
        Self::finish_frame(&mut self.buf, start);
        self.end_write().await
    }

    /// Write a SETTINGS frame with the ACK flag and empty payload.
    pub async fn write_settings_ack(&mut self) -> io::Result<()> {
        self.buf.clear();
        let start = Self::start_frame(&mut self.buf, FrameType::Settings, flags::ACK, 0);
        Self::finish_frame(&mut self.buf, start);
        self.end_write().await
    }

    /// Write a PING frame, optionally as an acknowledgment.
    pub async fn write_ping(&mut self, ack: bool, data: [u8; 8]) -> io::Result<()> {
        let frame_flags = if ack { flags::ACK } else { 0 };
        self.buf.clear();
        let start = Self::start_frame(&mut self.buf, FrameType::Ping, frame_flags, 0);
        self.buf.extend_from_slice(&data);
        Self::finish_frame(&mut self.buf, start);
        self.end_write().await
    }

    /// Write a GOAWAY frame.
    pub async fn write_goaway(
        &mut self,
        last_stream_id: u32,
        code: ErrorCode,
        debug_data: &[u8],
    ) -> io::Result<()> {
        self.buf.clear();
        let start = Self::start_frame(&mut self.buf, FrameType::GoAway, 0, 0);
        self.buf.put_u32(last_stream_id & 0x7FFF_FFFF);
        self.buf.put_u32(code.to_u32());
        self.buf.extend_from_slice(debug_data);
        Self::finish_frame(&mut self.buf, start);
        self.end_write().await
    }

    /// Write a RST_STREAM frame.
    pub async fn write_rst_stream(&mut self, stream_id: u32, code: ErrorCode) -> io::Result<()> {
        self.buf.clear();
        let start = Self::start_frame(&mut self.buf, FrameType::RstStream, 0, stream_id);
        self.buf.put_u32(code.to_u32());
        Self::finish_frame(&mut self.buf, start);
        self.end_write().await
    }

    /// Write a WINDOW_UPDATE frame.
    pub async fn write_window_update(&mut self, stream_id: u32, increment: u32) -> io::Result<()> {
        self.buf.clear();
        let start = Self::start_frame(&mut self.buf, FrameType::WindowUpdate, 0, stream_id);
        self.buf.put_u32(increment & 0x7FFF_FFFF);
        Self::finish_frame(&mut self.buf, start);
        self.end_write().await
    }

    /// HPACK-encode `fields` and write them as a HEADERS frame,
    /// splitting into CONTINUATION frames when the block exceeds the
    /// peer's maximum frame size. All frames are handed to the
    /// buffered writer in one write.
    pub async fn write_headers<'a, I>(
        &mut self,
        stream_id: u32,
        fields: I,
        end_stream: bool,
    ) -> io::Result<()>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        self.header_buf.clear();
        let Self {
            hpack, header_buf, ..
        } = self;
        hpack.encode_into(fields, header_buf)?;

        let max = self.max_frame_size as usize;
        self.buf.clear();

        let block = self.header_buf.as_slice();
        let (first, mut remainder) = block.split_at(block.len().min(max));

        let mut frame_flags = if end_stream { flags::END_STREAM } else { 0 };
        if remainder.is_empty() {
            frame_flags |= flags::END_HEADERS;
        }
        let start = Self::start_frame(&mut self.buf, FrameType::Headers, frame_flags, stream_id);
        self.buf.extend_from_slice(first);
        Self::finish_frame(&mut self.buf, start);

        while !remainder.is_empty() {
            let take = remainder.len().min(max);
            let (fragment, tail) = remainder.split_at(take);
            remainder = tail;
            let frame_flags = if remainder.is_empty() {
                flags::END_HEADERS
            } else {
                0
            };
            let start =
                Self::start_frame(&mut self.buf, FrameType::Continuation, frame_flags, stream_id);
            self.buf.extend_from_slice(fragment);
            Self::finish_frame(&mut self.buf, start);
        }

        self.end_write().await
    }
}
