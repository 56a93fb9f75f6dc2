//! HTTP/2 frame reading.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::FrameError;
use super::types::*;
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, flags};

/// Reads HTTP/2 frames from the read half of a connection.
///
/// All payloads are read into one reusable slab. The frame returned by
/// [`FrameReader::read_frame`] holds zero-copy slices of that slab and
/// is revoked when the next frame is read; slab-backed accessors panic
/// after that point. Callers that hand frames to another task must
/// make sure the frame is released before reading again (the serve
/// loop does this with a per-frame gate).
pub struct FrameReader<R> {
    r: R,
    buf: BytesMut,
    max_frame_size: u32,
    last_tag: Option<ValidityTag>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a frame reader with the default maximum frame size.
    pub fn new(r: R) -> Self {
        Self {
            r,
            buf: BytesMut::with_capacity(DEFAULT_MAX_FRAME_SIZE as usize),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            last_tag: None,
        }
    }

    /// Set the largest frame payload this reader will accept, clamped
    /// to the protocol's legal range.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size.clamp(DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE);
    }

    /// Read a single frame.
    ///
    /// The previously returned frame is revoked first: its slab-backed
    /// payload slices must no longer be accessed.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        if let Some(tag) = self.last_tag.take() {
            tag.revoke();
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.r.read_exact(&mut header).await?;

        let length =
            (u32::from(header[0]) << 16) | (u32::from(header[1]) << 8) | u32::from(header[2]);
        let frame_type = header[3];
        let frame_flags = header[4];
        let stream_id = StreamId::new(u32::from_be_bytes([
            header[5], header[6], header[7], header[8],
        ]));

        if length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        // The slab is empty here: the previous payload was split off
        // and, once its frame was released, reserve() reclaims the
        // allocation instead of growing it.
        self.buf.reserve(length as usize);
        self.buf.resize(length as usize, 0);
        self.r.read_exact(&mut self.buf).await?;
        let payload = self.buf.split_to(length as usize).freeze();

        let tag = ValidityTag::new();
        self.last_tag = Some(tag.clone());
        let header = FrameHeader::with_tag(frame_type, frame_flags, stream_id, length, tag);

        parse_frame(header, payload)
    }
}

/// Parse a frame given its header and payload.
fn parse_frame(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    match header.get_type() {
        Some(FrameType::Data) => parse_data(header, payload),
        Some(FrameType::Headers) => parse_headers(header, payload),
        Some(FrameType::Priority) => parse_priority(header, payload),
        Some(FrameType::RstStream) => parse_rst_stream(header, payload),
        Some(FrameType::Settings) => parse_settings(header, payload),
        Some(FrameType::PushPromise) => parse_push_promise(header, payload),
        Some(FrameType::Ping) => parse_ping(header, payload),
        Some(FrameType::GoAway) => parse_goaway(header, payload),
        Some(FrameType::WindowUpdate) => parse_window_update(header, payload),
        Some(FrameType::Continuation) => parse_continuation(header, payload),
        None => Ok(Frame::Unknown(UnknownFrame::new(header, payload))),
    }
}

fn parse_data(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    // DATA frames must be associated with a stream.
    if header.stream_id.is_connection_level() {
        return Err(FrameError::StreamIdRequired {
            frame_type: header.frame_type,
        });
    }

    let data = if header.has_flag(flags::PADDED) {
        remove_padding(payload)?
    } else {
        payload
    };

    Ok(Frame::Data(DataFrame::new(header, data)))
}

fn parse_headers(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    if header.stream_id.is_connection_level() {
        return Err(FrameError::StreamIdRequired {
            frame_type: header.frame_type,
        });
    }

    let mut pad_length = 0usize;
    if header.has_flag(flags::PADDED) {
        if payload.is_empty() {
            return Err(FrameError::InvalidPadding {
                pad_length: 0,
                payload_length: 0,
            });
        }
        pad_length = payload.get_u8() as usize;
    }

    let priority = if header.has_flag(flags::PRIORITY) {
        if payload.len() < 5 {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: 5,
                actual: payload.len(),
            });
        }
        let first = payload.get_u32();
        let weight = payload.get_u8();
        Some(Priority {
            exclusive: first & 0x8000_0000 != 0,
            dependency: StreamId::new(first & 0x7FFF_FFFF),
            weight,
        })
    } else {
        None
    };

    // Padding that consumes the whole fragment leaves nothing to feed
    // the header decoder; that dooms only this stream.
    if payload.len() <= pad_length {
        return Err(FrameError::EmptyHeaderFragment {
            stream_id: header.stream_id.value(),
        });
    }
    let fragment = payload.slice(..payload.len() - pad_length);

    Ok(Frame::Headers(HeadersFrame::new(header, priority, fragment)))
}

fn parse_priority(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    if header.stream_id.is_connection_level() {
        return Err(FrameError::StreamIdRequired {
            frame_type: header.frame_type,
        });
    }
    if payload.len() != 5 {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: 5,
            actual: payload.len(),
        });
    }

    let first = payload.get_u32();
    let weight = payload.get_u8();
    let stream_id = header.stream_id;

    Ok(Frame::Priority(PriorityFrame {
        header,
        stream_id,
        priority: Priority {
            exclusive: first & 0x8000_0000 != 0,
            dependency: StreamId::new(first & 0x7FFF_FFFF),
            weight,
        },
    }))
}

fn parse_rst_stream(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    if header.stream_id.is_connection_level() {
        return Err(FrameError::StreamIdRequired {
            frame_type: header.frame_type,
        });
    }
    if payload.len() != 4 {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: 4,
            actual: payload.len(),
        });
    }

    let error_code = payload.get_u32();
    let stream_id = header.stream_id;

    Ok(Frame::RstStream(RstStreamFrame {
        header,
        stream_id,
        error_code,
    }))
}

fn parse_settings(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    // SETTINGS frames always apply to the connection, never a stream.
    if !header.stream_id.is_connection_level() {
        return Err(FrameError::NonZeroStreamId {
            frame_type: header.frame_type,
        });
    }

    let ack = header.has_flag(flags::ACK);
    if ack && !payload.is_empty() {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: 0,
            actual: payload.len(),
        });
    }
    if payload.len() % 6 != 0 {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: (payload.len() / 6) * 6,
            actual: payload.len(),
        });
    }

    let mut settings = Vec::with_capacity(payload.len() / 6);
    while payload.has_remaining() {
        let id = SettingId::from_u16(payload.get_u16());
        let value = payload.get_u32();
        validate_setting(id, value)?;
        settings.push(Setting { id, value });
    }

    Ok(Frame::Settings(SettingsFrame {
        header,
        ack,
        settings,
    }))
}

fn validate_setting(id: SettingId, value: u32) -> Result<(), FrameError> {
    match id {
        SettingId::EnablePush if value > 1 => Err(FrameError::InvalidSettingValue {
            id: id.to_u16(),
            value,
        }),
        // Window sizes above 2^31 - 1 are a flow-control error.
        SettingId::InitialWindowSize if value > 0x7FFF_FFFF => {
            Err(FrameError::InvalidSettingValue {
                id: id.to_u16(),
                value,
            })
        }
        SettingId::MaxFrameSize if !(16_384..=16_777_215).contains(&value) => {
            Err(FrameError::InvalidSettingValue {
                id: id.to_u16(),
                value,
            })
        }
        _ => Ok(()),
    }
}

fn parse_push_promise(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    if header.stream_id.is_connection_level() {
        return Err(FrameError::StreamIdRequired {
            frame_type: header.frame_type,
        });
    }

    let mut payload = if header.has_flag(flags::PADDED) {
        remove_padding(payload)?
    } else {
        payload
    };

    if payload.len() < 4 {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: 4,
            actual: payload.len(),
        });
    }
    let promised_stream_id = StreamId::new(payload.get_u32());

    Ok(Frame::PushPromise(PushPromiseFrame::new(
        header,
        promised_stream_id,
        payload,
    )))
}

fn parse_ping(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    if !header.stream_id.is_connection_level() {
        return Err(FrameError::NonZeroStreamId {
            frame_type: header.frame_type,
        });
    }
    if payload.len() != 8 {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: 8,
            actual: payload.len(),
        });
    }

    let ack = header.has_flag(flags::ACK);
    let mut data = [0u8; 8];
    data.copy_from_slice(&payload[..8]);

    Ok(Frame::Ping(PingFrame { header, ack, data }))
}

fn parse_goaway(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    if !header.stream_id.is_connection_level() {
        return Err(FrameError::NonZeroStreamId {
            frame_type: header.frame_type,
        });
    }
    if payload.len() < 8 {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: 8,
            actual: payload.len(),
        });
    }

    let last_stream_id = StreamId::new(payload.get_u32());
    let error_code = payload.get_u32();

    Ok(Frame::GoAway(GoAwayFrame::new(
        header,
        last_stream_id,
        error_code,
        payload,
    )))
}

fn parse_window_update(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    if payload.len() < 4 {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: 4,
            actual: payload.len(),
        });
    }

    // Mask off the high reserved bit.
    let increment = payload.get_u32() & 0x7FFF_FFFF;
    if increment == 0 {
        return Err(FrameError::ZeroWindowIncrement {
            stream_id: header.stream_id.value(),
        });
    }
    let stream_id = header.stream_id;

    Ok(Frame::WindowUpdate(WindowUpdateFrame {
        header,
        stream_id,
        increment,
    }))
}

fn parse_continuation(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    if header.stream_id.is_connection_level() {
        return Err(FrameError::StreamIdRequired {
            frame_type: header.frame_type,
        });
    }
    Ok(Frame::Continuation(ContinuationFrame::new(header, payload)))
}

fn remove_padding(mut payload: Bytes) -> Result<Bytes, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::InvalidPadding {
            pad_length: 0,
            payload_length: 0,
        });
    }

    let pad_length = payload.get_u8() as usize;
    if pad_length > payload.len() {
        return Err(FrameError::InvalidPadding {
            pad_length: pad_length as u8,
            payload_length: payload.len(),
        });
    }

    Ok(payload.slice(..payload.len() - pad_length))
}
