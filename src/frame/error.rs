//! HTTP/2 error codes and frame-layer errors.

use std::fmt;
use std::io;

/// HTTP/2 error codes (draft-14 section 7).
///
/// These appear on the wire in RST_STREAM and GOAWAY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown.
    NoError = 0x0,
    /// Protocol error detected.
    ProtocolError = 0x1,
    /// Implementation fault.
    InternalError = 0x2,
    /// Flow control limits exceeded.
    FlowControlError = 0x3,
    /// Settings not acknowledged in time.
    SettingsTimeout = 0x4,
    /// Frame received for closed stream.
    StreamClosed = 0x5,
    /// Frame size incorrect.
    FrameSizeError = 0x6,
    /// Stream not processed.
    RefusedStream = 0x7,
    /// Stream cancelled.
    Cancel = 0x8,
    /// Compression state not updated.
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method.
    ConnectError = 0xa,
    /// Processing capacity exceeded.
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable.
    InadequateSecurity = 0xc,
    /// HTTP/1.1 required.
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            // Unknown error codes are treated as INTERNAL_ERROR.
            _ => ErrorCode::InternalError,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        };
        f.write_str(name)
    }
}

/// Frame read/parse errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Frame length field exceeds the reader's configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: u32, max: u32 },
    /// Frame type requires a non-zero stream ID.
    #[error("frame type 0x{frame_type:02x} requires a non-zero stream ID")]
    StreamIdRequired { frame_type: u8 },
    /// Frame type is connection-scoped and must use stream 0.
    #[error("frame type 0x{frame_type:02x} must be sent on stream 0")]
    NonZeroStreamId { frame_type: u8 },
    /// Frame payload length violates the type's framing rule.
    #[error("frame type 0x{frame_type:02x} expected {expected} payload bytes, got {actual}")]
    InvalidPayloadLength {
        frame_type: u8,
        expected: usize,
        actual: usize,
    },
    /// Pad length exceeds the remaining payload.
    #[error("pad length {pad_length} exceeds payload of {payload_length} bytes")]
    InvalidPadding {
        pad_length: u8,
        payload_length: usize,
    },
    /// Padding arithmetic left no usable header-block fragment.
    #[error("stream {stream_id}: padding consumed the entire header block")]
    EmptyHeaderFragment { stream_id: u32 },
    /// A setting carried a value outside its legal range.
    #[error("setting 0x{id:02x} has invalid value {value}")]
    InvalidSettingValue { id: u16, value: u32 },
    /// WINDOW_UPDATE with a zero increment.
    #[error("stream {stream_id}: WINDOW_UPDATE increment of 0")]
    ZeroWindowIncrement { stream_id: u32 },
    /// Underlying transport error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// How a frame error maps onto the protocol's recovery model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// The connection is doomed; emit GOAWAY with this code.
    Connection(ErrorCode),
    /// Only the named stream is terminated; emit RST_STREAM.
    Stream { id: u32, code: ErrorCode },
    /// The transport failed; tear down without a GOAWAY.
    Transport,
}

impl FrameError {
    /// Classify this error per the framing rules: most violations are
    /// connection-level PROTOCOL_ERROR, with the per-type exceptions
    /// called out in draft-14 sections 6.x.
    pub fn scope(&self) -> ErrorScope {
        use super::types::FrameType;
        match self {
            FrameError::FrameTooLarge { .. } => {
                ErrorScope::Connection(ErrorCode::FrameSizeError)
            }
            FrameError::StreamIdRequired { .. } | FrameError::NonZeroStreamId { .. } => {
                ErrorScope::Connection(ErrorCode::ProtocolError)
            }
            FrameError::InvalidPayloadLength { frame_type, .. } => {
                // SETTINGS, PING and GOAWAY length violations are
                // FRAME_SIZE_ERROR; the rest are PROTOCOL_ERROR.
                let code = match FrameType::from_u8(*frame_type) {
                    Some(FrameType::Settings)
                    | Some(FrameType::Ping)
                    | Some(FrameType::GoAway) => ErrorCode::FrameSizeError,
                    _ => ErrorCode::ProtocolError,
                };
                ErrorScope::Connection(code)
            }
            FrameError::InvalidPadding { .. } => {
                ErrorScope::Connection(ErrorCode::ProtocolError)
            }
            FrameError::EmptyHeaderFragment { stream_id } => ErrorScope::Stream {
                id: *stream_id,
                code: ErrorCode::ProtocolError,
            },
            FrameError::InvalidSettingValue { id, .. } => {
                // Oversized INITIAL_WINDOW_SIZE is a flow-control
                // error; other bad settings are protocol errors.
                let code = if *id == super::types::SettingId::InitialWindowSize.to_u16() {
                    ErrorCode::FlowControlError
                } else {
                    ErrorCode::ProtocolError
                };
                ErrorScope::Connection(code)
            }
            FrameError::ZeroWindowIncrement { stream_id } => {
                if *stream_id == 0 {
                    ErrorScope::Connection(ErrorCode::ProtocolError)
                } else {
                    ErrorScope::Stream {
                        id: *stream_id,
                        code: ErrorCode::ProtocolError,
                    }
                }
            }
            FrameError::Io(_) => ErrorScope::Transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in 0x0..=0xdu32 {
            assert_eq!(ErrorCode::from_u32(code).to_u32(), code);
        }
    }

    #[test]
    fn test_error_code_unknown_is_internal() {
        assert_eq!(ErrorCode::from_u32(0xfff), ErrorCode::InternalError);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::ProtocolError.to_string(), "PROTOCOL_ERROR");
        assert_eq!(ErrorCode::EnhanceYourCalm.to_string(), "ENHANCE_YOUR_CALM");
    }

    #[test]
    fn test_frame_too_large_scope() {
        let err = FrameError::FrameTooLarge {
            size: 17_000_000,
            max: 16_384,
        };
        assert_eq!(
            err.scope(),
            ErrorScope::Connection(ErrorCode::FrameSizeError)
        );
    }

    #[test]
    fn test_settings_length_scope_is_frame_size() {
        let err = FrameError::InvalidPayloadLength {
            frame_type: 0x4,
            expected: 0,
            actual: 6,
        };
        assert_eq!(
            err.scope(),
            ErrorScope::Connection(ErrorCode::FrameSizeError)
        );
    }

    #[test]
    fn test_rst_stream_length_scope_is_protocol() {
        let err = FrameError::InvalidPayloadLength {
            frame_type: 0x3,
            expected: 4,
            actual: 3,
        };
        assert_eq!(
            err.scope(),
            ErrorScope::Connection(ErrorCode::ProtocolError)
        );
    }

    #[test]
    fn test_empty_fragment_is_stream_scoped() {
        let err = FrameError::EmptyHeaderFragment { stream_id: 3 };
        assert_eq!(
            err.scope(),
            ErrorScope::Stream {
                id: 3,
                code: ErrorCode::ProtocolError
            }
        );
    }

    #[test]
    fn test_initial_window_setting_is_flow_control() {
        let err = FrameError::InvalidSettingValue {
            id: 0x4,
            value: 0x8000_0000,
        };
        assert_eq!(
            err.scope(),
            ErrorScope::Connection(ErrorCode::FlowControlError)
        );
    }

    #[test]
    fn test_zero_increment_scope_depends_on_stream() {
        let conn = FrameError::ZeroWindowIncrement { stream_id: 0 };
        assert_eq!(
            conn.scope(),
            ErrorScope::Connection(ErrorCode::ProtocolError)
        );

        let stream = FrameError::ZeroWindowIncrement { stream_id: 5 };
        assert_eq!(
            stream.scope(),
            ErrorScope::Stream {
                id: 5,
                code: ErrorCode::ProtocolError
            }
        );
    }

    #[test]
    fn test_io_error_is_transport_scoped() {
        let err = FrameError::Io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert_eq!(err.scope(), ErrorScope::Transport);
    }
}
