//! Frame-write requests and the write scheduler queue.
//!
//! Handlers and the serve loop submit [`FrameWriteMsg`]s; the serve
//! loop's selection policy decides which frame the single in-flight
//! writer emits next (GOAWAY first, then a pending SETTINGS ack, then
//! queue order, then a flush of the buffered writer).

use std::collections::VecDeque;
use std::io;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

use super::headers::HeaderMap;
use crate::frame::{DEFAULT_MAX_FRAME_SIZE, ErrorCode, FrameWriter, Setting};

/// Response HEADERS payload produced by a handler's response writer.
#[derive(Debug)]
pub(crate) struct ResponseHeaders {
    pub stream_id: u32,
    pub status: u16,
    /// Snapshot of the handler's header map at WriteHeader time.
    pub header: HeaderMap,
    pub end_stream: bool,
    /// Implicit Content-Type, sniffed when the handler set none.
    pub content_type: Option<String>,
    /// Implicit Content-Length, known when the handler finished early.
    pub content_length: Option<String>,
}

/// One frame to be written, described as data rather than bytes so the
/// writer task can encode it against the connection's HPACK state.
#[derive(Debug)]
pub(crate) enum WriteFrame {
    Settings(Vec<Setting>),
    SettingsAck,
    PingAck([u8; 8]),
    GoAway {
        max_stream_id: u32,
        code: ErrorCode,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Headers(ResponseHeaders),
    Continue100 {
        stream_id: u32,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    /// Synthetic step that pushes buffered bytes to the transport.
    Flush,
}

impl WriteFrame {
    /// Whether this write carries END_STREAM for its owning stream.
    pub fn ends_stream(&self) -> bool {
        match self {
            WriteFrame::Data { end_stream, .. } => *end_stream,
            WriteFrame::Headers(h) => h.end_stream,
            _ => false,
        }
    }

    /// Encode and emit this frame on the writer.
    pub async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        fw: &mut FrameWriter<W>,
    ) -> io::Result<()> {
        match self {
            WriteFrame::Settings(settings) => fw.write_settings(settings).await,
            WriteFrame::SettingsAck => fw.write_settings_ack().await,
            WriteFrame::PingAck(data) => fw.write_ping(true, *data).await,
            WriteFrame::GoAway {
                max_stream_id,
                code,
            } => fw.write_goaway(*max_stream_id, *code, b"").await,
            WriteFrame::RstStream { stream_id, code } => {
                fw.write_rst_stream(*stream_id, *code).await
            }
            WriteFrame::WindowUpdate {
                stream_id,
                increment,
            } => fw.write_window_update(*stream_id, *increment).await,
            WriteFrame::Headers(h) => {
                let fields = h.encode_fields();
                fw.write_headers(
                    h.stream_id,
                    fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())),
                    h.end_stream,
                )
                .await
            }
            WriteFrame::Continue100 { stream_id } => {
                let fields: [(&[u8], &[u8]); 1] = [(b":status", b"100")];
                fw.write_headers(*stream_id, fields, false).await
            }
            WriteFrame::Data {
                stream_id,
                data,
                end_stream,
            } => fw.write_data(*stream_id, data, *end_stream).await,
            WriteFrame::Flush => fw.flush().await,
        }
    }
}

impl ResponseHeaders {
    /// Field list in wire order: `:status` first, then the snapshot
    /// headers with lowercased names, then the implicit fields.
    fn encode_fields(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut fields = Vec::with_capacity(self.header.len() + 3);
        fields.push((
            b":status".to_vec(),
            self.status.to_string().into_bytes(),
        ));
        for (name, values) in self.header.iter() {
            let wire_name = name.to_ascii_lowercase().into_bytes();
            for value in values {
                fields.push((wire_name.clone(), value.clone().into_bytes()));
            }
        }
        if let Some(ctype) = &self.content_type {
            fields.push((b"content-type".to_vec(), ctype.clone().into_bytes()));
        }
        if let Some(clen) = &self.content_length {
            fields.push((b"content-length".to_vec(), clen.clone().into_bytes()));
        }
        fields
    }
}

/// A frame-write request: the frame, the stream that owns it (for
/// state bookkeeping and drop-on-closed semantics), and an optional
/// completion channel the handler blocks on.
#[derive(Debug)]
pub(crate) struct FrameWriteMsg {
    pub write: WriteFrame,
    /// Owning stream, set only for handler-originated writes.
    pub stream_id: Option<u32>,
    pub done: Option<oneshot::Sender<io::Result<()>>>,
}

impl FrameWriteMsg {
    pub fn control(write: WriteFrame) -> Self {
        Self {
            write,
            stream_id: None,
            done: None,
        }
    }
}

/// FIFO of pending frame writes.
///
/// Not priority-aware: stream weights are parsed and dropped. The
/// GOAWAY and SETTINGS-ack preemptions live in the serve loop's
/// selection step, not here.
#[derive(Debug)]
pub(crate) struct WriteScheduler {
    queue: VecDeque<FrameWriteMsg>,
    /// The peer's MAX_FRAME_SIZE, tracked for frames sized after the
    /// setting arrives.
    pub max_frame_size: u32,
}

impl WriteScheduler {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn add(&mut self, wm: FrameWriteMsg) {
        self.queue.push_back(wm);
    }

    pub fn take(&mut self) -> Option<FrameWriteMsg> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_is_fifo() {
        let mut sched = WriteScheduler::new();
        assert!(sched.is_empty());

        sched.add(FrameWriteMsg::control(WriteFrame::PingAck([0; 8])));
        sched.add(FrameWriteMsg::control(WriteFrame::WindowUpdate {
            stream_id: 1,
            increment: 10,
        }));

        assert!(matches!(
            sched.take().unwrap().write,
            WriteFrame::PingAck(_)
        ));
        assert!(matches!(
            sched.take().unwrap().write,
            WriteFrame::WindowUpdate { .. }
        ));
        assert!(sched.take().is_none());
    }

    #[test]
    fn test_ends_stream() {
        assert!(WriteFrame::Data {
            stream_id: 1,
            data: Bytes::new(),
            end_stream: true
        }
        .ends_stream());
        assert!(!WriteFrame::Data {
            stream_id: 1,
            data: Bytes::new(),
            end_stream: false
        }
        .ends_stream());
        assert!(!WriteFrame::PingAck([0; 8]).ends_stream());
        assert!(!WriteFrame::Continue100 { stream_id: 1 }.ends_stream());
    }

    #[test]
    fn test_response_header_field_order() {
        let mut header = HeaderMap::new();
        header.add("Foo-Bar", "v");
        let rh = ResponseHeaders {
            stream_id: 1,
            status: 200,
            header,
            end_stream: false,
            content_type: Some("text/plain".to_string()),
            content_length: Some("5".to_string()),
        };
        let fields = rh.encode_fields();
        assert_eq!(fields[0].0, b":status");
        assert_eq!(fields[0].1, b"200");
        // Wire names are lowercase.
        assert!(fields.iter().any(|(n, v)| n == b"foo-bar" && v == b"v"));
        assert_eq!(fields[fields.len() - 2].0, b"content-type");
        assert_eq!(fields[fields.len() - 1].0, b"content-length");
    }
}
