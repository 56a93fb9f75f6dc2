//! The per-stream response writer handlers write into.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::{FlowControl, FrameWriteMsg, HeaderMap, ResponseHeaders, WriteFrame};
use crate::frame;

/// Handler output is buffered through chunks of this size.
const HANDLER_CHUNK_WRITE_SIZE: usize = 4096;

/// Largest DATA payload we emit. Matches the protocol's minimum
/// MAX_FRAME_SIZE, which every peer accepts.
const MAX_DATA_FRAME: usize = frame::DEFAULT_MAX_FRAME_SIZE as usize;

fn client_disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

fn stream_broken() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream broken")
}

/// Buffered response sink for one request stream.
///
/// The first chunk written (or an explicit [`flush`]) emits the
/// response HEADERS frame: status, the snapshot of the handler's
/// header map, an implicit `Content-Type` sniffed from the chunk, and
/// an implicit `Content-Length` when the whole body is already known.
/// Subsequent chunks become DATA frames, each gated on the stream and
/// connection send windows. Handler completion flushes the buffer and
/// ends the stream.
///
/// [`flush`]: ResponseWriter::flush
#[derive(Debug)]
pub struct ResponseWriter {
    stream_id: u32,
    writes: mpsc::Sender<FrameWriteMsg>,
    done: watch::Receiver<bool>,
    cw: watch::Receiver<bool>,
    stream_flow: Arc<FlowControl>,
    conn_flow: Arc<FlowControl>,

    handler_header: HeaderMap,
    /// Snapshot of `handler_header` at write_header time; later
    /// mutations by the handler do not affect the sent response.
    snap_header: HeaderMap,
    status: u16,
    wrote_header: bool,
    sent_header: bool,
    handler_done: bool,
    buf: Vec<u8>,
}

impl ResponseWriter {
    pub(crate) fn new(
        stream_id: u32,
        writes: mpsc::Sender<FrameWriteMsg>,
        done: watch::Receiver<bool>,
        cw: watch::Receiver<bool>,
        stream_flow: Arc<FlowControl>,
        conn_flow: Arc<FlowControl>,
    ) -> Self {
        Self {
            stream_id,
            writes,
            done,
            cw,
            stream_flow,
            conn_flow,
            handler_header: HeaderMap::new(),
            snap_header: HeaderMap::new(),
            status: 0,
            wrote_header: false,
            sent_header: false,
            handler_done: false,
            buf: Vec::with_capacity(HANDLER_CHUNK_WRITE_SIZE),
        }
    }

    /// The mutable response header map. Changes after the status line
    /// has been written are not sent.
    pub fn header(&mut self) -> &mut HeaderMap {
        &mut self.handler_header
    }

    /// Set the response status. The first call wins; writing body
    /// bytes implies status 200.
    pub fn write_header(&mut self, status: u16) {
        if !self.wrote_header {
            self.wrote_header = true;
            self.status = status;
            self.snap_header = self.handler_header.clone();
        }
    }

    /// Fires when the stream or connection is torn down.
    pub fn close_notify(&self) -> watch::Receiver<bool> {
        self.cw.clone()
    }

    /// Write body bytes through the chunk buffer.
    pub async fn write(&mut self, mut p: &[u8]) -> io::Result<usize> {
        if !self.wrote_header {
            self.write_header(200);
        }
        let total = p.len();
        while !p.is_empty() {
            // Large writes bypass the buffer once it is empty.
            if self.buf.is_empty() && p.len() >= HANDLER_CHUNK_WRITE_SIZE {
                self.write_chunk(p).await?;
                break;
            }
            let take = (HANDLER_CHUNK_WRITE_SIZE - self.buf.len()).min(p.len());
            self.buf.extend_from_slice(&p[..take]);
            p = &p[take..];
            if self.buf.len() == HANDLER_CHUNK_WRITE_SIZE {
                self.flush_buffer().await?;
            }
        }
        Ok(total)
    }

    pub async fn write_str(&mut self, s: &str) -> io::Result<usize> {
        self.write(s.as_bytes()).await
    }

    /// Force out buffered bytes, emitting the HEADERS frame if it has
    /// not been sent yet.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.flush_inner().await
    }

    /// Called by the connection after the handler returns: emit the
    /// final DATA frame with END_STREAM (possibly zero-length).
    pub(crate) async fn finish(&mut self) {
        self.handler_done = true;
        // A teardown mid-flush is already reflected on the wire;
        // there is nobody left to report it to.
        let _ = self.flush_inner().await;
    }

    async fn flush_inner(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.flush_buffer().await
        } else {
            self.write_chunk(&[]).await
        }
    }

    async fn flush_buffer(&mut self) -> io::Result<()> {
        let chunk = std::mem::take(&mut self.buf);
        let res = self.write_chunk(&chunk).await;
        self.buf = chunk;
        self.buf.clear();
        res
    }

    async fn write_chunk(&mut self, p: &[u8]) -> io::Result<()> {
        if !self.wrote_header {
            self.write_header(200);
        }
        if !self.sent_header {
            self.sent_header = true;
            let content_length =
                if self.handler_done && self.snap_header.get("Content-Length").is_none() {
                    Some(p.len().to_string())
                } else {
                    None
                };
            let content_type = if self.snap_header.get("Content-Type").is_none() {
                Some(detect_content_type(p).to_string())
            } else {
                None
            };
            let end_stream = self.handler_done && p.is_empty();
            let headers = ResponseHeaders {
                stream_id: self.stream_id,
                status: self.status,
                header: self.snap_header.clone(),
                end_stream,
                content_type,
                content_length,
            };
            self.send_and_wait(WriteFrame::Headers(headers)).await?;
            if end_stream {
                return Ok(());
            }
        }
        if p.is_empty() && !self.handler_done {
            return Ok(());
        }
        if p.is_empty() {
            // Zero-length DATA carrying END_STREAM.
            return self
                .send_and_wait(WriteFrame::Data {
                    stream_id: self.stream_id,
                    data: Bytes::new(),
                    end_stream: true,
                })
                .await;
        }

        let mut rest = p;
        while !rest.is_empty() {
            let want = rest.len().min(MAX_DATA_FRAME) as i32;
            let n = self.acquire_window(want).await? as usize;
            let data = Bytes::copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            let end_stream = self.handler_done && rest.is_empty();
            self.send_and_wait(WriteFrame::Data {
                stream_id: self.stream_id,
                data,
                end_stream,
            })
            .await?;
        }
        Ok(())
    }

    /// Wait for at least one byte of send window on both the stream
    /// and the connection, then debit and return the usable amount.
    async fn acquire_window(&mut self, want: i32) -> io::Result<i32> {
        let stream_flow = self.stream_flow.clone();
        let conn_flow = self.conn_flow.clone();

        let n = tokio::select! {
            n = stream_flow.take(want) => n,
            _ = self.done.wait_for(|done| *done) => return Err(client_disconnected()),
            _ = self.cw.wait_for(|closed| *closed) => return Err(stream_broken()),
        };
        let m = tokio::select! {
            m = conn_flow.take(n) => m,
            _ = self.done.wait_for(|done| *done) => {
                stream_flow.add(n);
                return Err(client_disconnected());
            }
            _ = self.cw.wait_for(|closed| *closed) => {
                stream_flow.add(n);
                return Err(stream_broken());
            }
        };
        // Credit back what the connection window would not cover.
        if m < n {
            stream_flow.add(n - m);
        }
        Ok(m)
    }

    /// Submit a frame-write request and block until the frame is on
    /// the wire (or the stream/connection went away).
    async fn send_and_wait(&mut self, write: WriteFrame) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = FrameWriteMsg {
            write,
            stream_id: Some(self.stream_id),
            done: Some(tx),
        };
        tokio::select! {
            res = self.writes.send(msg) => {
                if res.is_err() {
                    return Err(client_disconnected());
                }
            }
            _ = self.done.wait_for(|done| *done) => return Err(client_disconnected()),
        }
        tokio::select! {
            // Prefer the write's own result when it raced teardown.
            biased;
            res = rx => match res {
                Ok(res) => res,
                Err(_) => Err(client_disconnected()),
            },
            _ = self.done.wait_for(|done| *done) => Err(client_disconnected()),
            _ = self.cw.wait_for(|closed| *closed) => Err(stream_broken()),
        }
    }
}

/// Sniff an implicit Content-Type from the first body chunk.
///
/// A compact cousin of the WHATWG algorithm: well-known binary
/// signatures, then a text/binary split on the first 512 bytes.
fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(512)];
    let trimmed = {
        let start = data
            .iter()
            .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
            .unwrap_or(data.len());
        &data[start..]
    };

    let html_prefixes: [&[u8]; 6] = [
        b"<!DOCTYPE HTML",
        b"<HTML",
        b"<HEAD",
        b"<BODY",
        b"<SCRIPT",
        b"<!--",
    ];
    for prefix in html_prefixes {
        if trimmed.len() >= prefix.len() && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix) {
            return "text/html; charset=utf-8";
        }
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if data.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if data.starts_with(b"\xff\xd8\xff") {
        return "image/jpeg";
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    if data.starts_with(b"PK\x03\x04") {
        return "application/zip";
    }
    if data.starts_with(b"\x1f\x8b\x08") {
        return "application/x-gzip";
    }

    let binary = data
        .iter()
        .any(|&b| b < 0x09 || ((0x0e..0x20).contains(&b) && b != 0x1b) || b == 0x7f);
    if binary {
        "application/octet-stream"
    } else {
        "text/plain; charset=utf-8"
    }
}
