//! The request view handed to handlers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::connection::{FrameWriteMsg, HeaderMap, Pipe, PipeError, WriteFrame};

/// An incoming HTTP/2 request.
///
/// Built by the serve loop once a header block completes, and handed
/// to the handler together with a response writer.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    /// The `:path` pseudo-header, verbatim (including any query).
    pub path: String,
    pub scheme: String,
    /// The `:authority` pseudo-header, or the `Host` header when the
    /// pseudo is absent.
    pub host: String,
    pub headers: HeaderMap,
    /// Declared body length, or -1 when a body is present but
    /// undeclared. 0 when the stream carried END_STREAM.
    pub content_length: i64,
    /// Always "HTTP/2.0".
    pub proto: &'static str,
    pub remote_addr: Option<SocketAddr>,
    pub body: RequestBody,
}

/// The readable request body.
///
/// Reads drain the stream's body pipe. Consumed bytes are returned to
/// the peer as WINDOW_UPDATE credit for both the stream and the
/// connection, and the first read triggers the 100-continue interim
/// response when the client asked for one.
#[derive(Debug)]
pub struct RequestBody {
    stream_id: u32,
    pipe: Option<Arc<Pipe>>,
    needs_continue: bool,
    closed: bool,
    writes: mpsc::Sender<FrameWriteMsg>,
    done: watch::Receiver<bool>,
}

impl RequestBody {
    pub(crate) fn new(
        stream_id: u32,
        pipe: Option<Arc<Pipe>>,
        needs_continue: bool,
        writes: mpsc::Sender<FrameWriteMsg>,
        done: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream_id,
            pipe,
            needs_continue,
            closed: false,
            writes,
            done,
        }
    }

    /// Read body bytes. Returns `Ok(0)` at end-of-stream; a truncated
    /// or reset body surfaces as an error.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.needs_continue {
            self.needs_continue = false;
            let stream_id = self.stream_id;
            self.send(WriteFrame::Continue100 { stream_id }, Some(stream_id))
                .await;
        }
        let Some(pipe) = self.pipe.clone() else {
            return Ok(0);
        };
        if self.closed {
            return Err(io::Error::other(PipeError::ClosedByHandler));
        }
        match pipe.read(buf).await {
            Ok(0) => Ok(0),
            Ok(n) => {
                self.send_window_update(n).await;
                Ok(n)
            }
            Err(e) => Err(io::Error::other(e)),
        }
    }

    /// Read the remainder of the body to its end.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Stop accepting body data. Later peer DATA on this stream is
    /// surfaced to the serve loop as a write into a closed pipe.
    pub fn close(&mut self) {
        if let Some(pipe) = &self.pipe {
            pipe.close(Err(PipeError::ClosedByHandler));
        }
        self.closed = true;
    }

    /// Return `n` consumed bytes as window credit for the stream and
    /// the connection.
    async fn send_window_update(&mut self, n: usize) {
        let stream_id = self.stream_id;
        let mut left = n as u64;
        const MAX_INCREMENT: u64 = 0x7FFF_FFFF;
        while left > 0 {
            let increment = left.min(MAX_INCREMENT) as u32;
            left -= increment as u64;
            self.send(
                WriteFrame::WindowUpdate {
                    stream_id,
                    increment,
                },
                Some(stream_id),
            )
            .await;
            self.send(
                WriteFrame::WindowUpdate {
                    stream_id: 0,
                    increment,
                },
                None,
            )
            .await;
        }
    }

    /// Submit a frame-write request, giving up when the connection is
    /// torn down.
    async fn send(&mut self, write: WriteFrame, owner: Option<u32>) {
        let msg = FrameWriteMsg {
            write,
            stream_id: owner,
            done: None,
        };
        tokio::select! {
            res = self.writes.send(msg) => {
                let _ = res;
            }
            _ = self.done.wait_for(|done| *done) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;

    fn body_with_pipe(pipe: Option<Arc<Pipe>>) -> (RequestBody, mpsc::Receiver<FrameWriteMsg>) {
        let (tx, rx) = mpsc::channel(8);
        let (done_tx, done_rx) = watch::channel(false);
        // Keep the sender alive so "done" never fires mid-test.
        std::mem::forget(done_tx);
        (RequestBody::new(1, pipe, false, tx, done_rx), rx)
    }

    #[tokio::test]
    async fn test_bodyless_request_reads_eof() {
        let (mut body, _rx) = body_with_pipe(None);
        let mut buf = [0u8; 8];
        assert_eq!(body.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_returns_window_credit() {
        let pipe = Arc::new(Pipe::new(1024));
        pipe.write(b"abcd").unwrap();
        pipe.close(Ok(()));

        let (mut body, mut rx) = body_with_pipe(Some(pipe));
        let mut buf = [0u8; 8];
        assert_eq!(body.read(&mut buf).await.unwrap(), 4);

        // One update for the stream, one for the connection.
        let first = rx.recv().await.unwrap();
        match first.write {
            WriteFrame::WindowUpdate {
                stream_id,
                increment,
            } => {
                assert_eq!(stream_id, 1);
                assert_eq!(increment, 4);
            }
            other => panic!("expected WINDOW_UPDATE, got {:?}", other),
        }
        assert_eq!(first.stream_id, Some(1));

        let second = rx.recv().await.unwrap();
        match second.write {
            WriteFrame::WindowUpdate { stream_id, .. } => assert_eq!(stream_id, 0),
            other => panic!("expected WINDOW_UPDATE, got {:?}", other),
        }
        assert_eq!(second.stream_id, None);
    }

    #[tokio::test]
    async fn test_first_read_sends_continue() {
        let pipe = Arc::new(Pipe::new(1024));
        pipe.close(Ok(()));
        let (tx, mut rx) = mpsc::channel(8);
        let (done_tx, done_rx) = watch::channel(false);
        std::mem::forget(done_tx);
        let mut body = RequestBody::new(3, Some(pipe), true, tx, done_rx);

        let mut buf = [0u8; 8];
        assert_eq!(body.read(&mut buf).await.unwrap(), 0);
        let msg = rx.recv().await.unwrap();
        assert!(matches!(
            msg.write,
            WriteFrame::Continue100 { stream_id: 3 }
        ));
    }

    #[tokio::test]
    async fn test_read_after_close_fails() {
        let pipe = Arc::new(Pipe::new(1024));
        let (mut body, _rx) = body_with_pipe(Some(pipe));
        body.close();
        let mut buf = [0u8; 8];
        assert!(body.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_read_to_end_collects_all() {
        let pipe = Arc::new(Pipe::new(1024));
        pipe.write(b"hello ").unwrap();
        pipe.write(b"world").unwrap();
        pipe.close(Ok(()));

        let (mut body, mut rx) = body_with_pipe(Some(pipe));
        let mut out = Vec::new();
        assert_eq!(body.read_to_end(&mut out).await.unwrap(), 11);
        assert_eq!(out, b"hello world");
        // Credit flowed back for the consumed bytes.
        assert!(rx.recv().await.is_some());
    }
}
