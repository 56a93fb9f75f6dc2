//! Request-body pipe between the serve loop and a handler.

use std::fmt;
use std::sync::Mutex;

use bytes::{Buf, BytesMut};
use tokio::sync::Notify;

use crate::frame::ErrorCode;

/// Why a pipe stopped accepting data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    /// The connection was torn down under the stream.
    #[error("client disconnected")]
    ClientDisconnected,
    /// The handler closed the body without draining it.
    #[error("body closed by handler")]
    ClosedByHandler,
    /// The client reset the stream.
    #[error("stream reset by client: {0}")]
    Reset(ErrorCode),
    /// The stream was terminated by a local protocol error.
    #[error("stream error: {0}")]
    StreamError(ErrorCode),
    /// The peer sent more than its declared Content-Length.
    #[error("sender tried to send more than declared Content-Length of {declared} bytes")]
    TooMuchData { declared: i64 },
    /// The body ended short of the declared Content-Length.
    #[error("request declared a Content-Length of {declared} but only wrote {got} bytes")]
    TooLittleData { declared: i64, got: i64 },
}

enum PipeState {
    Open,
    /// Closed cleanly; reads return 0 once drained.
    Eof,
    /// Closed with an error; reads fail once drained.
    Broken(PipeError),
}

impl fmt::Debug for PipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeState::Open => f.write_str("Open"),
            PipeState::Eof => f.write_str("Eof"),
            PipeState::Broken(e) => write!(f, "Broken({e})"),
        }
    }
}

struct PipeInner {
    buf: BytesMut,
    state: PipeState,
}

/// A bounded in-memory byte pipe.
///
/// The serve loop writes decoded DATA payloads in without blocking;
/// the handler reads them out, waiting when the pipe is empty. The
/// capacity matches the receive window advertised to the peer, so a
/// conforming client can never overfill it.
pub struct Pipe {
    inner: Mutex<PipeInner>,
    readable: Notify,
    capacity: usize,
}

impl Pipe {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PipeInner {
                buf: BytesMut::new(),
                state: PipeState::Open,
            }),
            readable: Notify::new(),
            capacity,
        }
    }

    /// Append `data` to the pipe. Fails when the pipe is closed or
    /// when the peer has overrun the advertised window.
    pub fn write(&self, data: &[u8]) -> Result<usize, PipeError> {
        let mut inner = self.inner.lock().unwrap();
        match &inner.state {
            PipeState::Open => {}
            PipeState::Eof => return Err(PipeError::ClosedByHandler),
            PipeState::Broken(e) => return Err(e.clone()),
        }
        if inner.buf.len() + data.len() > self.capacity {
            return Err(PipeError::StreamError(ErrorCode::FlowControlError));
        }
        inner.buf.extend_from_slice(data);
        drop(inner);
        self.readable.notify_one();
        Ok(data.len())
    }

    /// Close the pipe. `Ok(())` means end-of-stream; an error is
    /// surfaced to the reader after any buffered data drains. The
    /// first close wins.
    pub fn close(&self, status: Result<(), PipeError>) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, PipeState::Open) {
            inner.state = match status {
                Ok(()) => PipeState::Eof,
                Err(e) => PipeState::Broken(e),
            };
        }
        drop(inner);
        self.readable.notify_one();
    }

    /// Read buffered data, waiting while the pipe is open and empty.
    /// Returns `Ok(0)` at end-of-stream.
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, PipeError> {
        loop {
            let notified = self.readable.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if !inner.buf.is_empty() {
                    let n = dst.len().min(inner.buf.len());
                    inner.buf.copy_to_slice(&mut dst[..n]);
                    return Ok(n);
                }
                match &inner.state {
                    PipeState::Open => {}
                    PipeState::Eof => return Ok(0),
                    PipeState::Broken(e) => return Err(e.clone()),
                }
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Pipe")
            .field("buffered", &inner.buf.len())
            .field("state", &inner.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_then_read() {
        let pipe = Pipe::new(1024);
        pipe.write(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = pipe.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_read_waits_for_data() {
        let pipe = Arc::new(Pipe::new(1024));
        let reader = {
            let pipe = pipe.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                let n = pipe.read(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        pipe.write(b"data").unwrap();
        assert_eq!(reader.await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_eof_after_drain() {
        let pipe = Pipe::new(1024);
        pipe.write(b"tail").unwrap();
        pipe.close(Ok(()));

        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf).await.unwrap(), 4);
        assert_eq!(pipe.read(&mut buf).await.unwrap(), 0);
        assert_eq!(pipe.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_error_surfaces_after_drain() {
        let pipe = Pipe::new(1024);
        pipe.write(b"tail").unwrap();
        pipe.close(Err(PipeError::ClientDisconnected));

        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf).await.unwrap(), 4);
        assert_eq!(
            pipe.read(&mut buf).await.unwrap_err(),
            PipeError::ClientDisconnected
        );
    }

    #[tokio::test]
    async fn test_first_close_wins() {
        let pipe = Pipe::new(1024);
        pipe.close(Err(PipeError::TooMuchData { declared: 5 }));
        pipe.close(Ok(()));

        let mut buf = [0u8; 16];
        assert!(matches!(
            pipe.read(&mut buf).await.unwrap_err(),
            PipeError::TooMuchData { declared: 5 }
        ));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let pipe = Pipe::new(1024);
        pipe.close(Ok(()));
        assert_eq!(
            pipe.write(b"x").unwrap_err(),
            PipeError::ClosedByHandler
        );
    }

    #[tokio::test]
    async fn test_capacity_overrun_rejected() {
        let pipe = Pipe::new(4);
        pipe.write(b"1234").unwrap();
        assert!(matches!(
            pipe.write(b"5").unwrap_err(),
            PipeError::StreamError(ErrorCode::FlowControlError)
        ));
    }

    #[tokio::test]
    async fn test_error_message_texts() {
        assert_eq!(
            PipeError::ClientDisconnected.to_string(),
            "client disconnected"
        );
        assert_eq!(
            PipeError::TooLittleData {
                declared: 10,
                got: 3
            }
            .to_string(),
            "request declared a Content-Length of 10 but only wrote 3 bytes"
        );
    }
}
