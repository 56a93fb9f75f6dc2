//! Per-stream state tracked by the serve loop.

use std::sync::Arc;

use tokio::sync::watch;

use super::flow_control::FlowControl;
use super::pipe::Pipe;

/// Stream state (draft-14 section 5.1, the server-side subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not yet used. Implicitly closed when a higher id opens.
    Idle,
    /// Open for both directions.
    Open,
    /// We sent END_STREAM; only the peer may still send.
    HalfClosedLocal,
    /// Peer sent END_STREAM; only we may still send.
    HalfClosedRemote,
    Closed,
}

/// Fires when the stream reaches the closed state.
///
/// The serve loop owns the sender; handler-side objects (response
/// writer, body reader, close notifier) hold subscribed receivers.
#[derive(Debug)]
pub struct CloseWaiter {
    tx: watch::Sender<bool>,
}

impl CloseWaiter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn close(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for CloseWaiter {
    fn default() -> Self {
        Self::new()
    }
}

/// A request stream as seen by the serve loop.
///
/// Only the bookkeeping the loop needs lives here; the bulk of the
/// response state is owned by the handler task's response writer. The
/// flow counter and body pipe are shared with that task.
#[derive(Debug)]
pub struct Stream {
    pub id: u32,
    pub state: StreamState,
    /// Limits DATA written from the handler to the client.
    pub flow: Arc<FlowControl>,
    /// Present iff the peer may still send DATA.
    pub body: Option<Arc<Pipe>>,
    pub cw: CloseWaiter,
    /// Body bytes seen so far.
    pub body_bytes: i64,
    /// Declared Content-Length, or -1 if undeclared.
    pub decl_body_bytes: i64,
    /// We emitted RST_STREAM for this stream.
    pub sent_reset: bool,
    /// The peer reset this stream.
    pub got_reset: bool,
}

impl Stream {
    pub fn new(id: u32, initial_window_size: i32) -> Self {
        Self {
            id,
            state: StreamState::Open,
            flow: Arc::new(FlowControl::new(initial_window_size)),
            body: None,
            cw: CloseWaiter::new(),
            body_bytes: 0,
            decl_body_bytes: -1,
            sent_reset: false,
            got_reset: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stream_defaults() {
        let stream = Stream::new(1, 65_535);
        assert_eq!(stream.state, StreamState::Open);
        assert_eq!(stream.flow.available(), 65_535);
        assert!(stream.body.is_none());
        assert_eq!(stream.decl_body_bytes, -1);
        assert!(!stream.sent_reset);
        assert!(!stream.got_reset);
    }

    #[tokio::test]
    async fn test_close_waiter_observed_by_subscribers() {
        let cw = CloseWaiter::new();
        let mut rx = cw.subscribe();
        assert!(!*rx.borrow());

        cw.close();
        rx.wait_for(|closed| *closed).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_waiter_late_subscriber_sees_close() {
        let cw = CloseWaiter::new();
        cw.close();
        let mut rx = cw.subscribe();
        // wait_for returns immediately when already closed.
        rx.wait_for(|closed| *closed).await.unwrap();
    }
}
