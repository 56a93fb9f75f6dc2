//! HTTP/2 server connection engine.
//!
//! One task per connection owns every piece of mutable connection
//! state: the stream map, flow-control windows, header-decode state,
//! the write scheduler, and the GOAWAY lifecycle. Three cooperating
//! actors feed it over channels:
//!
//! - the *reader task* parses one frame at a time and waits on a
//!   per-frame gate before reading the next, because frame payloads
//!   borrow the reader's single slab;
//! - the *writer task* (at most one in flight) emits one frame and
//!   hands the frame writer back with a completion signal;
//! - *handler tasks* (one per request stream) submit frame-write
//!   requests and consume the body pipe.
//!
//! The serve loop itself never blocks on I/O; it only suspends in its
//! channel/timer select.

mod flow_control;
mod headers;
mod pipe;
mod scheduler;
mod settings;
mod stream;

pub use flow_control::FlowControl;
pub use headers::HeaderMap;
pub use pipe::{Pipe, PipeError};
pub use settings::ConnectionSettings;
pub use stream::{CloseWaiter, Stream, StreamState};

pub(crate) use headers::{HeaderCanonicalizer, RequestParam};
pub(crate) use scheduler::{FrameWriteMsg, ResponseHeaders, WriteFrame, WriteScheduler};

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, WriteHalf};
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::time::{self, Instant};

use crate::frame::{
    self, CLIENT_PREFACE, ContinuationFrame, DataFrame, ErrorCode, ErrorScope, Frame, FrameError,
    FrameReader, FrameWriter, HeadersFrame, PingFrame, RstStreamFrame, Setting, SettingId,
    SettingsFrame, WindowUpdateFrame,
};
use crate::request::{Request, RequestBody};
use crate::response::ResponseWriter;
use crate::server::Handler;

/// How long the client has to send its 24-byte preface.
const PREFACE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long after the preface the client's first SETTINGS may take.
/// It is normally in flight together with the preface.
const FIRST_SETTINGS_TIMEOUT: Duration = Duration::from_secs(2);

/// Receive-buffer capacity per request body, matching the window we
/// advertise to the peer.
const BODY_PIPE_CAPACITY: usize = 65_536;

/// A protocol violation, scoped to the connection or to one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum H2Error {
    Connection(ErrorCode),
    Stream { id: u32, code: ErrorCode },
}

/// Message from the reader task.
enum ReaderMsg {
    /// A frame plus the gate that lets the reader reuse its slab.
    Frame(Frame, oneshot::Sender<()>),
    /// A read or parse failure. Stream-scoped parse errors are
    /// recoverable; anything else ends the reader.
    Error(FrameError),
}

/// Completion from the writer task: the writer comes back with the
/// result so the next frame can be started.
type WriteDone<S> = (FrameWriter<WriteHalf<S>>, io::Result<()>);

/// A closure executed inline on the serve loop, for tests.
pub(crate) type ServeHook<S> = Box<dyn FnOnce(&mut ServerConnection<S>) + Send>;

/// Per-connection configuration distilled from [`crate::Server`].
#[derive(Debug, Clone)]
pub(crate) struct ServeConfig {
    pub adv_max_streams: u32,
    pub max_read_frame_size: u32,
    pub handler_permits: Option<Arc<Semaphore>>,
    /// The negotiated TLS version was below 1.2; terminate with
    /// INADEQUATE_SECURITY instead of dispatching requests.
    pub inadequate_security: bool,
    pub remote_addr: Option<SocketAddr>,
}

/// All mutable state of one server connection. Owned exclusively by
/// the serve loop.
pub(crate) struct ServerConnection<S: AsyncRead + AsyncWrite> {
    remote_addr: Option<SocketAddr>,
    handler: Arc<dyn Handler>,
    handler_permits: Option<Arc<Semaphore>>,

    /// Present while no frame write is in flight.
    writer: Option<FrameWriter<WriteHalf<S>>>,
    wrote_tx: mpsc::Sender<WriteDone<S>>,
    want_write_tx: mpsc::Sender<FrameWriteMsg>,
    done_tx: watch::Sender<bool>,

    writing_frame: bool,
    /// The last started write was not a flush step.
    needs_flush: bool,
    write_sched: WriteScheduler,

    streams: HashMap<u32, Stream>,
    /// Highest stream id ever seen from the peer.
    max_stream_id: u32,
    cur_open_streams: u32,
    /// Our advertised SETTINGS_MAX_CONCURRENT_STREAMS.
    adv_max_streams: u32,
    /// The peer's settings record, updated from SETTINGS frames. Its
    /// initial window size is applied to newly opened streams.
    peer_settings: ConnectionSettings,
    /// Connection-wide send window, shared with handler tasks.
    conn_flow: Arc<FlowControl>,

    hpack_decoder: hpack::Decoder<'static>,
    /// Accumulated header-block fragments for the pending request.
    header_block: Vec<u8>,
    /// Pending request, non-empty while a header block is in progress.
    req: Option<RequestParam>,
    canon: HeaderCanonicalizer,

    saw_first_settings: bool,
    need_settings_ack: bool,
    in_goaway: bool,
    need_goaway: bool,
    goaway_code: ErrorCode,
    /// Armed when GOAWAY is scheduled; the loop tears down when it
    /// fires.
    shutdown_at: Option<Instant>,
}

/// Serve one connection. Returns when the connection is torn down.
pub(crate) async fn serve<S>(io: S, cfg: ServeConfig, handler: Arc<dyn Handler>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (_hook_tx, hook_rx) = mpsc::unbounded_channel();
    serve_with_hooks(io, cfg, handler, hook_rx).await
}

pub(crate) async fn serve_with_hooks<S>(
    io: S,
    cfg: ServeConfig,
    handler: Arc<dyn Handler>,
    mut hook_rx: mpsc::UnboundedReceiver<ServeHook<S>>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(io);

    let (want_write_tx, mut want_write_rx) = mpsc::channel::<FrameWriteMsg>(8);
    let (wrote_tx, mut wrote_rx) = mpsc::channel::<WriteDone<S>>(1);
    let (done_tx, _) = watch::channel(false);

    let mut sc = ServerConnection {
        remote_addr: cfg.remote_addr,
        handler,
        handler_permits: cfg.handler_permits.clone(),
        writer: Some(FrameWriter::new(write_half)),
        wrote_tx,
        want_write_tx,
        done_tx,
        writing_frame: false,
        needs_flush: false,
        write_sched: WriteScheduler::new(),
        streams: HashMap::new(),
        max_stream_id: 0,
        cur_open_streams: 0,
        adv_max_streams: cfg.adv_max_streams,
        peer_settings: ConnectionSettings::new(),
        conn_flow: Arc::new(FlowControl::new(frame::DEFAULT_INITIAL_WINDOW_SIZE as i32)),
        hpack_decoder: hpack::Decoder::new(),
        header_block: Vec::new(),
        req: None,
        canon: HeaderCanonicalizer::default(),
        saw_first_settings: false,
        need_settings_ack: false,
        in_goaway: false,
        need_goaway: false,
        goaway_code: ErrorCode::NoError,
        shutdown_at: None,
    };
    sc.hpack_decoder
        .set_max_table_size(frame::DEFAULT_HEADER_TABLE_SIZE as usize);

    tracing::debug!(remote = ?sc.remote_addr, "HTTP/2 connection");

    // Advertise our settings first; they ride out with the first
    // flush step once the loop starts.
    sc.write_frame(FrameWriteMsg::control(WriteFrame::Settings(vec![
        Setting {
            id: SettingId::MaxFrameSize,
            value: cfg.max_read_frame_size,
        },
        Setting {
            id: SettingId::MaxConcurrentStreams,
            value: cfg.adv_max_streams,
        },
    ])));

    match read_preface(&mut read_half).await {
        Ok(()) => tracing::trace!(remote = ?sc.remote_addr, "client preface received"),
        Err(e) => {
            tracing::debug!(remote = ?sc.remote_addr, error = %e, "error reading client preface");
            sc.teardown();
            return Ok(());
        }
    }

    let mut frame_reader = FrameReader::new(read_half);
    frame_reader.set_max_frame_size(cfg.max_read_frame_size);
    let (read_tx, mut read_rx) = mpsc::channel::<ReaderMsg>(1);
    tokio::spawn(read_frames(frame_reader, read_tx));

    if cfg.inadequate_security {
        // TLS below 1.2: refuse to dispatch anything on this
        // connection (draft-14 section 9.2).
        sc.go_away(ErrorCode::InadequateSecurity);
    }

    let mut settings_deadline = Some(Instant::now() + FIRST_SETTINGS_TIMEOUT);
    let mut reader_gone = false;

    loop {
        let shutdown_at = sc.shutdown_at;
        tokio::select! {
            Some(wm) = want_write_rx.recv() => sc.write_frame(wm),
            Some((fw, res)) = wrote_rx.recv() => sc.frame_write_done(fw, res),
            msg = read_rx.recv(), if !reader_gone => match msg {
                Some(ReaderMsg::Frame(frame, gate)) => {
                    settings_deadline = None;
                    sc.process_frame_from_reader(frame, gate);
                }
                Some(ReaderMsg::Error(err)) => {
                    if !sc.handle_read_error(err) {
                        break;
                    }
                }
                None => {
                    if sc.in_goaway {
                        // Keep draining until the shutdown timer.
                        reader_gone = true;
                    } else {
                        // Peer closed the transport: silent teardown.
                        tracing::trace!(remote = ?sc.remote_addr, "client gone");
                        break;
                    }
                }
            },
            _ = sleep_until_opt(settings_deadline), if settings_deadline.is_some() => {
                tracing::warn!(remote = ?sc.remote_addr, "timeout waiting for SETTINGS frame");
                settings_deadline = None;
                sc.go_away(ErrorCode::SettingsTimeout);
            }
            _ = sleep_until_opt(shutdown_at), if shutdown_at.is_some() => {
                tracing::debug!(remote = ?sc.remote_addr, "GOAWAY shutdown timer fired");
                break;
            }
            Some(hook) = hook_rx.recv() => hook(&mut sc),
        }
    }

    sc.teardown();
    Ok(())
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        // Guarded out by the select arm condition.
        None => std::future::pending().await,
    }
}

/// Read and verify the 24-byte client preface.
async fn read_preface<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), io::Error> {
    let read = async {
        let mut buf = [0u8; 24];
        r.read_exact(&mut buf).await?;
        if buf != CLIENT_PREFACE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bogus greeting {:?}", String::from_utf8_lossy(&buf)),
            ));
        }
        Ok(())
    };
    match time::timeout(PREFACE_TIMEOUT, read).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "timeout waiting for client preface",
        )),
    }
}

/// Reader task: parse one frame, hand it to the serve loop, and wait
/// on the gate before touching the slab again.
async fn read_frames<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    tx: mpsc::Sender<ReaderMsg>,
) {
    loop {
        match reader.read_frame().await {
            Ok(frame) => {
                let (gate_tx, gate_rx) = oneshot::channel();
                if tx.send(ReaderMsg::Frame(frame, gate_tx)).await.is_err() {
                    return;
                }
                // The serve loop owns the slab-backed payload until it
                // fires the gate.
                if gate_rx.await.is_err() {
                    return;
                }
            }
            Err(err) => {
                // A stream-scoped parse error dooms one stream but the
                // payload was fully consumed; keep reading.
                let recoverable = matches!(err.scope(), ErrorScope::Stream { .. });
                if tx.send(ReaderMsg::Error(err)).await.is_err() {
                    return;
                }
                if !recoverable {
                    return;
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> ServerConnection<S> {
    /// The state of a stream id, accounting for ids implicitly closed
    /// by the arrival of a higher one.
    fn state(&self, id: u32) -> StreamState {
        if let Some(st) = self.streams.get(&id) {
            return st.state;
        }
        if id <= self.max_stream_id {
            StreamState::Closed
        } else {
            StreamState::Idle
        }
    }

    /// Process one frame from the reader, then release the gate.
    fn process_frame_from_reader(&mut self, frame: Frame, gate: oneshot::Sender<()>) {
        tracing::trace!(header = ?frame.header(), "received frame");
        let res = self.process_frame(frame);
        // The frame (and its borrowed payload) is consumed; let the
        // reader reuse its slab.
        let _ = gate.send(());

        match res {
            Ok(()) => {}
            Err(H2Error::Stream { id, code }) => self.handle_stream_error(id, code),
            Err(H2Error::Connection(code)) => {
                tracing::debug!(remote = ?self.remote_addr, %code, "connection error");
                self.go_away(code);
            }
        }
    }

    /// Handle a failure from the reader task. Returns whether the
    /// serve loop should keep running.
    fn handle_read_error(&mut self, err: FrameError) -> bool {
        match err.scope() {
            ErrorScope::Stream { id, code } => {
                self.handle_stream_error(id, code);
                true
            }
            ErrorScope::Connection(code) => {
                tracing::debug!(remote = ?self.remote_addr, error = %err, "frame error");
                self.go_away(code);
                true
            }
            ErrorScope::Transport => {
                tracing::trace!(remote = ?self.remote_addr, error = %err, "transport error");
                false
            }
        }
    }

    fn process_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        // The first frame after the preface must be a (non-ACK)
        // SETTINGS frame.
        if !self.saw_first_settings {
            match &frame {
                Frame::Settings(f) if !f.ack => self.saw_first_settings = true,
                _ => return Err(H2Error::Connection(ErrorCode::ProtocolError)),
            }
        }

        // While a header block is open, only CONTINUATION frames on
        // the same stream may arrive.
        if let Some(pending) = &self.req {
            let ok = matches!(&frame, Frame::Continuation(f) if f.stream_id.value() == pending.stream_id);
            if !ok {
                return Err(H2Error::Connection(ErrorCode::ProtocolError));
            }
        }

        match frame {
            Frame::Settings(f) => self.process_settings(f),
            Frame::Headers(f) => self.process_headers(f),
            Frame::Continuation(f) => self.process_continuation(f),
            Frame::Data(f) => self.process_data(f),
            Frame::WindowUpdate(f) => self.process_window_update(f),
            Frame::Ping(f) => self.process_ping(f),
            Frame::RstStream(f) => self.process_rst_stream(f),
            Frame::PushPromise(_) => {
                // Clients cannot promise streams.
                Err(H2Error::Connection(ErrorCode::ProtocolError))
            }
            Frame::Priority(_) => Ok(()),
            Frame::GoAway(f) => {
                tracing::debug!(
                    last_stream_id = f.last_stream_id.value(),
                    code = %ErrorCode::from_u32(f.error_code),
                    "client sent GOAWAY"
                );
                Ok(())
            }
            Frame::Unknown(f) => {
                tracing::trace!(frame_type = f.frame_type, "ignoring unknown frame");
                Ok(())
            }
        }
    }

    fn process_settings(&mut self, f: SettingsFrame) -> Result<(), H2Error> {
        if f.ack {
            return Ok(());
        }
        for setting in &f.settings {
            self.process_setting(*setting)?;
        }
        self.need_settings_ack = true;
        self.schedule_frame_write();
        Ok(())
    }

    fn process_setting(&mut self, s: Setting) -> Result<(), H2Error> {
        tracing::trace!(?s, "processing setting");
        match s.id {
            SettingId::HeaderTableSize => {
                // Bounds our outbound HPACK table. The hpack crate's
                // encoder stays within the protocol default and does
                // not expose a way to shrink its table, so the value
                // is recorded for the settings picture only.
                self.peer_settings.header_table_size = s.value;
            }
            SettingId::EnablePush => {
                self.peer_settings.enable_push = s.value != 0;
            }
            SettingId::MaxConcurrentStreams => {
                self.peer_settings.max_concurrent_streams = s.value;
            }
            SettingId::InitialWindowSize => {
                return self.process_setting_initial_window_size(s.value);
            }
            SettingId::MaxFrameSize => {
                self.peer_settings.max_frame_size = s.value;
                self.write_sched.max_frame_size = s.value;
                if let Some(fw) = &mut self.writer {
                    fw.set_max_frame_size(s.value);
                }
            }
            SettingId::MaxHeaderListSize => {
                self.peer_settings.max_header_list_size = s.value;
            }
            SettingId::Unknown(_) => {
                // Unknown settings must be ignored.
            }
        }
        Ok(())
    }

    /// Re-base every open stream's send window on the new initial
    /// window size.
    fn process_setting_initial_window_size(&mut self, value: u32) -> Result<(), H2Error> {
        let old = self.peer_settings.initial_window_size as i32;
        self.peer_settings.initial_window_size = value;
        let growth = value as i32 - old; // may be negative
        for st in self.streams.values() {
            if !st.flow.add(growth) {
                // A post-adjustment window above 2^31-1 dooms the
                // connection (draft-14 section 6.9.2).
                return Err(H2Error::Connection(ErrorCode::FlowControlError));
            }
        }
        Ok(())
    }

    fn process_ping(&mut self, f: PingFrame) -> Result<(), H2Error> {
        if f.ack {
            // Never respond to a PING ack.
            return Ok(());
        }
        self.write_frame(FrameWriteMsg::control(WriteFrame::PingAck(f.data)));
        Ok(())
    }

    fn process_window_update(&mut self, f: WindowUpdateFrame) -> Result<(), H2Error> {
        let id = f.stream_id.value();
        if id == 0 {
            if !self.conn_flow.add(f.increment as i32) {
                return Err(H2Error::Connection(ErrorCode::FlowControlError));
            }
            return Ok(());
        }
        match self.streams.get(&id) {
            // A WINDOW_UPDATE may trail a stream we already closed;
            // that is not an error.
            None => Ok(()),
            Some(st) => {
                if !st.flow.add(f.increment as i32) {
                    return Err(H2Error::Stream {
                        id,
                        code: ErrorCode::FlowControlError,
                    });
                }
                Ok(())
            }
        }
    }

    fn process_rst_stream(&mut self, f: RstStreamFrame) -> Result<(), H2Error> {
        let id = f.stream_id.value();
        if self.state(id) == StreamState::Idle {
            // Resetting an idle stream is a connection error.
            return Err(H2Error::Connection(ErrorCode::ProtocolError));
        }
        if let Some(st) = self.streams.get_mut(&id) {
            st.got_reset = true;
        }
        if self.streams.contains_key(&id) {
            let code = ErrorCode::from_u32(f.error_code);
            tracing::debug!(stream = id, %code, "stream reset by client");
            self.close_stream(id, Err(PipeError::Reset(code)));
        }
        Ok(())
    }

    fn process_data(&mut self, f: DataFrame) -> Result<(), H2Error> {
        let id = f.stream_id.value();
        let stream_closed = H2Error::Stream {
            id,
            code: ErrorCode::StreamClosed,
        };

        let (pipe, state, end_status) = {
            let st = match self.streams.get_mut(&id) {
                Some(st)
                    if matches!(st.state, StreamState::Open | StreamState::HalfClosedLocal) =>
                {
                    st
                }
                // DATA on any other state is a STREAM_CLOSED stream
                // error.
                _ => return Err(stream_closed),
            };
            let pipe = st
                .body
                .clone()
                .expect("DATA-accepting stream without a body pipe");

            let data = f.data();
            if st.decl_body_bytes != -1 && st.body_bytes + data.len() as i64 > st.decl_body_bytes
            {
                let declared = st.decl_body_bytes;
                pipe.close(Err(PipeError::TooMuchData { declared }));
                return Err(stream_closed);
            }
            if !data.is_empty() {
                if pipe.write(data).is_err() {
                    return Err(stream_closed);
                }
                st.body_bytes += data.len() as i64;
            }
            if !f.end_stream {
                return Ok(());
            }

            let status = if st.decl_body_bytes != -1 && st.decl_body_bytes != st.body_bytes {
                Err(PipeError::TooLittleData {
                    declared: st.decl_body_bytes,
                    got: st.body_bytes,
                })
            } else {
                Ok(())
            };
            (pipe, st.state, status)
        };

        match state {
            StreamState::Open => {
                pipe.close(end_status);
                self.streams.get_mut(&id).unwrap().state = StreamState::HalfClosedRemote;
            }
            StreamState::HalfClosedLocal => {
                self.close_stream(id, end_status);
            }
            _ => unreachable!("checked above"),
        }
        Ok(())
    }

    fn process_headers(&mut self, f: HeadersFrame) -> Result<(), H2Error> {
        let id = f.stream_id.value();
        if self.in_goaway {
            // New work is refused while draining.
            return Ok(());
        }
        // Client streams are odd and strictly increasing, and a new
        // header block may not start while one is open.
        if id % 2 != 1 || id <= self.max_stream_id || self.req.is_some() {
            return Err(H2Error::Connection(ErrorCode::ProtocolError));
        }
        self.max_stream_id = id;

        let mut st = Stream::new(id, self.peer_settings.initial_window_size as i32);
        if f.end_stream {
            st.state = StreamState::HalfClosedRemote;
        }
        self.streams.insert(id, st);
        self.cur_open_streams += 1;
        self.req = Some(RequestParam::new(id));

        self.process_header_block_fragment(id, f.fragment(), f.end_headers)
    }

    fn process_continuation(&mut self, f: ContinuationFrame) -> Result<(), H2Error> {
        let id = f.stream_id.value();
        let matches_pending = self
            .req
            .as_ref()
            .is_some_and(|pending| pending.stream_id == id)
            && self.streams.contains_key(&id);
        if !matches_pending {
            return Err(H2Error::Connection(ErrorCode::ProtocolError));
        }
        self.process_header_block_fragment(id, f.fragment(), f.end_headers)
    }

    fn process_header_block_fragment(
        &mut self,
        id: u32,
        fragment: &[u8],
        end: bool,
    ) -> Result<(), H2Error> {
        self.header_block.extend_from_slice(fragment);
        if !end {
            return Ok(());
        }

        let block = std::mem::take(&mut self.header_block);
        let mut rp = self.req.take().expect("pending request present");
        let fields = self
            .hpack_decoder
            .decode(&block)
            .map_err(|e| {
                tracing::debug!(stream = id, error = ?e, "header block decode failed");
                H2Error::Connection(ErrorCode::CompressionError)
            })?;
        for (name, value) in &fields {
            rp.on_header_field(name, value, &mut self.canon);
        }

        if self.cur_open_streams > self.adv_max_streams {
            return Err(H2Error::Stream {
                id,
                code: ErrorCode::ProtocolError,
            });
        }

        self.dispatch_request(rp)
    }

    /// Validate the assembled request and spawn its handler task.
    fn dispatch_request(&mut self, rp: RequestParam) -> Result<(), H2Error> {
        let id = rp.stream_id;
        let malformed = H2Error::Stream {
            id,
            code: ErrorCode::ProtocolError,
        };

        // A request missing a required pseudo-header, carrying an
        // invalid one, or using an unknown scheme is malformed
        // (draft-14 section 8.1.2.6).
        if rp.invalid_header
            || rp.method.is_empty()
            || rp.path.is_empty()
            || (rp.scheme != "https" && rp.scheme != "http")
            || !valid_request_path(&rp.path)
        {
            return Err(malformed);
        }

        let mut header = rp.header;
        let authority = if rp.authority.is_empty() {
            header.get("Host").unwrap_or("").to_string()
        } else {
            rp.authority
        };
        let needs_continue = header.get("Expect") == Some("100-continue");
        if needs_continue {
            header.del("Expect");
        }

        let body_open = self
            .streams
            .get(&id)
            .is_some_and(|st| st.state == StreamState::Open);
        let content_length = if body_open {
            header
                .get("Content-Length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1)
        } else {
            0
        };

        let (pipe, stream_flow, cw_rx) = {
            let st = self.streams.get_mut(&id).expect("stream for pending request");
            let pipe = if body_open {
                let pipe = Arc::new(Pipe::new(BODY_PIPE_CAPACITY));
                st.body = Some(pipe.clone());
                st.decl_body_bytes = content_length;
                Some(pipe)
            } else {
                None
            };
            (pipe, st.flow.clone(), st.cw.subscribe())
        };

        let done_rx = self.done_tx.subscribe();
        let body = RequestBody::new(
            id,
            pipe,
            needs_continue,
            self.want_write_tx.clone(),
            done_rx.clone(),
        );
        let request = Request {
            method: rp.method,
            path: rp.path,
            scheme: rp.scheme,
            host: authority,
            headers: header,
            content_length,
            proto: "HTTP/2.0",
            remote_addr: self.remote_addr,
            body,
        };
        let rw = ResponseWriter::new(
            id,
            self.want_write_tx.clone(),
            done_rx,
            cw_rx,
            stream_flow,
            self.conn_flow.clone(),
        );

        let handler = self.handler.clone();
        let permits = self.handler_permits.clone();
        tokio::spawn(async move {
            let _permit = match permits {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };
            let mut rw = rw;
            handler.serve(request, &mut rw).await;
            rw.finish().await;
        });
        Ok(())
    }

    /// Terminate one stream: emit RST_STREAM and detach it.
    fn handle_stream_error(&mut self, id: u32, code: ErrorCode) {
        tracing::debug!(stream = id, %code, "stream error");
        self.write_frame(FrameWriteMsg::control(WriteFrame::RstStream {
            stream_id: id,
            code,
        }));
        if let Some(st) = self.streams.get_mut(&id) {
            st.sent_reset = true;
        }
        if self.streams.contains_key(&id) {
            self.close_stream(id, Err(PipeError::StreamError(code)));
        }
        // Rejecting the stream abandons any half-read header block.
        if self.req.as_ref().is_some_and(|rp| rp.stream_id == id) {
            self.req = None;
            self.header_block.clear();
        }
    }

    /// Move the stream to closed: detach it from the map, close its
    /// body pipe with `status`, and fire its close waiter.
    fn close_stream(&mut self, id: u32, status: Result<(), PipeError>) {
        let Some(st) = self.streams.remove(&id) else {
            return;
        };
        debug_assert!(
            !matches!(st.state, StreamState::Idle | StreamState::Closed),
            "closing a stream that is not open"
        );
        self.cur_open_streams -= 1;
        tracing::trace!(
            stream = id,
            sent_reset = st.sent_reset,
            got_reset = st.got_reset,
            "stream closed"
        );
        if let Some(pipe) = &st.body {
            pipe.close(status);
        }
        st.cw.close();
    }

    /// Begin connection shutdown: schedule a GOAWAY naming the
    /// highest stream we processed and arm the teardown timer.
    fn go_away(&mut self, code: ErrorCode) {
        if self.in_goaway {
            return;
        }
        let grace = if code != ErrorCode::NoError {
            Duration::from_millis(250)
        } else {
            Duration::from_secs(1)
        };
        self.shutdown_at = Some(Instant::now() + grace);
        self.in_goaway = true;
        self.need_goaway = true;
        self.goaway_code = code;
        self.schedule_frame_write();
    }

    /// Enqueue or immediately start a frame write.
    fn write_frame(&mut self, wm: FrameWriteMsg) {
        if !self.writing_frame && self.write_sched.is_empty() {
            if !self.try_start_frame_write(wm) {
                self.schedule_frame_write();
            }
        } else {
            self.write_sched.add(wm);
        }
    }

    /// Writer task completed; store the writer back and pick the next
    /// frame.
    fn frame_write_done(&mut self, mut fw: FrameWriter<WriteHalf<S>>, res: io::Result<()>) {
        if let Err(e) = res {
            // The read side will observe the dead transport; nothing
            // to do here beyond noting it.
            tracing::debug!(remote = ?self.remote_addr, error = %e, "frame write failed");
        }
        fw.set_max_frame_size(self.write_sched.max_frame_size);
        self.writer = Some(fw);
        self.writing_frame = false;
        self.schedule_frame_write();
    }

    /// Selection policy: GOAWAY first, then a pending SETTINGS ack,
    /// then (outside GOAWAY) the FIFO head, then a flush step.
    fn schedule_frame_write(&mut self) {
        if self.writing_frame {
            return;
        }
        loop {
            if self.need_goaway {
                self.need_goaway = false;
                let wm = FrameWriteMsg::control(WriteFrame::GoAway {
                    max_stream_id: self.max_stream_id,
                    code: self.goaway_code,
                });
                if self.try_start_frame_write(wm) {
                    return;
                }
                continue;
            }
            if self.need_settings_ack {
                self.need_settings_ack = false;
                if self.try_start_frame_write(FrameWriteMsg::control(WriteFrame::SettingsAck)) {
                    return;
                }
                continue;
            }
            if !self.in_goaway {
                if let Some(wm) = self.write_sched.take() {
                    if self.try_start_frame_write(wm) {
                        return;
                    }
                    continue;
                }
            }
            if self.needs_flush {
                self.needs_flush = false;
                let started =
                    self.try_start_frame_write(FrameWriteMsg::control(WriteFrame::Flush));
                debug_assert!(started, "flush writes have no owning stream");
                return;
            }
            return;
        }
    }

    /// Start writing `wm` unless its owning stream can no longer
    /// accept frames, in which case the request is dropped with its
    /// completion signaled. Returns whether a write was started.
    fn try_start_frame_write(&mut self, wm: FrameWriteMsg) -> bool {
        debug_assert!(!self.writing_frame, "one frame write at a time");

        if let Some(id) = wm.stream_id {
            let send_allowed = match self.streams.get(&id) {
                // Detached streams were reset or fully closed.
                None => false,
                Some(st) => st.state != StreamState::HalfClosedLocal,
            };
            if !send_allowed {
                if let Some(done) = wm.done {
                    let _ = done.send(Ok(()));
                }
                return false;
            }
            if wm.write.ends_stream() {
                match self.streams.get(&id).map(|st| st.state) {
                    Some(StreamState::Open) => {
                        self.streams.get_mut(&id).unwrap().state = StreamState::HalfClosedLocal;
                    }
                    Some(StreamState::HalfClosedRemote) => {
                        self.close_stream(id, Ok(()));
                    }
                    _ => {}
                }
            }
        }

        self.needs_flush = !matches!(wm.write, WriteFrame::Flush);
        self.writing_frame = true;

        let mut fw = self.writer.take().expect("frame writer present when idle");
        let wrote_tx = self.wrote_tx.clone();
        tokio::spawn(async move {
            let res = wm.write.write_to(&mut fw).await;
            if let Some(done) = wm.done {
                let _ = done.send(shallow_clone(&res));
            }
            let _ = wrote_tx.send((fw, res)).await;
        });
        true
    }

    /// Tear the connection down: every handler observes "client
    /// disconnected" and every stream's close waiter fires.
    fn teardown(&mut self) {
        let _ = self.done_tx.send(true);
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.close_stream(id, Err(PipeError::ClientDisconnected));
        }
        tracing::debug!(remote = ?self.remote_addr, "connection closed");
    }
}

/// io::Error does not implement Clone; reconstruct an equivalent for
/// the handler-facing completion channel.
fn shallow_clone(res: &io::Result<()>) -> io::Result<()> {
    match res {
        Ok(()) => Ok(()),
        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
    }
}

/// Accept origin-form paths, absolute URIs, and the OPTIONS asterisk.
fn valid_request_path(path: &str) -> bool {
    if path.bytes().any(|b| b.is_ascii_control() || b == b' ') {
        return false;
    }
    path == "*" || path.starts_with('/') || path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;

    struct PendingHandler;

    #[async_trait]
    impl Handler for PendingHandler {
        async fn serve(&self, _req: Request, _rw: &mut ResponseWriter) {
            std::future::pending::<()>().await
        }
    }

    /// Drive a connection far enough to open two request streams, then
    /// run a hook on the serve loop to check that the stream map and
    /// the open-stream counter agree.
    #[tokio::test]
    async fn test_stream_accounting_invariant() {
        let (client, server_io) = tokio::io::duplex(1 << 16);
        let cfg = ServeConfig {
            adv_max_streams: 250,
            max_read_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            handler_permits: None,
            inadequate_security: false,
            remote_addr: None,
        };
        let (hook_tx, hook_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_with_hooks(
            server_io,
            cfg,
            Arc::new(PendingHandler),
            hook_rx,
        ));

        let (_client_r, client_w) = tokio::io::split(client);
        let mut client_w = client_w;
        client_w.write_all(CLIENT_PREFACE).await.unwrap();
        // Empty SETTINGS, then two GET requests.
        client_w
            .write_all(&[0, 0, 0, 0x4, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut enc = hpack::Encoder::new();
        for id in [1u32, 3] {
            let block = enc.encode(vec![
                (b":method".as_slice(), b"GET".as_slice()),
                (b":path".as_slice(), b"/".as_slice()),
                (b":scheme".as_slice(), b"https".as_slice()),
                (b":authority".as_slice(), b"x".as_slice()),
            ]);
            let mut bytes = vec![
                0,
                0,
                block.len() as u8,
                0x1,
                frame::flags::END_HEADERS | frame::flags::END_STREAM,
            ];
            bytes.extend_from_slice(&id.to_be_bytes());
            bytes.extend_from_slice(&block);
            client_w.write_all(&bytes).await.unwrap();
        }

        // Let the serve loop ingest the frames, then inspect it.
        time::sleep(Duration::from_millis(50)).await;
        let (seen_tx, seen_rx) = oneshot::channel();
        hook_tx
            .send(Box::new(move |sc| {
                let _ = seen_tx.send((sc.streams.len() as u32, sc.cur_open_streams));
            }))
            .unwrap();
        let (map_len, open) = seen_rx.await.unwrap();
        assert_eq!(map_len, open);
        assert_eq!(open, 2);
    }

    #[test]
    fn test_valid_request_path() {
        assert!(valid_request_path("/"));
        assert!(valid_request_path("/index.html?q=1"));
        assert!(valid_request_path("*"));
        assert!(valid_request_path("https://example.com/x"));
        assert!(!valid_request_path("index.html"));
        assert!(!valid_request_path("/has space"));
        assert!(!valid_request_path("/ctl\x01char"));
        assert!(!valid_request_path(""));
    }

    #[test]
    fn test_shallow_clone_preserves_kind() {
        let err: io::Result<()> = Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let cloned = shallow_clone(&err);
        assert_eq!(cloned.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert!(shallow_clone(&Ok(())).is_ok());
    }
}
