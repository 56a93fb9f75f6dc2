//! Embedding surface: server options, TLS/ALPN registration, and the
//! per-connection entry points.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio_rustls::rustls::{ProtocolVersion, ServerConfig};
use tokio_rustls::server::TlsStream;

use crate::connection::{self, ServeConfig};
use crate::frame;
use crate::request::Request;
use crate::response::ResponseWriter;

/// The ALPN protocol identifier this server speaks.
pub const NEXT_PROTO_TLS: &str = "h2-14";

/// Default per-connection stream cap advertised to clients.
const DEFAULT_MAX_STREAMS: u32 = 250;

/// A request handler.
///
/// One handler instance serves every request of every connection it is
/// registered with; each invocation runs on its own task.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn serve(&self, req: Request, rw: &mut ResponseWriter);
}

/// HTTP/2 server configuration shared across connections.
#[derive(Debug, Clone)]
pub struct Server {
    max_handlers: i64,
    max_concurrent_streams: u32,
    max_read_frame_size: u32,
    handler_permits: Option<Arc<Semaphore>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            max_handlers: 0,
            max_concurrent_streams: 0,
            max_read_frame_size: 0,
            handler_permits: None,
        }
    }

    /// Cap the number of handler tasks running at a time across all
    /// connections. Zero or negative means no limit.
    pub fn max_handlers(mut self, n: i64) -> Self {
        self.max_handlers = n;
        self.handler_permits = if n > 0 {
            Some(Arc::new(Semaphore::new(n as usize)))
        } else {
            None
        };
        self
    }

    /// Number of concurrent streams each client may have open. Zero
    /// selects the default of 250.
    pub fn max_concurrent_streams(mut self, n: u32) -> Self {
        self.max_concurrent_streams = n;
        self
    }

    /// Largest frame payload this server is willing to read. Values
    /// outside [16_384, 16_777_215] select the default.
    pub fn max_read_frame_size(mut self, n: u32) -> Self {
        self.max_read_frame_size = n;
        self
    }

    fn effective_max_streams(&self) -> u32 {
        if self.max_concurrent_streams > 0 {
            self.max_concurrent_streams
        } else {
            DEFAULT_MAX_STREAMS
        }
    }

    fn effective_max_read_frame_size(&self) -> u32 {
        let v = self.max_read_frame_size;
        if (frame::DEFAULT_MAX_FRAME_SIZE..=frame::MAX_FRAME_SIZE).contains(&v) {
            v
        } else {
            frame::DEFAULT_MAX_FRAME_SIZE
        }
    }

    /// Register the HTTP/2 ALPN identifier on a TLS server config.
    /// The host's accept loop dispatches connections that negotiated
    /// it to [`Server::serve_tls`].
    pub fn configure(tls: &mut ServerConfig) {
        let proto = NEXT_PROTO_TLS.as_bytes().to_vec();
        if !tls.alpn_protocols.contains(&proto) {
            tls.alpn_protocols.push(proto);
        }
    }

    /// Serve one accepted TLS connection that negotiated `h2-14`.
    ///
    /// Connections negotiated below TLS 1.2 are terminated with
    /// INADEQUATE_SECURITY before any request is dispatched.
    pub async fn serve_tls<IO>(
        &self,
        conn: TlsStream<IO>,
        handler: Arc<dyn Handler>,
    ) -> io::Result<()>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (_, session) = conn.get_ref();
        if session.alpn_protocol() != Some(NEXT_PROTO_TLS.as_bytes()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "connection did not negotiate h2-14",
            ));
        }
        let inadequate = session
            .protocol_version()
            .is_some_and(below_tls12);
        self.serve_inner(conn, None, handler, inadequate).await
    }

    /// Serve one connection over an already-negotiated duplex stream
    /// (TLS handled by the host, or plaintext in tests).
    pub async fn serve_connection<S>(
        &self,
        io: S,
        remote_addr: Option<SocketAddr>,
        handler: Arc<dyn Handler>,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.serve_inner(io, remote_addr, handler, false).await
    }

    async fn serve_inner<S>(
        &self,
        io: S,
        remote_addr: Option<SocketAddr>,
        handler: Arc<dyn Handler>,
        inadequate_security: bool,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let cfg = ServeConfig {
            adv_max_streams: self.effective_max_streams(),
            max_read_frame_size: self.effective_max_read_frame_size(),
            handler_permits: self.handler_permits.clone(),
            inadequate_security,
            remote_addr,
        };
        connection::serve(io, cfg, handler).await
    }
}

fn below_tls12(version: ProtocolVersion) -> bool {
    !matches!(
        version,
        ProtocolVersion::TLSv1_2 | ProtocolVersion::TLSv1_3
    )
}
