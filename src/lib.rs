//! Server-side HTTP/2 (draft-14 compatible) connection engine.
//!
//! This crate implements the per-connection protocol machinery of an
//! HTTP/2 server: it takes a duplex byte stream whose peer negotiated
//! the `h2-14` application protocol, parses it as a sequence of
//! frames, enforces the stream state machine, and dispatches request
//! handlers concurrently while keeping a single serialized writer on
//! the wire.
//!
//! The three load-bearing pieces:
//!
//! - [`frame`]: the binary codec for the frame layer. Reading shares
//!   one payload slab whose contents are only valid until the next
//!   read; writing emits each frame with a single buffered write.
//! - [`connection`] (internal): the serialized per-connection event
//!   loop that owns all mutable state and coordinates the reader,
//!   writer, and handler tasks over channels.
//! - the write scheduler: a FIFO with GOAWAY and SETTINGS-ack
//!   preemption and explicit flush steps.
//!
//! HPACK compression comes from the `hpack` crate; TLS session
//! establishment belongs to the host (see [`Server::configure`] and
//! [`Server::serve_tls`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use http2::{Handler, Request, ResponseWriter, Server};
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Handler for Hello {
//!     async fn serve(&self, req: Request, rw: &mut ResponseWriter) {
//!         rw.header().set("Content-Type", "text/plain");
//!         let _ = rw.write_str(&format!("hello, {}\n", req.path)).await;
//!     }
//! }
//!
//! # async fn example() -> std::io::Result<()> {
//! let server = Server::new().max_concurrent_streams(250);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:4443").await?;
//! let handler: Arc<dyn Handler> = Arc::new(Hello);
//! loop {
//!     let (conn, peer) = listener.accept().await?;
//!     // TLS accept elided; h2-14 must have been negotiated via ALPN.
//!     let server = server.clone();
//!     let handler = handler.clone();
//!     tokio::spawn(async move {
//!         let _ = server.serve_connection(conn, Some(peer), handler).await;
//!     });
//! }
//! # }
//! ```

pub mod connection;
pub mod frame;

mod request;
mod response;
mod server;

pub use connection::{FlowControl, HeaderMap, Pipe, PipeError};
pub use frame::{ErrorCode, FrameReader, FrameWriter};
pub use request::{Request, RequestBody};
pub use response::ResponseWriter;
pub use server::{Handler, NEXT_PROTO_TLS, Server};
