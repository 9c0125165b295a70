//! HTTP/1.x protocol implementation.
//!
//! Every connection runs on its own fiber and serves pipelined requests in
//! turn. The fiber suspends whenever the socket would block, so handlers
//! are written as straight-line async code.
//!
//! # Architecture
//!
//! - **`connection`**: [`Web`](connection::Web), the per-connection request state machine and handler API
//! - **`parser`**: request line and header parsing, body framing
//! - **`request`** / **`response`**: request and response representations
//! - **`uri`**: target validation, percent-decoding, path normalization
//! - **`chunk`**: chunked transfer-coding
//! - **`route`**: route table and role ordering
//! - **`session`**: cookies and server-side sessions
//! - **`upload`**: `multipart/form-data` file uploads
//! - **`file`**: static document handler
//! - **`websocket`**: upgrade handshake and frame layer
//! - **`writer`**: response serialization and HTTP dates
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌────────────────┐
//!   ┌───►│ ParsingHeaders │ ← Read until the blank line (bounded)
//!   │    └───────┬────────┘
//!   │            │ Request head parsed
//!   │            ▼
//!   │    ┌────────────────┐
//!   │    │    Routing     │ ← Redirects, route, method, session, role
//!   │    └───────┬────────┘
//!   │            ▼
//!   │    ┌────────────────┐
//!   │    │  ReadingBody   │ ← Buffer (or leave for streaming), validate,
//!   │    └───────┬────────┘   WebSocket upgrade
//!   │            ▼
//!   │    ┌────────────────┐
//!   │    │    Handling    │ ← File handler or action
//!   │    └───────┬────────┘
//!   │            ▼
//!   │    ┌────────────────┐
//!   │    │   Finalizing   │ ← Finish response, drain unread body
//!   │    └───────┬────────┘
//!   │            ├─ Close → Closed
//!   │            ▼
//!   │    ┌────────────────┐
//!   └────┤   KeepAlive    │ ← Reset request state, keep the socket
//!        └────────────────┘
//! ```
//!
//! Malformed framing at any point closes the socket without a response.
//! Request-level failures (404, 405, 401, 413, ...) become short error
//! responses and the connection stays open when keep-alive allows.
//!
//! # Example
//!
//! ```ignore
//! use std::rc::Rc;
//! use strand::config::WebConfig;
//! use strand::http::connection::{ActionFuture, Web};
//! use strand::runtime::{Runtime, RuntimeConfig};
//! use strand::server::Host;
//!
//! fn hello(web: &mut Web) -> ActionFuture<'_> {
//!     Box::pin(async move {
//!         web.set_header("Content-Type", "text/plain")?;
//!         web.write(b"Hello\n").await?;
//!         web.finalize().await
//!     })
//! }
//!
//! let rt = Runtime::new(RuntimeConfig::default())?;
//! let host = Rc::new(Host::new(WebConfig::default())?);
//! host.add_action("/hello", hello);
//! host.start(&rt)?;
//! rt.run()?;
//! ```

pub mod chunk;
pub mod connection;
pub mod file;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod route;
pub mod session;
pub mod upload;
pub mod uri;
pub mod websocket;
pub mod writer;
