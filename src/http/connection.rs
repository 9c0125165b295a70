use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use serde_json::{Map, Value};

use crate::config::HandlerKind;
use crate::error::{Error, Result};
use crate::http::chunk::{ChunkDecoder, LAST_CHUNK, encode_chunk};
use crate::http::file;
use crate::http::parser::{BodyKind, ParseError, body_kind, parse_http_request};
use crate::http::request::{Headers, Method, Request, Version};
use crate::http::response::{Response, StatusCode};
use crate::http::route::{Route, find_route};
use crate::http::session::{Session, get_cookie, session_cookie};
use crate::http::upload::{self, Upload, UploadError};
use crate::http::uri::parse_query;
use crate::http::websocket::{self, WEBSOCKET_VERSION, WebSocket};
use crate::http::writer::{http_date, serialize_head, valid_header};
use crate::runtime::buf::BUF_INC;
use crate::runtime::{Buf, Socket};
use crate::server::Host;
use crate::signature::{Tag, ValidationError};

/// Largest single socket read, whatever `limits.buffer` says
const MAX_READ: usize = 1024 * 1024;

/// Future returned by an action handler.
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

/// Code-registered request handler, bound to a URL prefix with
/// [`Host::add_action`].
pub type Action = Rc<dyn for<'a> Fn(&'a mut Web) -> ActionFuture<'a>>;

/// Where a connection is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WebState {
    ParsingHeaders,
    Routing,
    ReadingBody,
    Handling,
    Finalizing,
    KeepAlive,
    Closed,
}

/// Remaining request body framing
#[derive(Debug)]
enum BodyState {
    None,
    Length(u64),
    Chunked(ChunkDecoder),
}

/// One client connection and the request currently being served on it.
///
/// A `Web` lives on the fiber that accepted the socket and serves
/// pipelined requests one after another until the peer closes, a request
/// asks to close, or a deadline passes.
pub struct Web {
    host: Rc<Host>,
    sock: Socket,
    peer: Option<SocketAddr>,
    rx: Buf,

    request: Request,
    route: Option<usize>,
    session: Option<String>,
    set_cookie: Option<Option<String>>,
    body: BodyState,
    uploads: Vec<Upload>,

    status: StatusCode,
    headers: Headers,
    tx_length: Option<u64>,
    tx_count: u64,
    chunked: bool,
    wrote_headers: bool,
    finalized: bool,

    close: bool,
    upgraded: bool,
    protocol: Option<String>,
    started: Instant,
    parse_started: Option<Instant>,
    requests: u64,
}

impl Web {
    pub fn new(host: Rc<Host>, sock: Socket) -> Self {
        let limits = &host.config().limits;
        let rx = Buf::with_limit(BUF_INC, limits.header.max(limits.buffer).saturating_add(limits.buffer));
        host.connection_opened();
        Self {
            peer: sock.peer(),
            host,
            sock,
            rx,
            request: Request::default(),
            route: None,
            session: None,
            set_cookie: None,
            body: BodyState::None,
            uploads: Vec::new(),
            status: StatusCode::Ok,
            headers: Headers::new(),
            tx_length: None,
            tx_count: 0,
            chunked: false,
            wrote_headers: false,
            finalized: false,
            close: false,
            upgraded: false,
            protocol: None,
            started: Instant::now(),
            parse_started: None,
            requests: 0,
        }
    }

    /// Attaches TLS before the first request is read.
    pub async fn upgrade_tls(&mut self, tls: Box<dyn crate::runtime::tls::TlsTransport>) -> Result<()> {
        let deadline = after(self.host.config().timeouts.parse, Instant::now());
        self.sock.upgrade(tls, deadline).await
    }

    /// Serves requests until the connection closes.
    pub async fn run(&mut self) {
        tracing::debug!(peer = ?self.peer, "Connection opened");
        let mut state = WebState::ParsingHeaders;
        while state != WebState::Closed {
            state = match self.step(state).await {
                Ok(next) => next,
                Err(e) => self.on_error(e).await,
            };
        }
        self.cleanup_uploads();
        self.sock.close();
        tracing::debug!(peer = ?self.peer, requests = self.requests, "Connection closed");
    }

    async fn step(&mut self, state: WebState) -> Result<WebState> {
        match state {
            WebState::ParsingHeaders => self.read_headers().await,
            WebState::Routing => self.route_request().await,
            WebState::ReadingBody => self.read_body().await,
            WebState::Handling => self.handle().await,
            WebState::Finalizing => self.complete().await,
            WebState::KeepAlive => {
                self.reset();
                Ok(WebState::ParsingHeaders)
            }
            WebState::Closed => Ok(WebState::Closed),
        }
    }

    async fn on_error(&mut self, e: Error) -> WebState {
        if e.is_transport() {
            match e {
                Error::Protocol(ref pe) => {
                    tracing::warn!(peer = ?self.peer, error = %pe, "Closing connection on protocol error")
                }
                _ => tracing::debug!(peer = ?self.peer, error = %e, "Connection failed"),
            }
            return WebState::Closed;
        }
        tracing::error!(peer = ?self.peer, path = %self.request.path, error = %e, "Request failed");
        if !self.wrote_headers {
            self.close = true;
            let _ = self.error(StatusCode::InternalServerError, "").await;
        }
        WebState::Closed
    }

    // ---- Request cycle ----

    async fn read_headers(&mut self) -> Result<WebState> {
        let limit = self.host.config().limits.header;
        loop {
            match parse_http_request(self.rx.as_slice()) {
                Ok((request, used)) if used <= limit => {
                    self.rx.adjust_start(used);
                    self.request = request;
                    self.started = Instant::now();
                    return Ok(WebState::Routing);
                }
                Ok(_) => return self.header_too_large().await,
                Err(ParseError::Incomplete) if self.rx.len() > limit => {
                    return self.header_too_large().await;
                }
                Err(ParseError::Incomplete) => {}
                Err(e) => return Err(e.into()),
            }

            let timeouts = &self.host.config().timeouts;
            let deadline = if self.rx.is_empty() {
                after(timeouts.inactivity, Instant::now())
            } else {
                let first = *self.parse_started.get_or_insert_with(Instant::now);
                after(timeouts.parse, first)
            };
            let want = self.read_size();
            match self.sock.read_buf(&mut self.rx, want, deadline).await {
                Ok(0) if self.rx.is_empty() => return Ok(WebState::Closed),
                Ok(0) => return Err(Error::Closed),
                Ok(_) => {}
                Err(Error::Timeout) if self.rx.is_empty() => {
                    tracing::debug!(peer = ?self.peer, "Idle connection timed out");
                    return Ok(WebState::Closed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn header_too_large(&mut self) -> Result<WebState> {
        tracing::warn!(peer = ?self.peer, limit = self.host.config().limits.header, "Header block too large");
        self.close = true;
        self.error(StatusCode::UriTooLong, "").await?;
        Ok(WebState::Closed)
    }

    async fn route_request(&mut self) -> Result<WebState> {
        let host = self.host.clone();
        self.close = !self.request.keep_alive();
        self.body = match body_kind(&self.request)? {
            BodyKind::None => BodyState::None,
            BodyKind::Length(n) => BodyState::Length(n),
            BodyKind::Chunked => BodyState::Chunked(ChunkDecoder::new()),
        };
        host.show().request_head(&self.request);

        if let Some(redirect) = host.config().redirect.iter().find(|r| r.from == self.request.path) {
            let status = StatusCode::from_u16(redirect.status).unwrap_or(StatusCode::MovedPermanently);
            self.redirect(status, &redirect.to).await?;
            return Ok(WebState::Finalizing);
        }

        let Some((index, route)) = find_route(host.routes(), &self.request.path) else {
            self.error(StatusCode::NotFound, "Cannot find route").await?;
            return Ok(WebState::Finalizing);
        };
        self.route = Some(index);

        if let Some(target) = &route.redirect {
            let location = if target == "https" {
                self.https_location()
            } else {
                target.clone()
            };
            self.redirect(StatusCode::Found, &location).await?;
            return Ok(WebState::Finalizing);
        }
        if !route.allows(&self.request.method) {
            self.set_header("Allow", &route.allow_header())?;
            self.error(StatusCode::MethodNotAllowed, "Method not allowed").await?;
            return Ok(WebState::Finalizing);
        }
        if route.trim.is_some() {
            self.request.path = route.trim_path(&self.request.path);
        }

        self.load_session();
        if route.is_protected() {
            let need = route.role.as_deref().unwrap_or_default();
            if !self.is_authenticated() {
                self.error(StatusCode::Unauthorized, "Access denied, not authenticated").await?;
                return Ok(WebState::Finalizing);
            }
            let role = self.role();
            if !host.roles().satisfies(role.as_deref(), need) {
                self.error(StatusCode::Forbidden, "Access denied, insufficient privilege").await?;
                return Ok(WebState::Finalizing);
            }
        }

        if let BodyState::Length(n) = self.body {
            if !route.stream && n > self.body_limit() as u64 {
                tracing::warn!(peer = ?self.peer, length = n, "Request body too large");
                self.close = true;
                self.error(StatusCode::PayloadTooLarge, "Request body too large").await?;
                return Ok(WebState::Finalizing);
            }
        }

        Ok(WebState::ReadingBody)
    }

    async fn read_body(&mut self) -> Result<WebState> {
        let host = self.host.clone();
        let Some(route) = self.route.and_then(|i| host.routes().get(i)) else {
            return Ok(WebState::Handling);
        };

        if !matches!(self.body, BodyState::None)
            && self.request.version == Version::Http11
            && self.request.headers.has_token("Expect", "100-continue")
        {
            let deadline = self.io_deadline();
            self.sock.write(b"HTTP/1.1 100 Continue\r\n\r\n", deadline).await?;
        }

        if !route.stream {
            let limit = self.body_limit();
            if !self.buffer_body(limit).await? {
                tracing::warn!(peer = ?self.peer, limit, "Request body too large");
                self.close = true;
                self.error(StatusCode::PayloadTooLarge, "Request body too large").await?;
                return Ok(WebState::Finalizing);
            }
            host.show().request_body(&self.request);
            if let Some((status, message)) = self.parse_body() {
                self.error(status, message).await?;
                return Ok(WebState::Finalizing);
            }
        }

        let mut query = parse_query(&self.request.query);
        if route.validate {
            if let Some(message) = self.validate_request(route, &mut query) {
                self.error(StatusCode::BadRequest, &message).await?;
                return Ok(WebState::Finalizing);
            }
        }
        // Body variables win over query variables of the same name
        for (name, value) in query {
            self.request.vars.entry(name).or_insert(value);
        }

        if self.request.is_upgrade() && host.config().web_sockets.enable {
            return self.upgrade_websocket().await;
        }
        Ok(WebState::Handling)
    }

    /// Reads the whole body into the request. Returns false if it exceeds
    /// `limit`.
    async fn buffer_body(&mut self, limit: usize) -> Result<bool> {
        let mut body = Vec::new();
        loop {
            let want = limit
                .saturating_sub(body.len())
                .saturating_add(1)
                .min(self.read_size());
            if self.read_body_into(&mut body, want).await? == 0 {
                break;
            }
            if body.len() > limit {
                return Ok(false);
            }
        }
        self.request.body = body;
        Ok(true)
    }

    /// Turns a buffered body into variables, JSON or uploads. Returns the
    /// error response to send when the body is unacceptable.
    fn parse_body(&mut self) -> Option<(StatusCode, &'static str)> {
        if self.request.body.is_empty() {
            return None;
        }
        let mime = self.request.mime_type().unwrap_or_default();
        match mime.as_str() {
            "application/x-www-form-urlencoded" => {
                let form = String::from_utf8_lossy(&self.request.body).into_owned();
                for (name, value) in parse_query(&form) {
                    self.request.vars.insert(name, value);
                }
            }
            "application/json" => match serde_json::from_slice(&self.request.body) {
                Ok(json) => self.request.json = Some(json),
                Err(e) => {
                    tracing::debug!(peer = ?self.peer, error = %e, "Invalid JSON body");
                    return Some((StatusCode::BadRequest, "Invalid JSON body"));
                }
            },
            "multipart/form-data" => {
                if let Err(e) = self.save_uploads() {
                    tracing::debug!(peer = ?self.peer, error = %e, "Upload rejected");
                    return Some((e.status(), "Upload rejected"));
                }
            }
            _ => {}
        }
        None
    }

    fn save_uploads(&mut self) -> Result<(), UploadError> {
        let content_type = self.request.header("Content-Type").unwrap_or_default();
        let boundary = upload::boundary(content_type).ok_or(UploadError::NoBoundary)?;
        let config = self.host.config();
        let parts = upload::parse_multipart(&self.request.body, &boundary)?;
        self.uploads = upload::save_uploads(
            &parts,
            &config.upload.dir,
            config.limits.upload,
            config.limits.uploads,
            &mut self.request.vars,
        )?;
        Ok(())
    }

    /// Checks the request body and the query against the path's signature,
    /// replacing both with the filtered values. Returns the message for a
    /// 400 response on failure.
    ///
    /// Only body variables are in `request.vars` at this point, the query
    /// is merged afterwards.
    fn validate_request(&mut self, route: &Route, query: &mut Vec<(String, String)>) -> Option<String> {
        let host = self.host.clone();
        let signatures = host.signatures()?;
        let Some(signature) = signatures.get(&self.request.path) else {
            if signatures.strict() {
                tracing::debug!(path = %self.request.path, "No signature for validated route");
                return Some("Missing request signature".to_string());
            }
            return None;
        };
        let role = self.role();
        let route_role = route.role.as_deref();
        let roles = host.roles();

        let from_vars = self.request.json.is_none();
        let body = match &self.request.json {
            Some(json) => json.clone(),
            None if self.request.body.is_empty() && self.request.vars.is_empty() => Value::Null,
            None => vars_object(self.request.vars.iter()),
        };
        match signatures.validate(signature, Tag::Request, &body, roles, role.as_deref(), route_role) {
            Ok(Some(value)) if from_vars => self.request.vars = object_vars(&value).collect(),
            Ok(Some(value)) => self.request.json = Some(value),
            Ok(None) => {}
            Err(e) => return Some(self.validation_failed(e)),
        }

        let query_value = vars_object(query.iter().map(|(k, v)| (k, v)));
        match signatures.validate(signature, Tag::Query, &query_value, roles, role.as_deref(), route_role) {
            Ok(Some(value)) => *query = object_vars(&value).collect(),
            Ok(None) => {}
            Err(e) => return Some(self.validation_failed(e)),
        }
        None
    }

    fn validation_failed(&self, e: ValidationError) -> String {
        tracing::debug!(peer = ?self.peer, path = %self.request.path, error = %e, "Validation failed");
        e.to_string()
    }

    async fn upgrade_websocket(&mut self) -> Result<WebState> {
        if self.request.header("Sec-WebSocket-Version").map(str::trim) != Some(WEBSOCKET_VERSION) {
            self.set_header("Sec-WebSocket-Version", WEBSOCKET_VERSION)?;
            self.error(StatusCode::BadRequest, "Unsupported WebSocket version").await?;
            return Ok(WebState::Finalizing);
        }
        let key = match self.request.header("Sec-WebSocket-Key") {
            Some(key) if websocket::valid_key(key) => key.to_string(),
            _ => {
                self.error(StatusCode::BadRequest, "Bad WebSocket key").await?;
                return Ok(WebState::Finalizing);
            }
        };
        let protocol = websocket::select_protocol(
            self.request.header("Sec-WebSocket-Protocol"),
            self.host.config().web_sockets.protocol.as_deref(),
        );

        self.status = StatusCode::SwitchingProtocols;
        self.upgraded = true;
        self.close = true;
        self.headers.insert("Upgrade", "websocket");
        self.headers.insert("Connection", "Upgrade");
        self.headers.insert("Sec-WebSocket-Accept", websocket::accept_key(&key));
        if let Some(protocol) = &protocol {
            self.headers.insert("Sec-WebSocket-Protocol", protocol.clone());
        }
        self.protocol = protocol;
        self.write_head().await?;
        self.finalized = true;
        tracing::debug!(peer = ?self.peer, path = %self.request.path, "Upgraded to WebSocket");
        Ok(WebState::Handling)
    }

    async fn handle(&mut self) -> Result<WebState> {
        let host = self.host.clone();
        let Some(route) = self.route.and_then(|i| host.routes().get(i)) else {
            return Ok(WebState::Finalizing);
        };
        let result = match route.handler {
            HandlerKind::File if self.upgraded => Ok(()),
            HandlerKind::File => file::serve(self).await,
            HandlerKind::Action => match host.find_action(&self.request.path) {
                Some(action) => action(self).await,
                None => self.error(StatusCode::NotFound, "Cannot find action").await,
            },
        };
        match result {
            Ok(()) => Ok(WebState::Finalizing),
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                tracing::error!(peer = ?self.peer, path = %self.request.path, error = %e, "Handler failed");
                if self.wrote_headers {
                    self.close = true;
                    return Ok(WebState::Closed);
                }
                self.error(StatusCode::InternalServerError, "").await?;
                Ok(WebState::Finalizing)
            }
        }
    }

    async fn complete(&mut self) -> Result<WebState> {
        self.finalize().await?;
        if !self.close && !self.upgraded {
            let mut sink = Vec::new();
            loop {
                sink.clear();
                let want = self.read_size();
                if self.read_body_into(&mut sink, want).await? == 0 {
                    break;
                }
            }
        }
        self.cleanup_uploads();
        self.requests += 1;
        tracing::info!(
            peer = ?self.peer,
            method = %self.request.method,
            path = %self.request.url,
            status = self.status.as_u16(),
            bytes = self.tx_count,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Request complete"
        );
        Ok(if self.close { WebState::Closed } else { WebState::KeepAlive })
    }

    fn reset(&mut self) {
        self.request.reset();
        self.route = None;
        self.session = None;
        self.set_cookie = None;
        self.body = BodyState::None;
        self.uploads.clear();
        self.status = StatusCode::Ok;
        self.headers.clear();
        self.tx_length = None;
        self.tx_count = 0;
        self.chunked = false;
        self.wrote_headers = false;
        self.finalized = false;
        self.close = false;
        self.parse_started = None;
        self.rx.compact();
    }

    fn cleanup_uploads(&mut self) {
        if self.host.config().upload.remove {
            upload::remove_uploads(&self.uploads);
        }
        self.uploads.clear();
    }

    // ---- Helpers ----

    fn read_size(&self) -> usize {
        self.host.config().limits.buffer.clamp(BUF_INC, MAX_READ)
    }

    fn body_limit(&self) -> usize {
        let limits = &self.host.config().limits;
        if self.request.mime_type().as_deref() == Some("multipart/form-data") {
            limits.upload
        } else {
            limits.body
        }
    }

    /// `min(now + inactivity, start + request)`, or nothing once upgraded.
    fn io_deadline(&self) -> Option<Instant> {
        if self.upgraded {
            return None;
        }
        let timeouts = &self.host.config().timeouts;
        match (after(timeouts.inactivity, Instant::now()), after(timeouts.request, self.started)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn https_location(&self) -> String {
        let host = self
            .request
            .header("Host")
            .map(|h| h.rsplit_once(':').map_or(h, |(name, _)| name).to_string())
            .unwrap_or_else(|| "localhost".to_string());
        match self.host.https_port() {
            Some(443) | None => format!("https://{host}{}", self.request.url),
            Some(port) => format!("https://{host}:{port}{}", self.request.url),
        }
    }

    /// Decodes more of the request body into `out`, at most `max` bytes.
    /// Returns 0 once the body is complete.
    async fn read_body_into(&mut self, out: &mut Vec<u8>, max: usize) -> Result<usize> {
        loop {
            let (produced, used, done) = match &mut self.body {
                BodyState::None => return Ok(0),
                BodyState::Length(0) => (0, 0, true),
                BodyState::Length(remaining) => {
                    let n = (self.rx.len() as u64).min(*remaining).min(max as u64) as usize;
                    out.extend_from_slice(&self.rx.as_slice()[..n]);
                    self.rx.adjust_start(n);
                    *remaining -= n as u64;
                    (n, n, false)
                }
                BodyState::Chunked(decoder) => {
                    let before = out.len();
                    let used = decoder.decode(self.rx.as_slice(), out, max)?;
                    self.rx.adjust_start(used);
                    (out.len() - before, used, decoder.is_done())
                }
            };
            if done {
                self.body = BodyState::None;
            }
            if produced > 0 || done {
                return Ok(produced);
            }
            if used > 0 {
                continue;
            }
            let deadline = self.io_deadline();
            let want = self.read_size();
            if self.sock.read_buf(&mut self.rx, want, deadline).await? == 0 {
                return Err(Error::Closed);
            }
        }
    }

    fn load_session(&mut self) {
        let cookie = &self.host.config().sessions.cookie;
        let Some(id) = get_cookie(&self.request.headers, cookie) else {
            return;
        };
        if self.host.sessions().borrow_mut().get(&id).is_some() {
            self.session = Some(id);
        }
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> T) -> Option<T> {
        let id = self.session.as_deref()?;
        self.host.sessions().borrow_mut().get(id).map(f)
    }

    fn ensure_session(&mut self) -> Result<String> {
        if let Some(id) = &self.session {
            if self.host.sessions().borrow_mut().get(id).is_some() {
                return Ok(id.clone());
            }
        }
        let id = self.host.sessions().borrow_mut().create()?.id.clone();
        self.session = Some(id.clone());
        self.set_cookie = Some(Some(id.clone()));
        Ok(id)
    }

    // ---- Handler API ----

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn host(&self) -> &Rc<Host> {
        &self.host
    }

    /// The route that matched this request.
    pub fn route(&self) -> Option<&Route> {
        self.route.and_then(|i| self.host.routes().get(i))
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_secure(&self) -> bool {
        self.sock.is_secure()
    }

    pub fn uploads(&self) -> &[Upload] {
        &self.uploads
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Sets a response header, replacing any previous value. Names must be
    /// tokens and values may not contain line breaks.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        if !valid_header(name, value) {
            return Err(Error::BadArgs(format!("invalid header {name}")));
        }
        if self.wrote_headers {
            return Err(Error::BadState("headers already written"));
        }
        self.headers.insert(name, value);
        Ok(())
    }

    /// Declares the body length. Without it the response is chunked on
    /// HTTP/1.1 and close-delimited on HTTP/1.0.
    pub fn set_content_length(&mut self, length: u64) {
        self.tx_length = Some(length);
    }

    /// Reads the next piece of a streamed request body, appending it to
    /// `out`. Returns 0 at the end of the body.
    pub async fn read(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let want = self.read_size();
        self.read_body_into(out, want).await
    }

    fn discards_body(&self) -> bool {
        self.request.method == Method::HEAD || self.status.forbids_body()
    }

    async fn write_head(&mut self) -> Result<()> {
        if !self.upgraded {
            if self.status.forbids_body() {
                self.headers.remove("Content-Length");
            } else if let Some(length) = self.tx_length {
                self.headers.insert("Content-Length", length.to_string());
            } else if self.request.method == Method::HEAD {
                // No framing needed when no body follows
            } else if self.request.version == Version::Http11 {
                self.headers.insert("Transfer-Encoding", "chunked");
                self.chunked = true;
            } else {
                self.close = true;
            }
            let connection = if self.close { "close" } else { "keep-alive" };
            self.headers.insert("Connection", connection);
        }
        self.headers.insert("Date", http_date(SystemTime::now()));
        if let Some(id) = &self.set_cookie {
            let config = &self.host.config().sessions;
            let cookie = session_cookie(config, id.as_deref(), self.sock.is_secure());
            self.headers.append("Set-Cookie", cookie);
        }

        let head = serialize_head(self.request.version, self.status.as_u16(), self.headers.iter());
        self.host.show().response_head(&head);
        let deadline = self.io_deadline();
        self.sock.write(&head, deadline).await?;
        self.wrote_headers = true;
        Ok(())
    }

    /// Writes response body data, sending the headers first if needed.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.finalized {
            return Err(Error::BadState("response already finalized"));
        }
        if !self.wrote_headers {
            self.write_head().await?;
        }
        if self.discards_body() || data.is_empty() {
            return Ok(data.len());
        }
        if let Some(length) = self.tx_length {
            if self.tx_count + data.len() as u64 > length {
                return Err(Error::BadArgs("body exceeds content length".to_string()));
            }
        }
        self.host.show().response_body(data);
        let deadline = self.io_deadline();
        if self.chunked {
            let mut block = Vec::with_capacity(data.len() + 16);
            encode_chunk(data, &mut block);
            self.sock.write(&block, deadline).await?;
        } else {
            self.sock.write(data, deadline).await?;
        }
        self.tx_count += data.len() as u64;
        Ok(data.len())
    }

    /// Completes the response. Idempotent.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if !self.wrote_headers {
            if self.tx_length.is_none() {
                self.tx_length = Some(0);
            }
            self.write_head().await?;
        } else if self.chunked {
            let deadline = self.io_deadline();
            self.sock.write(LAST_CHUNK, deadline).await?;
        } else if self.tx_length.is_some_and(|l| l > self.tx_count) && !self.discards_body() {
            tracing::warn!(path = %self.request.path, "Response shorter than its content length");
            self.close = true;
        }
        self.finalized = true;
        Ok(())
    }

    /// Sends a complete response.
    pub async fn send(&mut self, response: Response) -> Result<()> {
        self.status = response.status;
        for (name, value) in &response.headers {
            if !name.eq_ignore_ascii_case("Content-Length") {
                self.set_header(name, value)?;
            }
        }
        self.set_content_length(response.body.len() as u64);
        self.write(&response.body).await?;
        self.finalize().await
    }

    pub async fn write_json(&mut self, value: &Value) -> Result<()> {
        let body = serde_json::to_vec(value).map_err(|e| Error::BadArgs(e.to_string()))?;
        self.set_header("Content-Type", "application/json")?;
        self.set_content_length(body.len() as u64);
        self.write(&body).await?;
        self.finalize().await
    }

    /// Validates `value` against the response signature of this path, then
    /// writes the filtered result. A response that fails its own signature
    /// becomes a 500.
    pub async fn write_validated_json(&mut self, value: &Value) -> Result<()> {
        let host = self.host.clone();
        let validate = self.route().is_some_and(|r| r.validate);
        let signature = host
            .signatures()
            .filter(|_| validate)
            .and_then(|s| s.get(&self.request.path).map(|sig| (s, sig)));
        let Some((signatures, signature)) = signature else {
            return self.write_json(value).await;
        };
        let role = self.role();
        let route_role = self.route().and_then(|r| r.role.clone());
        match signatures.validate(signature, Tag::Response, value, host.roles(), role.as_deref(), route_role.as_deref()) {
            Ok(Some(filtered)) => self.write_json(&filtered).await,
            Ok(None) => self.write_json(value).await,
            Err(e) => {
                tracing::error!(path = %self.request.path, error = %e, "Response failed its signature");
                self.error(StatusCode::InternalServerError, "").await
            }
        }
    }

    /// Sends a short plain-text error. `message` goes to the client, so it
    /// must not carry internal detail. Empty uses the reason phrase.
    pub async fn error(&mut self, status: StatusCode, message: &str) -> Result<()> {
        if self.wrote_headers {
            self.close = true;
            return Ok(());
        }
        tracing::debug!(peer = ?self.peer, status = status.as_u16(), message, "Request error");
        let mut response = Response::error(status);
        if !message.is_empty() {
            response.body = format!("{}\n", message).into_bytes();
        }
        self.send(response).await
    }

    pub async fn redirect(&mut self, status: StatusCode, location: &str) -> Result<()> {
        self.send(Response::redirect(status, location)).await
    }

    // ---- Sessions ----

    pub fn session_var(&self, name: &str) -> Option<String> {
        self.with_session(|s| s.vars.get(name).cloned()).flatten()
    }

    /// Stores a session variable, creating the session if needed.
    pub fn set_session_var(&mut self, name: &str, value: &str) -> Result<()> {
        let id = self.ensure_session()?;
        if let Some(session) = self.host.sessions().borrow_mut().get(&id) {
            session.vars.insert(name.to_string(), value.to_string());
        }
        Ok(())
    }

    /// Authenticates the client. The session id is regenerated so an id
    /// seen before login is useless afterwards.
    pub fn login(&mut self, username: &str, role: &str) -> Result<()> {
        let vars = self.with_session(|s| s.vars.clone()).unwrap_or_default();
        if let Some(old) = self.session.take() {
            self.host.sessions().borrow_mut().remove(&old);
        }
        let id = self.ensure_session()?;
        if let Some(session) = self.host.sessions().borrow_mut().get(&id) {
            session.vars = vars;
            session.username = Some(username.to_string());
            session.role = Some(role.to_string());
        }
        tracing::info!(peer = ?self.peer, username, role, "Login");
        Ok(())
    }

    pub fn logout(&mut self) {
        if let Some(id) = self.session.take() {
            self.host.sessions().borrow_mut().remove(&id);
            self.set_cookie = Some(None);
            tracing::debug!(peer = ?self.peer, "Logout");
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.with_session(|s| s.is_authenticated()).unwrap_or(false)
    }

    pub fn username(&self) -> Option<String> {
        self.with_session(|s| s.username.clone()).flatten()
    }

    pub fn role(&self) -> Option<String> {
        self.with_session(|s| s.role.clone()).flatten()
    }

    // ---- WebSockets ----

    /// Message layer over an upgraded connection.
    pub fn websocket(&mut self) -> Result<WebSocket<'_>> {
        if !self.upgraded {
            return Err(Error::BadState("connection not upgraded"));
        }
        let config = self.host.config().web_sockets.clone();
        let pending = self.rx.take(self.rx.len());
        WebSocket::new(&mut self.sock, &pending, config, self.protocol.clone())
    }
}

impl Drop for Web {
    fn drop(&mut self) {
        self.host.connection_closed();
    }
}

/// Deadline `timeout` after `from`. Timeouts too large to represent mean
/// no deadline.
fn after(timeout: Option<Duration>, from: Instant) -> Option<Instant> {
    timeout.and_then(|t| from.checked_add(t))
}

/// Flattens a validated object back into string variables.
fn object_vars(value: &Value) -> impl Iterator<Item = (String, String)> + '_ {
    value.as_object().into_iter().flatten().map(|(k, v)| {
        let text = match v {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        (k.clone(), text)
    })
}

fn vars_object<'a>(vars: impl Iterator<Item = (&'a String, &'a String)>) -> Value {
    Value::Object(
        vars.map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<String, Value>>(),
    )
}
