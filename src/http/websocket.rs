//! WebSocket handshake and frame layer (RFC 6455).
//!
//! The HTTP connection validates the upgrade request and writes the `101`
//! response. After that the action handler takes a [`WebSocket`] over the
//! same socket and exchanges messages; the HTTP read/write paths are no
//! longer used.
//!
//! ```ignore
//! fn echo(web: &mut Web) -> ActionFuture<'_> {
//!     Box::pin(async move {
//!         let mut ws = web.websocket()?;
//!         while let Some(msg) = ws.recv().await? {
//!             if let Message::Text(text) = msg {
//!                 ws.send_text(&text).await?;
//!             }
//!         }
//!         Ok(())
//!     })
//! }
//! ```

use std::time::Instant;

use base64ct::{Base64, Encoding};
use sha1::{Digest, Sha1};

use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::runtime::{Buf, Socket};
use crate::runtime::buf::BUF_INC;

const SEC_WEBSOCKET_ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken
pub const WEBSOCKET_VERSION: &str = "13";

/// Largest possible frame header
const MAX_HEADER: usize = 14;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL: u16 = 1002;
pub const CLOSE_BAD_DATA: u16 = 1007;
pub const CLOSE_TOO_BIG: u16 = 1009;

/// `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut key_hasher = Sha1::new();
    key_hasher.update(key.trim().as_bytes());
    key_hasher.update(SEC_WEBSOCKET_ACCEPT_MAGIC.as_bytes());
    let hash = key_hasher.finalize();
    let mut encoded = [0u8; 28];
    match Base64::encode(&hash, &mut encoded) {
        Ok(accept) => accept.to_string(),
        // 20 bytes always fit in 28 base64 characters
        Err(_) => String::new(),
    }
}

/// A client key must be the base64 encoding of 16 bytes.
pub fn valid_key(key: &str) -> bool {
    let mut decoded = [0u8; 18];
    matches!(Base64::decode(key.trim(), &mut decoded), Ok(bytes) if bytes.len() == 16)
}

/// Picks a sub-protocol from the client's comma separated offer: the
/// preferred one if offered, otherwise the first offered.
pub fn select_protocol(offered: Option<&str>, preferred: Option<&str>) -> Option<String> {
    let offered: Vec<&str> = offered?
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    match preferred {
        Some(preferred) => offered
            .iter()
            .find(|p| p.eq_ignore_ascii_case(preferred))
            .map(|p| p.to_string()),
        None => offered.first().map(|p| p.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => OpCode::Continuation,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            8 => OpCode::Close,
            9 => OpCode::Ping,
            10 => OpCode::Pong,
            _ => return None,
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// Frame-level failure, carrying the close code to send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} (close code {code})")]
pub struct FrameError {
    pub code: u16,
    pub reason: &'static str,
}

fn frame_error(code: u16, reason: &'static str) -> FrameError {
    FrameError { code, reason }
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `None` until a whole frame is buffered, otherwise the frame and
/// the number of bytes it used. Masked payloads are unmasked.
pub fn decode_frame(buf: &[u8], max_frame: usize, require_mask: bool) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(frame_error(CLOSE_PROTOCOL, "reserved bits set"));
    }
    let opcode = OpCode::from_u8(buf[0] & 0x0F).ok_or(frame_error(CLOSE_PROTOCOL, "unknown opcode"))?;
    let masked = buf[1] & 0x80 != 0;
    if require_mask && !masked {
        return Err(frame_error(CLOSE_PROTOCOL, "client frame not masked"));
    }

    let mut offset = 2;
    let len = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            offset = 4;
            u16::from_be_bytes([buf[2], buf[3]]) as u64
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            offset = 10;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            u64::from_be_bytes(bytes)
        }
        n => n as u64,
    };
    if opcode.is_control() && (len > 125 || !fin) {
        return Err(frame_error(CLOSE_PROTOCOL, "invalid control frame"));
    }
    if len > max_frame as u64 {
        return Err(frame_error(CLOSE_TOO_BIG, "frame too large"));
    }
    let len = len as usize;

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mask = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(mask)
    } else {
        None
    };
    if buf.len() < offset + len {
        return Ok(None);
    }

    let mut payload = buf[offset..offset + len].to_vec();
    if let Some(mask) = mask {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
    }
    Ok(Some((Frame { fin, opcode, payload }, offset + len)))
}

/// Encodes a frame. Servers send unmasked frames; a mask is only given when
/// acting as a client.
pub fn encode_frame(opcode: OpCode, payload: &[u8], fin: bool, mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + MAX_HEADER);
    out.push(if fin { 0x80 } else { 0 } | opcode.as_u8());
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        n if n <= 125 => out.push(mask_bit | n as u8),
        n if n <= u16::MAX as usize => {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    match mask {
        Some(mask) => {
            out.extend_from_slice(&mask);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// A complete message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// Message-level view of an upgraded connection.
pub struct WebSocket<'a> {
    sock: &'a mut Socket,
    rx: Buf,
    config: WebSocketConfig,
    protocol: Option<String>,
    /// Opcode and data of a fragmented message in progress
    partial: Option<(OpCode, Vec<u8>)>,
    /// Our close frame is out, waiting for the peer's
    close_sent: bool,
    /// Status code of the peer's close frame
    peer_code: Option<u16>,
    closed: bool,
}

impl<'a> WebSocket<'a> {
    /// Wraps an upgraded socket. `pending` holds bytes that arrived after
    /// the handshake.
    pub fn new(sock: &'a mut Socket, pending: &[u8], config: WebSocketConfig, protocol: Option<String>) -> Result<Self> {
        let mut rx = Buf::with_limit(BUF_INC, config.max_frame.saturating_add(MAX_HEADER));
        rx.put_block(pending)?;
        Ok(Self {
            sock,
            rx,
            config,
            protocol,
            partial: None,
            close_sent: false,
            peer_code: None,
            closed: false,
        })
    }

    /// Negotiated sub-protocol.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Status code the peer closed with, once its close frame has arrived.
    pub fn peer_close_code(&self) -> Option<u16> {
        self.peer_code
    }

    /// Receives the next message. Pings are answered and pongs ignored.
    /// Returns `None` once the peer has closed. After [`WebSocket::close`]
    /// messages are discarded until the peer's close frame arrives.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if self.closed {
                return Ok(None);
            }
            let frame = match decode_frame(self.rx.as_slice(), self.config.max_frame, true) {
                Ok(Some((frame, used))) => {
                    self.rx.adjust_start(used);
                    frame
                }
                Ok(None) => {
                    self.fill().await?;
                    continue;
                }
                Err(e) => return Err(self.fail(e).await),
            };
            match self.on_frame(frame).await {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => {}
                Err(e) => return Err(self.fail(e).await),
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<Option<Message>, FrameError> {
        match frame.opcode {
            OpCode::Ping => {
                if self.send_frame(OpCode::Pong, &frame.payload).await.is_err() {
                    self.closed = true;
                }
                Ok(None)
            }
            OpCode::Pong => Ok(None),
            OpCode::Close => {
                let code = match frame.payload.len() {
                    0 => CLOSE_NORMAL,
                    1 => return Err(frame_error(CLOSE_PROTOCOL, "bad close payload")),
                    _ => u16::from_be_bytes([frame.payload[0], frame.payload[1]]),
                };
                tracing::debug!(code, "WebSocket closed by peer");
                if !self.close_sent {
                    let _ = self.send_frame(OpCode::Close, &code.to_be_bytes()).await;
                }
                self.peer_code = Some(code);
                self.closed = true;
                Ok(None)
            }
            _ if self.close_sent => Ok(None),
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(frame_error(CLOSE_PROTOCOL, "expected continuation frame"));
                }
                if frame.fin {
                    return self.message(frame.opcode, frame.payload).map(Some);
                }
                self.check_size(frame.payload.len())?;
                self.partial = Some((frame.opcode, frame.payload));
                Ok(None)
            }
            OpCode::Continuation => {
                let Some((opcode, mut data)) = self.partial.take() else {
                    return Err(frame_error(CLOSE_PROTOCOL, "unexpected continuation frame"));
                };
                self.check_size(data.len() + frame.payload.len())?;
                data.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.message(opcode, data).map(Some)
                } else {
                    self.partial = Some((opcode, data));
                    Ok(None)
                }
            }
        }
    }

    fn check_size(&self, len: usize) -> Result<(), FrameError> {
        if len > self.config.max_message {
            return Err(frame_error(CLOSE_TOO_BIG, "message too large"));
        }
        Ok(())
    }

    fn message(&self, opcode: OpCode, data: Vec<u8>) -> Result<Message, FrameError> {
        self.check_size(data.len())?;
        if opcode == OpCode::Binary {
            return Ok(Message::Binary(data));
        }
        if self.config.validate_utf {
            return String::from_utf8(data)
                .map(Message::Text)
                .map_err(|_| frame_error(CLOSE_BAD_DATA, "invalid UTF-8 text"));
        }
        Ok(Message::Text(String::from_utf8_lossy(&data).into_owned()))
    }

    /// Reads more bytes, pinging the peer whenever the ping period passes
    /// in silence.
    async fn fill(&mut self) -> Result<()> {
        loop {
            let deadline = self.config.ping.and_then(|p| Instant::now().checked_add(p));
            match self.sock.read_buf(&mut self.rx, BUF_INC.max(self.config.max_frame.min(64 * 1024)), deadline).await {
                Ok(0) => {
                    self.closed = true;
                    return Err(Error::Closed);
                }
                Ok(_) => return Ok(()),
                Err(Error::Timeout) if deadline.is_some() && !self.close_sent => {
                    self.send_frame(OpCode::Ping, b"").await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail(&mut self, e: FrameError) -> Error {
        tracing::debug!(error = %e, "WebSocket protocol error");
        let mut payload = e.code.to_be_bytes().to_vec();
        payload.extend_from_slice(e.reason.as_bytes());
        let _ = self.send_frame(OpCode::Close, &payload).await;
        self.closed = true;
        Error::WebSocket(e.reason)
    }

    async fn send_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(opcode, payload, true, None);
        self.sock.write(&frame, None).await?;
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(OpCode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send(OpCode::Binary, data).await
    }

    async fn send(&mut self, opcode: OpCode, data: &[u8]) -> Result<()> {
        if self.closed || self.close_sent {
            return Err(Error::Closed);
        }
        self.send_frame(opcode, data).await
    }

    /// Sends a close frame. Call `recv` until it returns `None` to consume
    /// the peer's reply.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if self.closed || self.close_sent {
            return Ok(());
        }
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(&reason.as_bytes()[..reason.len().min(123)]);
        self.close_sent = true;
        self.send_frame(OpCode::Close, &payload).await
    }
}
