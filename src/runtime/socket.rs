//! Non-blocking TCP sockets that suspend the calling fiber.
//!
//! Every primitive tries the operation first and only waits on the reactor
//! after `WouldBlock`, which is what the edge-triggered backend expects.
//! When a TLS transport is attached, reads and writes go through it and the
//! socket waits for whichever direction the TLS layer asks for.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Instant;

use socket2::{Domain, Protocol, Type};

use crate::error::{Error, Result};
use crate::runtime::buf::Buf;
use crate::runtime::fiber::FiberFuture;
use crate::runtime::tls::{TlsIo, TlsTransport, Want};
use crate::runtime::wait::{WAIT_READ, WAIT_WRITE, WaitHandler, WaitId};
use crate::runtime::Runtime;

const LISTEN_BACKLOG: i32 = 128;

/// Called for each accepted connection. Returning `None` rejects it.
pub type AcceptHandler = Rc<dyn Fn(Socket) -> Option<FiberFuture>>;

pub struct Socket {
    rt: Runtime,
    stream: mio::net::TcpStream,
    wait: WaitId,
    tls: Option<Box<dyn TlsTransport>>,
    peer: Option<SocketAddr>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("peer", &self.peer)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Socket {
    fn from_mio(rt: &Runtime, stream: mio::net::TcpStream) -> Self {
        let wait = rt.add_wait(stream.as_raw_fd());
        let peer = stream.peer_addr().ok();
        Self {
            rt: rt.clone(),
            stream,
            wait,
            tls: None,
            peer,
        }
    }

    /// Wraps an accepted (or otherwise connected) std stream.
    pub fn from_std(rt: &Runtime, stream: std::net::TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        Ok(Self::from_mio(rt, mio::net::TcpStream::from_std(stream)))
    }

    /// Connects to `host:port`, suspending until the connection completes or
    /// `deadline` passes.
    pub async fn connect(host: &str, port: u16, deadline: Option<Instant>) -> Result<Socket> {
        let rt = Runtime::current();
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::CantConnect(format!("{host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| Error::CantConnect(format!("{host}:{port}: no address")))?;

        let stream = mio::net::TcpStream::connect(addr)?;
        let mut sock = Socket::from_mio(&rt, stream);
        rt.wait_for_io(sock.wait, WAIT_WRITE, deadline).await?;

        if let Some(e) = sock.stream.take_error()? {
            return Err(Error::CantConnect(format!("{addr}: {e}")));
        }
        match sock.stream.peer_addr() {
            Ok(peer) => {
                let _ = sock.stream.set_nodelay(true);
                tracing::trace!(%peer, "Connected");
                sock.peer = Some(peer);
                Ok(sock)
            }
            Err(e) => Err(Error::CantConnect(format!("{addr}: {e}"))),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Negotiated ALPN protocol, if any.
    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.tls.as_ref().and_then(|t| t.alpn())
    }

    /// Attaches a TLS transport and runs its handshake.
    pub async fn upgrade(&mut self, tls: Box<dyn TlsTransport>, deadline: Option<Instant>) -> Result<()> {
        self.tls = Some(tls);
        loop {
            let want = match self.tls.as_mut() {
                Some(tls) => match tls.handshake(&mut self.stream) {
                    Ok(TlsIo::Done(())) => return Ok(()),
                    Ok(TlsIo::Want(want)) => want,
                    Err(e) => return Err(Error::Tls(e.to_string())),
                },
                None => return Err(Error::BadState("tls transport missing")),
            };
            self.rt.wait_for_io(self.wait, want.mask(), deadline).await?;
        }
    }

    /// Reads available bytes, suspending until some arrive. `Ok(0)` is an
    /// orderly close by the peer.
    pub async fn read(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let want = match self.tls.as_mut() {
                Some(tls) => match tls.read(&mut self.stream, buf)? {
                    TlsIo::Done(n) => return Ok(n),
                    TlsIo::Want(want) => want,
                },
                None => match self.stream.read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Want::Read,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                },
            };
            self.rt.wait_for_io(self.wait, want.mask(), deadline).await?;
        }
    }

    /// Reads up to `max` bytes onto the end of `buf`.
    pub async fn read_buf(&mut self, buf: &mut Buf, max: usize, deadline: Option<Instant>) -> Result<usize> {
        let spare = buf.spare(max)?;
        match self.read(spare, deadline).await {
            Ok(n) => {
                buf.adjust_end(n);
                Ok(n)
            }
            Err(e) => {
                buf.adjust_end(0);
                Err(e)
            }
        }
    }

    /// Writes the whole buffer, suspending on back-pressure.
    pub async fn write(&mut self, buf: &[u8], deadline: Option<Instant>) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let want = match self.tls.as_mut() {
                Some(tls) => match tls.write(&mut self.stream, &buf[written..])? {
                    TlsIo::Done(n) => {
                        written += n;
                        continue;
                    }
                    TlsIo::Want(want) => want,
                },
                None => match self.stream.write(&buf[written..]) {
                    Ok(0) => return Err(Error::Closed),
                    Ok(n) => {
                        written += n;
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Want::Write,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                },
            };
            self.rt.wait_for_io(self.wait, want.mask(), deadline).await?;
        }
        self.flush(deadline).await?;
        Ok(written)
    }

    async fn flush(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            let want = match self.tls.as_mut() {
                Some(tls) => match tls.flush(&mut self.stream)? {
                    TlsIo::Done(()) => return Ok(()),
                    TlsIo::Want(want) => want,
                },
                None => return Ok(()),
            };
            self.rt.wait_for_io(self.wait, want.mask(), deadline).await?;
        }
    }

    /// Shuts down both directions. Further I/O fails.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        let _ = self.rt.set_wait_mask(self.wait, 0);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.rt.remove_wait(self.wait);
    }
}

impl Want {
    fn mask(self) -> u32 {
        match self {
            Want::Read => WAIT_READ,
            Want::Write => WAIT_WRITE,
        }
    }
}

/// A listening socket whose readiness handler accepts connections.
pub struct Listener {
    rt: Runtime,
    wait: WaitId,
    addr: SocketAddr,
}

impl Listener {
    /// Binds `host:port` and spawns one fiber per accepted connection.
    ///
    /// With no host (or `::`) the socket is dual-stack IPv6 accepting
    /// v4-mapped peers, falling back to IPv4 when IPv6 is unavailable.
    pub fn listen(rt: &Runtime, host: Option<&str>, port: u16, on_accept: AcceptHandler) -> Result<Listener> {
        let listener = Rc::new(bind(host, port)?);
        let addr = listener.local_addr()?;
        let wait = rt.add_wait(listener.as_raw_fd());

        let handler: WaitHandler = {
            let rt = rt.clone();
            let listener = listener.clone();
            Rc::new(move |_mask| {
                let rt = rt.clone();
                let listener = listener.clone();
                let on_accept = on_accept.clone();
                Box::pin(async move {
                    accept_pending(&rt, &listener, &on_accept);
                    0
                })
            })
        };
        rt.set_wait_handler(wait, WAIT_READ, handler)?;
        tracing::info!(%addr, "Listening");
        Ok(Listener {
            rt: rt.clone(),
            wait,
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        tracing::debug!(addr = %self.addr, "Listener closed");
        self.rt.remove_wait(self.wait);
    }
}

/// Accepts until the backlog is drained; the backend only signals edges.
fn accept_pending(rt: &Runtime, listener: &std::net::TcpListener, on_accept: &AcceptHandler) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "Accept failed");
                return;
            }
        };
        let sock = match Socket::from_std(rt, stream) {
            Ok(sock) => sock,
            Err(e) => {
                tracing::error!(error = %e, "Cannot prepare accepted socket");
                continue;
            }
        };
        if let Some(future) = on_accept(sock) {
            if let Err(e) = rt.spawn(move |_| future, 0) {
                tracing::warn!(error = %e, "Rejecting connection");
            }
        }
    }
}

fn bind(host: Option<&str>, port: u16) -> Result<std::net::TcpListener> {
    match host.filter(|h| !h.is_empty() && *h != "::" && *h != "[::]") {
        Some(host) => {
            let addr = (host, port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| Error::BadArgs(format!("cannot resolve {host}")))?;
            bind_addr(addr, false)
        }
        None => bind_addr(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)), true)
            .or_else(|_| bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), false)),
    }
}

fn bind_addr(addr: SocketAddr, dual_stack: bool) -> Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if dual_stack {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}
