use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::http::connection::Web;
use crate::runtime::socket::AcceptHandler;
use crate::runtime::{FiberFuture, Listener, Runtime, Socket};
use crate::server::Host;

/// A parsed `scheme://host:port` listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    /// `None` listens on every interface
    pub host: Option<String>,
    pub port: u16,
    pub secure: bool,
}

impl Endpoint {
    /// Parses `http://:8080`, `https://127.0.0.1:4443`, `http://[::1]:80`
    /// or a bare `host:port` (plain HTTP).
    pub fn parse(spec: &str) -> Result<Self> {
        let bad = || Error::BadArgs(format!("bad listen address \"{spec}\""));
        let (scheme, rest) = spec.split_once("://").unwrap_or(("http", spec));
        let scheme = scheme.to_ascii_lowercase();
        let secure = match scheme.as_str() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            _ => return Err(bad()),
        };
        let default_port = if secure { 443 } else { 80 };

        // The url crate refuses an empty host, which means "any interface"
        if let Some(port) = rest.strip_prefix(':') {
            let port = port.trim_end_matches('/').parse().map_err(|_| bad())?;
            return Ok(Self {
                scheme,
                host: None,
                port,
                secure,
            });
        }

        let url = url::Url::parse(&format!("{scheme}://{rest}")).map_err(|_| bad())?;
        let host = match url.host() {
            Some(url::Host::Domain(name)) => Some(name.to_string()),
            Some(url::Host::Ipv4(addr)) => Some(addr.to_string()),
            Some(url::Host::Ipv6(addr)) if addr.is_unspecified() => None,
            Some(url::Host::Ipv6(addr)) => Some(addr.to_string()),
            None => None,
        };
        Ok(Self {
            scheme,
            host,
            port: url.port().unwrap_or(default_port),
            secure,
        })
    }
}

/// Binds `endpoint` and serves each accepted socket on its own fiber.
pub fn listen(host: &Rc<Host>, rt: &Runtime, endpoint: &Endpoint) -> Result<Listener> {
    if endpoint.secure {
        // Fail at startup rather than on the first handshake
        host.tls_transport()?;
    }
    let weak = Rc::downgrade(host);
    let secure = endpoint.secure;
    let on_accept: AcceptHandler = Rc::new(move |sock: Socket| -> Option<FiberFuture> {
        let host = weak.upgrade()?;
        let limit = host.config().limits.connections;
        if host.connections() >= limit {
            warn!(peer = ?sock.peer(), limit, "Too many connections, rejecting");
            return None;
        }
        debug!(peer = ?sock.peer(), "Accepted connection");
        // Counted from here, so a burst of accepts sees the limit
        let mut web = Web::new(host, sock);
        Some(Box::pin(async move {
            if secure {
                let tls = match web.host().tls_transport() {
                    Ok(tls) => tls,
                    Err(e) => {
                        warn!(error = %e, "Cannot start TLS");
                        return 0;
                    }
                };
                if let Err(e) = web.upgrade_tls(tls).await {
                    debug!(peer = ?web.peer(), error = %e, "TLS handshake failed");
                    return 0;
                }
            }
            web.run().await;
            0
        }))
    });

    let listener = Listener::listen(rt, endpoint.host.as_deref(), endpoint.port, on_accept)?;
    info!(scheme = %endpoint.scheme, addr = %listener.local_addr(), "Web endpoint ready");
    Ok(listener)
}
