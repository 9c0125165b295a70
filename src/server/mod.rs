//! The web host: configuration, routes, actions and sessions shared by every
//! connection, plus the listeners that accept them.

pub mod listener;

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::config::WebConfig;
use crate::error::{Error, Result};
use crate::http::connection::{Action, ActionFuture, Web};
use crate::http::mime::MimeTypes;
use crate::http::request::Request;
use crate::http::route::{Roles, Route};
use crate::http::session::SessionTable;
use crate::runtime::tls::TlsTransport;
use crate::runtime::{Listener, Runtime};
use crate::signature::Signatures;

pub use listener::Endpoint;

/// How often expired sessions are swept
const PRUNE_PERIOD: Duration = Duration::from_secs(60);

pub struct Host {
    config: WebConfig,
    routes: Vec<Route>,
    actions: RefCell<Vec<(String, Action)>>,
    roles: Roles,
    mime: MimeTypes,
    signatures: Option<Signatures>,
    sessions: RefCell<SessionTable>,
    connections: Cell<usize>,
    listeners: RefCell<Vec<Listener>>,
    https_port: Cell<Option<u16>>,
    show: Show,
    stopping: Cell<bool>,
    #[cfg(feature = "tls")]
    tls: Option<std::sync::Arc<rustls::ServerConfig>>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("routes", &self.routes.len())
            .field("connections", &self.connections.get())
            .field("sessions", &self.sessions.borrow().len())
            .finish()
    }
}

impl Host {
    pub fn new(config: WebConfig) -> Result<Self> {
        let mut routes: Vec<Route> = config.routes.iter().map(Route::from_config).collect();
        if routes.is_empty() {
            routes.push(Route::documents());
        }
        let roles = Roles::new(&config.auth.roles);
        for route in &routes {
            if let Some(role) = route.role.as_deref().filter(|r| !roles.is_known(r)) {
                tracing::warn!(route = %route.pattern, role, "Route requires an unknown role");
            }
        }

        let signatures = match (&config.signatures.path, config.signatures.enable) {
            (Some(path), true) => Some(Signatures::load(path, config.signatures.strict)?),
            (None, true) => return Err(Error::BadArgs("signatures enabled without a path".to_string())),
            _ => None,
        };

        #[cfg(feature = "tls")]
        let tls = if config.tls.certificate.is_some() {
            Some(crate::runtime::tls::server_config(&config.tls)?)
        } else {
            None
        };

        Ok(Self {
            routes,
            actions: RefCell::new(Vec::new()),
            roles,
            mime: MimeTypes::new(&config.mime),
            signatures,
            sessions: RefCell::new(SessionTable::new(config.limits.sessions, config.timeouts.session)),
            connections: Cell::new(0),
            listeners: RefCell::new(Vec::new()),
            https_port: Cell::new(None),
            show: Show::parse(&config.show),
            stopping: Cell::new(false),
            #[cfg(feature = "tls")]
            tls,
            config,
        })
    }

    /// Binds an action to every path under `prefix`. The longest
    /// registered prefix wins.
    pub fn add_action<F>(&self, prefix: &str, action: F)
    where
        F: for<'a> Fn(&'a mut Web) -> ActionFuture<'a> + 'static,
    {
        tracing::debug!(prefix, "Action registered");
        self.actions.borrow_mut().push((prefix.to_string(), Rc::new(action)));
    }

    pub fn find_action(&self, path: &str) -> Option<Action> {
        self.actions
            .borrow()
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, action)| action.clone())
    }

    /// Opens every configured listener and starts session pruning.
    pub fn start(self: &Rc<Self>, rt: &Runtime) -> Result<()> {
        self.stopping.set(false);
        for spec in &self.config.listen {
            let endpoint = Endpoint::parse(spec)?;
            let listener = listener::listen(self, rt, &endpoint)?;
            if endpoint.secure {
                self.https_port.set(Some(listener.local_addr().port()));
            }
            self.listeners.borrow_mut().push(listener);
        }
        let weak = Rc::downgrade(self);
        let sleeper = rt.clone();
        rt.spawn_detached("session-prune", async move {
            prune_sessions(weak, sleeper).await;
        });
        Ok(())
    }

    /// Closes the listeners. Connections in progress finish normally.
    pub fn stop(&self) {
        self.stopping.set(true);
        let closed = self.listeners.borrow_mut().drain(..).count();
        tracing::info!(listeners = closed, "Host stopped");
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.borrow().iter().map(Listener::local_addr).collect()
    }

    pub fn config(&self) -> &WebConfig {
        &self.config
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn roles(&self) -> &Roles {
        &self.roles
    }

    pub fn mime(&self) -> &MimeTypes {
        &self.mime
    }

    pub fn signatures(&self) -> Option<&Signatures> {
        self.signatures.as_ref()
    }

    pub fn sessions(&self) -> &RefCell<SessionTable> {
        &self.sessions
    }

    pub fn https_port(&self) -> Option<u16> {
        self.https_port.get()
    }

    pub fn show(&self) -> &Show {
        &self.show
    }

    pub fn connections(&self) -> usize {
        self.connections.get()
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.set(self.connections.get() + 1);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections.set(self.connections.get().saturating_sub(1));
    }

    #[cfg(feature = "tls")]
    pub(crate) fn tls_transport(&self) -> Result<Box<dyn TlsTransport>> {
        let config = self
            .tls
            .clone()
            .ok_or_else(|| Error::Tls("no certificate configured".to_string()))?;
        Ok(Box::new(crate::runtime::tls::RustlsTransport::server(config)?))
    }

    #[cfg(not(feature = "tls"))]
    pub(crate) fn tls_transport(&self) -> Result<Box<dyn TlsTransport>> {
        Err(Error::Tls("built without TLS support".to_string()))
    }
}

async fn prune_sessions(host: Weak<Host>, rt: Runtime) {
    loop {
        if rt.sleep(PRUNE_PERIOD).await.is_err() {
            return;
        }
        let Some(host) = host.upgrade() else { return };
        if host.stopping.get() {
            return;
        }
        let pruned = host.sessions.borrow_mut().prune(Instant::now());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned expired sessions");
        }
    }
}

/// Request and response display toggles from `web.show`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Show {
    pub request_headers: bool,
    pub request_body: bool,
    pub response_headers: bool,
    pub response_body: bool,
}

impl Show {
    /// `H`/`B` show request headers/body, `h`/`b` response headers/body.
    pub fn parse(flags: &str) -> Self {
        Self {
            request_headers: flags.contains('H'),
            request_body: flags.contains('B'),
            response_headers: flags.contains('h'),
            response_body: flags.contains('b'),
        }
    }

    pub fn request_head(&self, request: &Request) {
        if !self.request_headers {
            return;
        }
        let mut head = format!("{} {} {}\n", request.method, request.url, request.version.as_str());
        for (name, value) in request.headers.iter() {
            head.push_str(&format!("{name}: {value}\n"));
        }
        tracing::info!(target: "strand::show", "Request\n{head}");
    }

    pub fn request_body(&self, request: &Request) {
        if self.request_body && !request.body.is_empty() {
            tracing::info!(target: "strand::show", "Request body\n{}", String::from_utf8_lossy(&request.body));
        }
    }

    pub fn response_head(&self, head: &[u8]) {
        if self.response_headers {
            tracing::info!(target: "strand::show", "Response\n{}", String::from_utf8_lossy(head).trim_end());
        }
    }

    pub fn response_body(&self, body: &[u8]) {
        if self.response_body {
            tracing::info!(target: "strand::show", "Response body\n{}", String::from_utf8_lossy(body));
        }
    }
}
