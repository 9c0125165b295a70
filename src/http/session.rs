//! Cookies and server-side sessions.
//!
//! A session is created lazily, the first time a handler stores a variable
//! or logs a user in, and is identified by an unguessable cookie value.
//! Every fiber touches the table from the runtime thread, so it needs no
//! locking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::http::request::Headers;

/// Random bytes per session id (hex encoded, so ids are twice as long)
const SESSION_ID_BYTES: usize = 16;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub vars: HashMap<String, String>,
    pub username: Option<String>,
    pub role: Option<String>,
    expires: Option<Instant>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    pub fn expires(&self) -> Option<Instant> {
        self.expires
    }
}

#[derive(Debug)]
pub struct SessionTable {
    sessions: HashMap<String, Session>,
    max: usize,
    lifespan: Option<Duration>,
}

impl SessionTable {
    pub fn new(max: usize, lifespan: Option<Duration>) -> Self {
        Self {
            sessions: HashMap::new(),
            max,
            lifespan,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Allocates a session with a fresh id.
    pub fn create(&mut self) -> Result<&mut Session> {
        if self.sessions.len() >= self.max {
            tracing::warn!(limit = self.max, "Too many sessions");
            return Err(Error::Limit("sessions"));
        }
        let id = loop {
            let id = new_session_id()?;
            if !self.sessions.contains_key(&id) {
                break id;
            }
        };
        let session = Session {
            id: id.clone(),
            vars: HashMap::new(),
            username: None,
            role: None,
            expires: self.lifespan.and_then(|l| Instant::now().checked_add(l)),
        };
        tracing::debug!(session = %id, "Session created");
        Ok(self.sessions.entry(id).or_insert(session))
    }

    /// Looks up a live session and extends its expiry.
    pub fn get(&mut self, id: &str) -> Option<&mut Session> {
        let now = Instant::now();
        if self
            .sessions
            .get(id)
            .is_some_and(|s| s.expires.is_some_and(|e| e <= now))
        {
            self.sessions.remove(id);
            return None;
        }
        let lifespan = self.lifespan;
        self.sessions.get_mut(id).map(|s| {
            s.expires = lifespan.and_then(|l| now.checked_add(l));
            s
        })
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Drops expired sessions, returning how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.expires.is_none_or(|e| e > now));
        before - self.sessions.len()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

/// Generates an unguessable session id.
pub fn new_session_id() -> Result<String> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    getrandom::getrandom(&mut bytes).map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    Ok(hex::encode(bytes))
}

/// Parses a `Cookie` header: `;` separated `name=value` pairs with quoted
/// values unwrapped.
pub fn parse_cookies(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Value of cookie `name` across every `Cookie` header.
pub fn get_cookie(headers: &Headers, name: &str) -> Option<String> {
    headers
        .get_all("Cookie")
        .flat_map(parse_cookies)
        .find(|(n, _)| n == name)
        .map(|(_, v)| v)
}

/// `Set-Cookie` value for the session cookie. `None` for the id clears it.
pub fn session_cookie(config: &SessionConfig, id: Option<&str>, secure: bool) -> String {
    let mut cookie = match id {
        Some(id) => format!("{}={}; Path=/", config.cookie, id),
        None => format!("{}=; Path=/; Max-Age=0", config.cookie),
    };
    if !config.same_site.is_empty() {
        cookie.push_str("; SameSite=");
        cookie.push_str(&config.same_site);
    }
    if config.http_only {
        cookie.push_str("; HttpOnly");
    }
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}
