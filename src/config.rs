//! Server configuration.
//!
//! The configuration document is JSON (or YAML when the file ends in
//! `.yaml`/`.yml`). Documents are merged as JSON trees first, so command
//! line overrides can be blended over a file, and then deserialized into
//! these types. Sizes accept suffixes (`"64K"`, `"1MB"`) and durations accept
//! units (`"30secs"`, `"5 mins"`, `"infinite"`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::json;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebConfig {
    /// Endpoints as `scheme://host:port`
    pub listen: Vec<String>,
    pub documents: PathBuf,
    pub index: String,
    pub routes: Vec<RouteConfig>,
    pub redirect: Vec<RedirectConfig>,
    pub limits: Limits,
    pub timeouts: Timeouts,
    /// Extra or overriding extension → MIME type mappings
    pub mime: HashMap<String, String>,
    pub sessions: SessionConfig,
    pub auth: AuthConfig,
    pub signatures: SignatureConfig,
    pub web_sockets: WebSocketConfig,
    pub upload: UploadConfig,
    pub tls: TlsConfig,
    /// Request/response display flags: `H`, `B` (request), `h`, `b` (response)
    pub show: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: vec!["http://:8080".to_string()],
            documents: PathBuf::from("web"),
            index: "index.html".to_string(),
            routes: Vec::new(),
            redirect: Vec::new(),
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            mime: HashMap::new(),
            sessions: SessionConfig::default(),
            auth: AuthConfig::default(),
            signatures: SignatureConfig::default(),
            web_sockets: WebSocketConfig::default(),
            upload: UploadConfig::default(),
            tls: TlsConfig::default(),
            show: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    #[default]
    File,
    Action,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    #[serde(rename = "match")]
    pub pattern: String,
    /// Match the whole path instead of a prefix
    pub exact: bool,
    /// Allowed methods. Empty means the handler's defaults.
    pub methods: Vec<String>,
    pub handler: HandlerKind,
    pub role: Option<String>,
    /// Redirect target. `https` redirects to the same path over TLS.
    pub redirect: Option<String>,
    /// Prefix removed from the path before the handler sees it
    pub trim: Option<String>,
    /// Leave the request body for the handler to read
    pub stream: bool,
    /// Validate against the signatures document
    pub validate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectConfig {
    pub from: String,
    pub to: String,
    #[serde(default = "default_redirect_status")]
    pub status: u16,
}

fn default_redirect_status() -> u16 {
    301
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    #[serde(deserialize_with = "de_size")]
    pub buffer: usize,
    #[serde(deserialize_with = "de_size")]
    pub body: usize,
    pub connections: usize,
    #[serde(deserialize_with = "de_size")]
    pub header: usize,
    pub sessions: usize,
    #[serde(deserialize_with = "de_size")]
    pub upload: usize,
    pub uploads: usize,
    pub fibers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            buffer: 16 * 1024,
            body: 100 * 1024,
            connections: 100,
            header: 10 * 1024,
            sessions: 100,
            upload: 20 * 1024 * 1024,
            uploads: 10,
            fibers: 10_000,
        }
    }
}

/// `None` disables the timeout
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(deserialize_with = "de_timeout")]
    pub parse: Option<Duration>,
    #[serde(deserialize_with = "de_timeout")]
    pub inactivity: Option<Duration>,
    #[serde(deserialize_with = "de_timeout")]
    pub request: Option<Duration>,
    #[serde(deserialize_with = "de_timeout")]
    pub session: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            parse: Some(Duration::from_secs(5)),
            inactivity: Some(Duration::from_secs(300)),
            request: Some(Duration::from_secs(600)),
            session: Some(Duration::from_secs(1800)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub cookie: String,
    pub same_site: String,
    pub http_only: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie: "-web-session-".to_string(),
            same_site: "Lax".to_string(),
            http_only: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Roles from least to most privileged
    pub roles: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            roles: ["user", "admin", "owner", "super"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    pub path: Option<PathBuf>,
    pub enable: bool,
    /// Reject unknown fields and unsigned routes instead of dropping them
    pub strict: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebSocketConfig {
    pub enable: bool,
    /// Preferred application protocol
    pub protocol: Option<String>,
    #[serde(deserialize_with = "de_timeout")]
    pub ping: Option<Duration>,
    #[serde(deserialize_with = "de_size")]
    pub max_frame: usize,
    #[serde(deserialize_with = "de_size")]
    pub max_message: usize,
    #[serde(rename = "validateUTF")]
    pub validate_utf: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enable: true,
            protocol: None,
            ping: None,
            max_frame: 128 * 1024,
            max_message: 1024 * 1024,
            validate_utf: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub dir: PathBuf,
    /// Remove uploaded files once the request completes
    pub remove: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir(),
            remove: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsConfig {
    pub certificate: Option<String>,
    pub key: Option<String>,
    pub authority: Option<String>,
    pub revoke: Option<String>,
    pub ciphers: Option<String>,
    pub alpn: Vec<String>,
    pub verify_peer: bool,
    pub verify_issuer: bool,
}

impl Config {
    /// Loads a configuration file and blends `overrides` over it.
    pub fn load(path: &Path, overrides: Option<Value>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let mut doc = parse_document(path, &text)?;
        if let Some(overrides) = overrides {
            json::blend(&mut doc, &overrides, true);
        }
        Self::from_value(doc)
    }

    pub fn from_value(doc: Value) -> anyhow::Result<Self> {
        serde_json::from_value(doc).context("Invalid configuration")
    }
}

/// Parses a JSON or YAML document into a JSON tree.
pub fn parse_document(path: &Path, text: &str) -> anyhow::Result<Value> {
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(text).with_context(|| format!("Bad YAML in {}", path.display()))
    } else {
        serde_json::from_str(text).with_context(|| format!("Bad JSON in {}", path.display()))
    }
}

/// Parses `"64K"`, `"1 MB"`, `"unlimited"` or a plain number of bytes.
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("unlimited") || s.eq_ignore_ascii_case("infinite") {
        return Some(usize::MAX);
    }
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: usize = digits.parse().ok()?;
    let scale = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return None,
    };
    n.checked_mul(scale)
}

/// Parses `"30secs"`, `"5 mins"`, `"2hours"`, `"1 day"`, `"infinite"`. A
/// bare number is seconds. `Some(None)` means no timeout.
pub fn parse_duration(s: &str) -> Option<Option<Duration>> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("infinite") || s.eq_ignore_ascii_case("never") {
        return Some(None);
    }
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().ok()?;
    let secs = match unit.trim().to_ascii_lowercase().as_str() {
        "msec" | "msecs" | "ms" => return Some(Some(Duration::from_millis(n))),
        "" | "s" | "sec" | "secs" | "second" | "seconds" => Some(n),
        "m" | "min" | "mins" | "minute" | "minutes" => n.checked_mul(60),
        "h" | "hr" | "hrs" | "hour" | "hours" => n.checked_mul(3600),
        "d" | "day" | "days" => n.checked_mul(86400),
        _ => return None,
    };
    // Too long to count is as good as forever
    Some(secs.map(Duration::from_secs))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(u64),
    Str(String),
}

fn de_size<'de, D: Deserializer<'de>>(de: D) -> Result<usize, D::Error> {
    match NumOrStr::deserialize(de)? {
        NumOrStr::Num(n) => Ok(n as usize),
        NumOrStr::Str(s) => {
            parse_size(&s).ok_or_else(|| serde::de::Error::custom(format!("bad size \"{s}\"")))
        }
    }
}

fn de_timeout<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
    match NumOrStr::deserialize(de)? {
        NumOrStr::Num(0) => Ok(None),
        NumOrStr::Num(n) => Ok(Some(Duration::from_secs(n))),
        NumOrStr::Str(s) => {
            parse_duration(&s).ok_or_else(|| serde::de::Error::custom(format!("bad duration \"{s}\"")))
        }
    }
}
