use std::collections::HashMap;

use serde_json::Value;

/// HTTP request methods.
///
/// The methods the server routes on are enumerated. Any other token is
/// preserved verbatim in `Other` so routes can still list it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// TRACE - Echo the request
    TRACE,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// Any other token
    Other(String),
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Known methods are case-sensitive. Any other RFC 7230 token becomes
    /// [`Method::Other`]; anything that is not a token is rejected.
    ///
    /// # Example
    ///
    /// ```
    /// # use strand::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("PROPFIND"), Some(Method::Other("PROPFIND".into())));
    /// assert_eq!(Method::from_str("G T"), None);
    /// ```
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "TRACE" => Some(Method::TRACE),
            "PATCH" => Some(Method::PATCH),
            other if is_token(other) => Some(Method::Other(other.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::TRACE => "TRACE",
            Method::PATCH => "PATCH",
            Method::Other(s) => s,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RFC 7230 `tchar`
pub fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
        )
}

pub fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_token_char)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Header fields in arrival order. Lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Adds a field, keeping earlier fields of the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every field named `name` with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// True when the comma separated field `name` lists `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

/// Represents a parsed HTTP request from a client.
///
/// The request line and headers are filled in by the parser. The URL is
/// decoded and normalized into `path`, with the query and fragment split
/// off. `body`, `vars` and `json` are populated by the connection once the
/// body has been read.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Request target exactly as received
    pub url: String,
    /// Decoded, normalized path
    pub path: String,
    /// Raw query string without the `?`
    pub query: String,
    /// Fragment without the `#`
    pub hash: String,
    pub version: Version,
    pub headers: Headers,
    /// Buffered request body (empty for streamed routes)
    pub body: Vec<u8>,
    /// Query and form variables
    pub vars: HashMap<String, String>,
    /// Parsed `application/json` body
    pub json: Option<Value>,
}

impl Default for Method {
    fn default() -> Self {
        Method::GET
    }
}

/// Builder for constructing Request objects.
#[derive(Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    url: Option<String>,
    version: Version,
    headers: Headers,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Sets the request target. The path, query and fragment are derived
    /// from it when the request is built.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        let url = self.url.ok_or("url missing")?;
        let (path, query, hash) = crate::http::uri::parse_target(&url).ok_or("invalid url")?;
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            url,
            path,
            query,
            hash,
            version: self.version,
            headers: self.headers,
            body: self.body,
            vars: HashMap::new(),
            json: None,
        })
    }
}

impl Request {
    /// Retrieves a header value by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// The Content-Length header parsed as a number.
    ///
    /// Returns `None` if the header is missing or not a valid number. The
    /// parser has already rejected malformed lengths on received requests.
    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("Transfer-Encoding", "chunked")
    }

    /// Determines whether the connection should remain open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent.
    /// HTTP/1.0 closes unless the client asks for `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("Connection", "close"),
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
        }
    }

    /// True for a WebSocket upgrade request.
    pub fn is_upgrade(&self) -> bool {
        self.method == Method::GET
            && self
                .header("Upgrade")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
    }

    /// `Content-Type` without parameters, lowercased.
    pub fn mime_type(&self) -> Option<String> {
        self.header("Content-Type")
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
    }

    /// A query, form or explicitly set variable.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|v| v.as_str())
    }

    /// Clears everything so the struct can hold the next pipelined request.
    pub fn reset(&mut self) {
        self.method = Method::GET;
        self.url.clear();
        self.path.clear();
        self.query.clear();
        self.hash.clear();
        self.version = Version::Http11;
        self.headers.clear();
        self.body.clear();
        self.vars.clear();
        self.json = None;
    }
}
