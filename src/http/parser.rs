use crate::http::request::{Headers, Method, Request, Version, is_token};
use crate::http::uri;

/// Malformed framing. Any of these closes the connection without a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequest,
    #[error("invalid method")]
    InvalidMethod,
    #[error("unsupported protocol version")]
    InvalidVersion,
    #[error("invalid header")]
    InvalidHeader,
    #[error("invalid content length")]
    InvalidContentLength,
    #[error("both content length and transfer encoding present")]
    ConflictingLength,
    #[error("unsupported transfer encoding")]
    InvalidTransferEncoding,
    #[error("invalid url")]
    InvalidUrl,
    #[error("invalid chunk encoding")]
    InvalidChunk,
    #[error("header block too large")]
    HeaderTooLarge,
    #[error("incomplete request")]
    Incomplete,
}

/// How the request body is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Length(u64),
    Chunked,
}

/// Parses the request line and headers at the front of `buf`.
///
/// Returns the request (without a body) and the number of bytes the head
/// occupied, including the terminating blank line. Empty lines before the
/// request line are skipped.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let mut skip = 0;
    while buf[skip..].starts_with(b"\r\n") {
        skip += 2;
    }
    let headers_end = find_headers_end(&buf[skip..]).ok_or(ParseError::Incomplete)? + skip;
    let head = std::str::from_utf8(&buf[skip..headers_end]).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let (method, url, version) = parse_request_line(request_line)?;

    let mut headers = Headers::new();
    for line in lines {
        let (key, value) = parse_header(line)?;
        headers.append(key, value);
    }

    let (path, query, hash) = uri::parse_target(url).ok_or(ParseError::InvalidUrl)?;
    let request = Request {
        method,
        url: url.to_string(),
        path,
        query,
        hash,
        version,
        headers,
        ..Request::default()
    };
    body_kind(&request)?;

    Ok((request, headers_end + 4))
}

fn parse_request_line(line: &str) -> Result<(Method, &str, Version), ParseError> {
    let mut parts = line.split(' ');
    let method = parts.next().ok_or(ParseError::InvalidRequest)?;
    let url = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || url.is_empty() {
        return Err(ParseError::InvalidRequest);
    }
    if line.bytes().any(|c| c.is_ascii_control()) {
        return Err(ParseError::InvalidRequest);
    }
    let method = Method::from_str(method).ok_or(ParseError::InvalidMethod)?;
    let version = Version::from_str(version).ok_or(ParseError::InvalidVersion)?;
    Ok((method, url, version))
}

/// Splits one `key: value` line. Names must be tokens; values may not hold
/// control characters (a bare `\n` would let a client smuggle headers).
fn parse_header(line: &str) -> Result<(&str, &str), ParseError> {
    let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
    if !is_token(key) {
        return Err(ParseError::InvalidHeader);
    }
    let value = value.trim_matches(|c| c == ' ' || c == '\t');
    if value.bytes().any(|c| (c < 0x20 && c != b'\t') || c == 0x7f) {
        return Err(ParseError::InvalidHeader);
    }
    Ok((key, value))
}

/// Works out the body framing, rejecting ambiguous combinations.
pub fn body_kind(request: &Request) -> Result<BodyKind, ParseError> {
    let mut lengths = request.headers.get_all("Content-Length");
    let length = match lengths.next() {
        Some(first) => {
            let n = parse_length(first)?;
            if lengths.any(|other| parse_length(other) != Ok(n)) {
                return Err(ParseError::InvalidContentLength);
            }
            Some(n)
        }
        None => None,
    };

    if request.headers.contains("Transfer-Encoding") {
        if length.is_some() {
            return Err(ParseError::ConflictingLength);
        }
        let last = request
            .headers
            .get_all("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .last();
        return match last {
            Some(t) if t.eq_ignore_ascii_case("chunked") => Ok(BodyKind::Chunked),
            _ => Err(ParseError::InvalidTransferEncoding),
        };
    }

    Ok(match length {
        Some(0) | None => BodyKind::None,
        Some(n) => BodyKind::Length(n),
    })
}

fn parse_length(value: &str) -> Result<u64, ParseError> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|c| c.is_ascii_digit()) {
        return Err(ParseError::InvalidContentLength);
    }
    value.parse().map_err(|_| ParseError::InvalidContentLength)
}

pub fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
