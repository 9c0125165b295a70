use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::http::request::{Version, is_token};
use crate::http::response::{Response, reason_phrase};

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Formats an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(HTTP_DATE).to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE)
        .ok()
        .map(|t| t.and_utc())
}

/// True when `name: value` can be emitted without splitting the response.
pub fn valid_header(name: &str, value: &str) -> bool {
    is_token(name) && !value.bytes().any(|c| c == b'\r' || c == b'\n' || c == 0)
}

/// Serializes a status line and header block, including the blank line.
pub fn serialize_head<'a>(
    version: Version,
    status: u16,
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    // Status line
    let status_line = format!("{} {} {}\r\n", version.as_str(), status, reason_phrase(status));
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Serializes a complete response as HTTP/1.1.
pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = serialize_head(
        Version::Http11,
        resp.status.as_u16(),
        resp.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    );
    buf.extend_from_slice(&resp.body);
    buf
}
