//! Request target validation, percent-decoding and path normalization.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use url::form_urlencoded;

/// Characters permitted anywhere in a request target.
fn is_url_char(c: u8) -> bool {
    (0x21..0x7f).contains(&c)
        && !matches!(c, b'"' | b'<' | b'>' | b'\\' | b'^' | b'`' | b'{' | b'|' | b'}')
}

pub fn validate(url: &str) -> bool {
    !url.is_empty() && url.bytes().all(is_url_char)
}

/// Splits a target into `(path, query, hash)` without decoding.
pub fn split(url: &str) -> (&str, &str, &str) {
    let (rest, hash) = url.split_once('#').unwrap_or((url, ""));
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    (path, query, hash)
}

fn valid_escapes(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.iter().enumerate().all(|(i, &c)| {
        c != b'%'
            || matches!(
                (bytes.get(i + 1), bytes.get(i + 2)),
                (Some(hi), Some(lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit()
            )
    })
}

/// Percent-decodes a path. Malformed escapes, control characters (NUL,
/// CR, LF, DEL, ...) and invalid UTF-8 fail.
pub fn decode(s: &str) -> Option<String> {
    if !valid_escapes(s) {
        return None;
    }
    let decoded = percent_decode_str(s).decode_utf8().ok()?;
    if decoded.bytes().any(|c| c < 0x20 || c == 0x7f) {
        return None;
    }
    Some(decoded.into_owned())
}

/// Decodes `application/x-www-form-urlencoded` text (`+` is a space).
pub fn decode_form(s: &str) -> Option<String> {
    if !valid_escapes(s) {
        return None;
    }
    let spaced = s.replace('+', " ");
    let decoded = percent_decode_str(&spaced).decode_utf8().ok()?;
    if decoded.contains('\0') {
        return None;
    }
    Some(decoded.into_owned())
}

/// Collapses `.`, `..` and repeated separators.
///
/// A trailing separator (or a final `.`/`..` segment) is kept as a trailing
/// `/`. Climbing above the root fails instead of clamping.
pub fn normalize(path: &str) -> Option<String> {
    if !path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return None;
    }
    let mut segments: Vec<&str> = Vec::new();
    let mut dir = false;
    for segment in path.split('/').skip(1) {
        dir = false;
        match segment {
            "" | "." => dir = true,
            ".." => {
                segments.pop()?;
                dir = true;
            }
            s => segments.push(s),
        }
    }
    let mut out = String::with_capacity(path.len());
    for segment in &segments {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() || dir {
        out.push('/');
    }
    Some(out)
}

/// Validates, splits, decodes and normalizes a request target.
pub fn parse_target(url: &str) -> Option<(String, String, String)> {
    if !validate(url) {
        return None;
    }
    if url == "*" {
        return Some(("*".to_string(), String::new(), String::new()));
    }
    let (path, query, hash) = split(url);
    let path = normalize(&decode(path)?)?;
    Some((path, query.to_string(), hash.to_string()))
}

/// Parses `a=1&b=two` pairs. Pairs with an empty name are skipped.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Unreserved characters and `/` pass through `encode_path` unchanged.
const PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Percent-encodes everything except unreserved characters and `/`.
pub fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_SET).to_string()
}
