use strand::http::parser::{BodyKind, ParseError, body_kind, parse_http_request};
use strand::http::request::{Method, Version};

#[test]
fn test_parse_simple_get_request() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::GET);
    assert_eq!(parsed.path, "/");
    assert_eq!(parsed.version, Version::Http11);
    assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_consumes_head_only() {
    let req = b"POST /api HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::POST);
    assert_eq!(parsed.path, "/api");
    assert!(parsed.body.is_empty());
    assert_eq!(&req[consumed..], b"hello");
    assert_eq!(body_kind(&parsed).unwrap(), BodyKind::Length(5));
}

#[test]
fn test_parse_multiple_headers() {
    let req = b"GET /path HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test-client\r\nAccept: */*\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
    assert_eq!(parsed.headers.get("user-agent").unwrap(), "test-client");
    assert_eq!(parsed.headers.get("Accept").unwrap(), "*/*");
}

#[test]
fn test_parse_request_with_path_and_query_string() {
    let req = b"GET /search?q=rust#top HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.url, "/search?q=rust#top");
    assert_eq!(parsed.path, "/search");
    assert_eq!(parsed.query, "q=rust");
    assert_eq!(parsed.hash, "top");
}

#[test]
fn test_parse_decodes_and_normalizes_path() {
    let req = b"GET /a/./b/../c%20d HTTP/1.1\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.path, "/a/c d");
}

#[test]
fn test_parse_rejects_traversal_above_root() {
    let req = b"GET /../etc/passwd HTTP/1.1\r\n\r\n";
    assert_eq!(parse_http_request(req).unwrap_err(), ParseError::InvalidUrl);
}

#[test]
fn test_parse_incomplete_request_missing_blank_line() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
    let result = parse_http_request(req);

    assert!(matches!(result, Err(ParseError::Incomplete)));
}

#[test]
fn test_parse_skips_leading_blank_lines() {
    let req = b"\r\n\r\nGET / HTTP/1.1\r\n\r\n";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.path, "/");
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_unknown_method_is_preserved() {
    let req = b"PROPFIND / HTTP/1.1\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::Other("PROPFIND".to_string()));
}

#[test]
fn test_parse_invalid_http_method() {
    let req = b"GE(T / HTTP/1.1\r\n\r\n";
    let result = parse_http_request(req);

    assert!(matches!(result, Err(ParseError::InvalidMethod)));
}

#[test]
fn test_parse_invalid_version() {
    let req = b"GET / HTTP/2.0\r\n\r\n";
    assert_eq!(parse_http_request(req).unwrap_err(), ParseError::InvalidVersion);
}

#[test]
fn test_parse_http10() {
    let req = b"GET / HTTP/1.0\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.version, Version::Http10);
    assert!(!parsed.keep_alive());
}

#[test]
fn test_parse_malformed_header() {
    let req = b"GET / HTTP/1.1\r\nBrokenHeader\r\n\r\n";
    let result = parse_http_request(req);

    assert!(matches!(result, Err(ParseError::InvalidHeader)));
}

#[test]
fn test_parse_rejects_header_name_with_space() {
    let req = b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n";
    assert_eq!(parse_http_request(req).unwrap_err(), ParseError::InvalidHeader);
}

#[test]
fn test_parse_rejects_bare_newline_in_value() {
    let req = b"GET / HTTP/1.1\r\nX-Test: a\nInjected: b\r\n\r\n";
    assert_eq!(parse_http_request(req).unwrap_err(), ParseError::InvalidHeader);
}

#[test]
fn test_parse_rejects_extra_spaces_in_request_line() {
    let req = b"GET  / HTTP/1.1\r\n\r\n";
    assert_eq!(parse_http_request(req).unwrap_err(), ParseError::InvalidRequest);
}

#[test]
fn test_parse_various_http_methods() {
    let methods = vec![
        ("GET", Method::GET),
        ("POST", Method::POST),
        ("PUT", Method::PUT),
        ("DELETE", Method::DELETE),
        ("HEAD", Method::HEAD),
        ("OPTIONS", Method::OPTIONS),
        ("TRACE", Method::TRACE),
        ("PATCH", Method::PATCH),
    ];

    for (method_str, expected_method) in methods {
        let req = format!("{} / HTTP/1.1\r\n\r\n", method_str);
        let (parsed, _) = parse_http_request(req.as_bytes()).unwrap();
        assert_eq!(parsed.method, expected_method);
    }
}

#[test]
fn test_body_kind_zero_length_is_none() {
    let req = b"POST /api HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(body_kind(&parsed).unwrap(), BodyKind::None);
}

#[test]
fn test_body_kind_chunked() {
    let req = b"POST /api HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(body_kind(&parsed).unwrap(), BodyKind::Chunked);
}

#[test]
fn test_length_and_chunked_together_are_rejected() {
    let req = b"POST /api HTTP/1.1\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\n";
    assert_eq!(parse_http_request(req).unwrap_err(), ParseError::ConflictingLength);
}

#[test]
fn test_conflicting_content_lengths_are_rejected() {
    let req = b"POST /api HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n";
    assert_eq!(parse_http_request(req).unwrap_err(), ParseError::InvalidContentLength);
}

#[test]
fn test_non_numeric_content_length_is_rejected() {
    let req = b"POST /api HTTP/1.1\r\nContent-Length: +4\r\n\r\n";
    assert_eq!(parse_http_request(req).unwrap_err(), ParseError::InvalidContentLength);
}

#[test]
fn test_unknown_transfer_encoding_is_rejected() {
    let req = b"POST /api HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n";
    assert_eq!(parse_http_request(req).unwrap_err(), ParseError::InvalidTransferEncoding);
}

#[test]
fn test_parse_header_case_preservation() {
    let req = b"GET / HTTP/1.1\r\nContent-Type: application/json\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    let (name, value) = parsed.headers.iter().next().unwrap();
    assert_eq!(name, "Content-Type");
    assert_eq!(value, "application/json");
}
