mod common;

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use common::{INDEX, PEER_CLOSE_CODES, body, connect, exchange, header, read_head, status};
use serde_json::json;
use strand::http::websocket::{OpCode, encode_frame};

const MASK: [u8; 4] = [1, 2, 3, 4];

#[test]
fn test_get_document() {
    let server = common::start();
    let response = exchange(&server, b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

    assert_eq!(status(&response), 200);
    assert_eq!(body(&response), INDEX);
    assert_eq!(header(&response, "Content-Length"), Some(INDEX.len().to_string().as_str()));
    assert_eq!(header(&response, "Content-Type"), Some("text/html"));
    assert_eq!(header(&response, "Connection"), Some("close"));
    assert!(header(&response, "Last-Modified").is_some());
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let server = common::start();
    let mut stream = connect(&server);

    for _ in 0..2 {
        stream.write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let head = read_head(&mut stream);
        assert_eq!(status(&head), 200);
        assert_eq!(header(&head, "Connection"), Some("keep-alive"));

        let mut content = vec![0u8; INDEX.len()];
        stream.read_exact(&mut content).unwrap();
        assert_eq!(content, INDEX.as_bytes());
    }
}

#[test]
fn test_pipelined_requests() {
    let server = common::start();
    let response = exchange(
        &server,
        b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n\
          GET /docs/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );

    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
    let first = response.find(INDEX).unwrap();
    let second = response.find("<html>docs</html>").unwrap();
    assert!(first < second);
}

#[test]
fn test_http10_closes_after_response() {
    let server = common::start();
    let response = exchange(&server, b"GET /index.html HTTP/1.0\r\n\r\n");

    assert!(response.starts_with("HTTP/1.0 200"));
    assert_eq!(header(&response, "Connection"), Some("close"));
    assert_eq!(body(&response), INDEX);
}

#[test]
fn test_head_has_length_without_body() {
    let server = common::start();
    let response = exchange(&server, b"HEAD /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

    assert_eq!(status(&response), 200);
    assert_eq!(header(&response, "Content-Length"), Some(INDEX.len().to_string().as_str()));
    assert_eq!(body(&response), "");
}

#[test]
fn test_missing_document_is_404() {
    let server = common::start();
    let response = exchange(&server, b"GET /missing.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

    assert_eq!(status(&response), 404);
}

#[test]
fn test_directory_without_slash_redirects() {
    let server = common::start();
    let response = exchange(&server, b"GET /docs?x=1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

    assert_eq!(status(&response), 301);
    assert_eq!(header(&response, "Location"), Some("/docs/?x=1"));
}

#[test]
fn test_method_not_allowed_lists_allowed_methods() {
    let server = common::start();

    let response = exchange(&server, b"DELETE /upload/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    assert_eq!(status(&response), 405);
    assert_eq!(header(&response, "Allow"), Some("POST"));

    let response = exchange(
        &server,
        b"POST /index.html HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(status(&response), 405);
    assert_eq!(header(&response, "Allow"), Some("GET, HEAD"));
}

#[test]
fn test_protected_route_requires_login() {
    let server = common::start();
    let response = exchange(&server, b"GET /private/data HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

    assert_eq!(status(&response), 401);
    assert!(!body(&response).contains("secret"));
}

#[test]
fn test_chunked_request_body_reaches_action() {
    let server = common::start();
    let response = exchange(
        &server,
        b"POST /api/echo HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
          5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    );

    assert_eq!(status(&response), 200);
    assert_eq!(header(&response, "Content-Length"), Some("11"));
    assert_eq!(body(&response), "hello world");
}

#[test]
fn test_expect_continue() {
    let server = common::start();
    let mut stream = connect(&server);
    stream
        .write_all(b"POST /api/echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\nExpect: 100-continue\r\nConnection: close\r\n\r\n")
        .unwrap();

    let interim = read_head(&mut stream);
    assert_eq!(status(&interim), 100);

    stream.write_all(b"ping").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert_eq!(status(&response), 200);
    assert_eq!(body(&response), "ping");
}

#[test]
fn test_oversized_body_is_rejected() {
    let server = common::start();
    let response = exchange(
        &server,
        b"POST /api/echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10000000\r\n\r\n",
    );

    assert_eq!(status(&response), 413);
    assert_eq!(header(&response, "Connection"), Some("close"));
}

#[test]
fn test_unknown_action_is_404() {
    let server = common::start();
    let response = exchange(&server, b"GET /api/nothing HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

    assert_eq!(status(&response), 404);
}

#[test]
fn test_failing_action_is_500() {
    let server = common::start();
    let response = exchange(&server, b"GET /api/fail HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

    assert_eq!(status(&response), 500);
    assert!(!body(&response).contains("handler gave up"));
}

fn multipart_request(filename: &str) -> Vec<u8> {
    let part = format!(
        "--XyZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         Content-Type: text/plain\r\n\r\nsome data\r\n--XyZ--\r\n"
    );
    let mut request = format!(
        "POST /upload/ HTTP/1.1\r\nHost: localhost\r\nContent-Type: multipart/form-data; boundary=XyZ\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n",
        part.len()
    )
    .into_bytes();
    request.extend_from_slice(part.as_bytes());
    request
}

#[test]
fn test_upload_is_saved_then_removed() {
    let server = common::start();
    let response = exchange(&server, &multipart_request("notes.txt"));

    assert_eq!(status(&response), 200);
    assert_eq!(body(&response), r#"{"uploads":1}"#);
    assert_eq!(std::fs::read_dir(server.upload_dir.path()).unwrap().count(), 0);
}

#[test]
fn test_upload_path_traversal_is_rejected() {
    let server = common::start();
    let response = exchange(&server, &multipart_request("../../etc/passwd"));

    assert_eq!(status(&response), 400);
    assert_eq!(std::fs::read_dir(server.upload_dir.path()).unwrap().count(), 0);
}

#[test]
fn test_header_injection_closes_without_response() {
    let server = common::start();
    let response = exchange(&server, b"GET / HTTP/1.1\r\nX-Test: a\nInjected: b\r\n\r\n");

    assert_eq!(response, "");
}

#[test]
fn test_traversal_request_closes_without_response() {
    let server = common::start();
    let response = exchange(&server, b"GET /../../etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert_eq!(response, "");
}

#[test]
fn test_encoded_control_characters_close_without_response() {
    let server = common::start();
    let response = exchange(&server, b"GET /docs%0d%0aSet-Cookie:%20x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert_eq!(response, "");
}

#[test]
fn test_directory_redirect_location_is_encoded() {
    let server = common::start();
    let response = exchange(&server, b"GET /my%20docs HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

    assert_eq!(status(&response), 301);
    assert_eq!(header(&response, "Location"), Some("/my%20docs/"));
}

#[test]
fn test_unlimited_buffer_serves_requests() {
    let server = common::start_with(json!({"web": {"limits": {"buffer": "unlimited", "header": "unlimited"}}}));
    let response = exchange(&server, b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

    assert_eq!(status(&response), 200);
    assert_eq!(body(&response), INDEX);
}

#[test]
fn test_header_block_too_large() {
    let server = common::start_with(json!({"web": {"limits": {"header": 256}}}));
    let request = format!(
        "GET /index.html HTTP/1.1\r\nHost: localhost\r\nX-Padding: {}\r\n\r\n",
        "p".repeat(400)
    );
    let response = exchange(&server, request.as_bytes());

    assert_eq!(status(&response), 414);
    assert_eq!(header(&response, "Connection"), Some("close"));
}

#[test]
fn test_connection_limit_rejects_at_admission() {
    let server = common::start_with(json!({"web": {"limits": {"connections": 1}}}));

    let mut first = connect(&server);
    first.write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    assert_eq!(status(&read_head(&mut first)), 200);

    let rejected = exchange(&server, b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(rejected, "");
    drop(first);
}

#[test]
fn test_idle_connection_times_out() {
    let server = common::start_with(json!({"web": {"timeouts": {"inactivity": "1secs"}}}));
    let mut stream = connect(&server);
    let start = Instant::now();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();

    assert!(response.is_empty());
    assert!(start.elapsed() < Duration::from_secs(8));
}

#[test]
fn test_slow_request_head_times_out() {
    let server = common::start_with(json!({"web": {"timeouts": {"parse": "1secs"}}}));
    let mut stream = connect(&server);
    let start = Instant::now();
    stream.write_all(b"GET /index.html HTTP/1.1\r\nHost: local").unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();

    assert!(response.is_empty());
    assert!(start.elapsed() < Duration::from_secs(8));
}

fn form_post(target: &str, form: &str) -> Vec<u8> {
    format!(
        "POST {target} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{form}",
        form.len()
    )
    .into_bytes()
}

#[test]
fn test_validated_form_missing_field() {
    let server = common::start();
    let response = exchange(&server, &form_post("/form/user", "age=3"));

    assert_eq!(status(&response), 400);
    assert!(body(&response).contains("\"name\""), "{response}");
}

#[test]
fn test_validated_form_is_filtered() {
    let server = common::start();
    let response = exchange(&server, &form_post("/form/user", "name=ann&email=evil&extra=1"));

    assert_eq!(status(&response), 200);
    // Hidden and unknown fields never reach the action, defaults do
    assert_eq!(body(&response), r#"{"active":"true","name":"ann"}"#);
}

#[test]
fn test_strict_validation_checks_query_separately() {
    let server = common::start_with(json!({"web": {"signatures": {"strict": true}}}));

    let response = exchange(&server, &form_post("/form/user?x=1", "name=ann"));
    assert_eq!(status(&response), 200);
    assert_eq!(body(&response), r#"{"active":"true","name":"ann","x":"1"}"#);

    let response = exchange(&server, &form_post("/form/user?y=1", "name=ann"));
    assert_eq!(status(&response), 400);
    assert!(body(&response).contains("query"), "{response}");
    assert!(body(&response).contains("\"y\""), "{response}");
}

#[test]
fn test_websocket_echo() {
    let server = common::start();
    let mut stream = connect(&server);
    stream
        .write_all(
            b"GET /ws/ HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    let head = read_head(&mut stream);
    assert_eq!(status(&head), 101);
    assert_eq!(header(&head, "Sec-WebSocket-Accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    assert_eq!(header(&head, "Upgrade"), Some("websocket"));

    stream.write_all(&encode_frame(OpCode::Text, b"hi", true, Some(MASK))).unwrap();
    let mut echo = [0u8; 4];
    stream.read_exact(&mut echo).unwrap();
    assert_eq!(echo, [0x81, 0x02, b'h', b'i']);

    stream.write_all(&encode_frame(OpCode::Close, &1000u16.to_be_bytes(), true, Some(MASK))).unwrap();
    let mut close = [0u8; 4];
    stream.read_exact(&mut close).unwrap();
    assert_eq!(close, [0x88, 0x02, 0x03, 0xe8]);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_websocket_bad_version() {
    let server = common::start();
    let response = exchange(
        &server,
        b"GET /ws/ HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\nConnection: close\r\n\r\n",
    );

    assert_eq!(status(&response), 400);
    assert_eq!(header(&response, "Sec-WebSocket-Version"), Some("13"));
}

#[test]
fn test_websocket_server_close_waits_for_peer() {
    let server = common::start();
    let mut stream = connect(&server);
    stream
        .write_all(
            b"GET /ws/bye HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    assert_eq!(status(&read_head(&mut stream)), 101);

    let mut frames = [0u8; 9];
    stream.read_exact(&mut frames).unwrap();
    assert_eq!(frames, [0x81, 0x03, b'b', b'y', b'e', 0x88, 0x02, 0x03, 0xe8]);

    // Data after the server's close is ignored, the close reply ends it
    stream.write_all(&encode_frame(OpCode::Text, b"late", true, Some(MASK))).unwrap();
    stream.write_all(&encode_frame(OpCode::Close, &1001u16.to_be_bytes(), true, Some(MASK))).unwrap();

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    assert!(PEER_CLOSE_CODES.lock().unwrap().contains(&1001));
}
