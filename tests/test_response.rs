use strand::http::response::{Response, ResponseBuilder, StatusCode, reason_phrase};
use strand::http::writer::{http_date, parse_http_date, serialize_head, serialize_response, valid_header};
use strand::http::request::Version;

#[test]
fn test_status_code_as_u16() {
    assert_eq!(StatusCode::Ok.as_u16(), 200);
    assert_eq!(StatusCode::Created.as_u16(), 201);
    assert_eq!(StatusCode::NoContent.as_u16(), 204);
    assert_eq!(StatusCode::BadRequest.as_u16(), 400);
    assert_eq!(StatusCode::NotFound.as_u16(), 404);
    assert_eq!(StatusCode::MethodNotAllowed.as_u16(), 405);
    assert_eq!(StatusCode::InternalServerError.as_u16(), 500);
}

#[test]
fn test_status_code_reason_phrase() {
    assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    assert_eq!(StatusCode::Created.reason_phrase(), "Created");
    assert_eq!(StatusCode::NoContent.reason_phrase(), "No Content");
    assert_eq!(StatusCode::BadRequest.reason_phrase(), "Bad Request");
    assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    assert_eq!(
        StatusCode::MethodNotAllowed.reason_phrase(),
        "Method Not Allowed"
    );
    assert_eq!(
        StatusCode::InternalServerError.reason_phrase(),
        "Internal Server Error"
    );
}

#[test]
fn test_response_builder_basic() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .body(b"Hello, World!".to_vec())
        .build();

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body, b"Hello, World!".to_vec());
}

#[test]
fn test_response_builder_with_headers() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", "text/plain")
        .header("X-Custom", "value")
        .body(b"test".to_vec())
        .build();

    assert_eq!(response.headers.get("Content-Type").unwrap(), "text/plain");
    assert_eq!(response.headers.get("X-Custom").unwrap(), "value");
}

#[test]
fn test_response_builder_auto_content_length() {
    let body = b"This is the body".to_vec();
    let response = ResponseBuilder::new(StatusCode::Ok)
        .body(body.clone())
        .build();

    let content_length = response.headers.get("Content-Length").unwrap();
    assert_eq!(content_length, &body.len().to_string());
}

#[test]
fn test_response_builder_preserves_custom_content_length() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Length", "999")
        .body(b"test".to_vec())
        .build();

    // Should keep the custom value
    assert_eq!(response.headers.get("Content-Length").unwrap(), "999");
}

#[test]
fn test_response_builder_multiple_headers() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-cache")
        .header("X-Frame-Options", "DENY")
        .body(b"{}".to_vec())
        .build();

    assert_eq!(response.headers.len(), 4); // 3 custom + 1 auto (Content-Length)
    assert_eq!(
        response.headers.get("Content-Type").unwrap(),
        "application/json"
    );
    assert_eq!(response.headers.get("Cache-Control").unwrap(), "no-cache");
    assert_eq!(response.headers.get("X-Frame-Options").unwrap(), "DENY");
}

#[test]
fn test_response_builder_empty_body() {
    let response = ResponseBuilder::new(StatusCode::Ok).build();

    assert_eq!(response.body.len(), 0);
    assert_eq!(response.headers.get("Content-Length").unwrap(), "0");
}

#[test]
fn test_response_builder_no_length_when_body_forbidden() {
    for status in [StatusCode::SwitchingProtocols, StatusCode::NoContent, StatusCode::NotModified] {
        let response = ResponseBuilder::new(status).build();
        assert!(response.headers.get("Content-Length").is_none());
    }
}

#[test]
fn test_response_builder_various_status_codes() {
    let statuses = vec![
        StatusCode::Ok,
        StatusCode::Created,
        StatusCode::BadRequest,
        StatusCode::NotFound,
    ];

    for status in statuses {
        let response = ResponseBuilder::new(status).body(b"test".to_vec()).build();
        assert_eq!(response.status, status);
    }
}

#[test]
fn test_response_builder_fluent_api() {
    // Test that builder methods return self for chaining
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Header1", "value1")
        .header("Header2", "value2")
        .header("Header3", "value3")
        .body(b"body".to_vec())
        .build();

    assert_eq!(response.headers.len(), 4); // 3 custom + 1 auto
}

#[test]
fn test_response_ok_helper() {
    let response = Response::ok(b"test content".to_vec());

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body, b"test content".to_vec());
}

#[test]
fn test_response_not_found_helper() {
    let response = Response::not_found();

    assert_eq!(response.status, StatusCode::NotFound);
    assert_eq!(response.body, b"404 Not Found".to_vec());
}

#[test]
fn test_response_internal_error_helper() {
    let response = Response::internal_error();

    assert_eq!(response.status, StatusCode::InternalServerError);
    assert_eq!(response.body, b"500 Internal Server Error".to_vec());
}

#[test]
fn test_status_code_round_trips_through_u16() {
    for code in [101, 200, 201, 204, 301, 302, 304, 400, 401, 403, 404, 405, 413, 414, 500] {
        assert_eq!(StatusCode::from_u16(code).unwrap().as_u16(), code);
    }
    assert_eq!(StatusCode::from_u16(299), None);
}

#[test]
fn test_reason_phrase_for_unknown_code() {
    assert_eq!(reason_phrase(404), "Not Found");
    assert!(!reason_phrase(599).is_empty());
}

#[test]
fn test_redirect_helper() {
    let response = Response::redirect(StatusCode::MovedPermanently, "/docs/");

    assert_eq!(response.status, StatusCode::MovedPermanently);
    assert_eq!(response.headers.get("Location").unwrap(), "/docs/");
}

#[test]
fn test_serialize_head() {
    let head = serialize_head(Version::Http10, 404, [("Content-Length", "0")]);

    assert_eq!(head, b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec());
}

#[test]
fn test_serialize_response_ends_with_body() {
    let response = Response::ok("hi");
    let bytes = serialize_response(&response);
    let text = String::from_utf8(bytes).unwrap();

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Length: 2\r\n"));
    assert!(text.ends_with("\r\n\r\nhi"));
}

#[test]
fn test_valid_header_rejects_line_breaks() {
    assert!(valid_header("X-Test", "value"));
    assert!(!valid_header("X-Test", "a\r\nSet-Cookie: x"));
    assert!(!valid_header("Bad Name", "value"));
}

#[test]
fn test_http_date_parses_back() {
    let now = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(784_111_777);
    let text = http_date(now);

    assert_eq!(text, "Sun, 06 Nov 1994 08:49:37 GMT");
    assert_eq!(parse_http_date(&text).unwrap().timestamp(), 784_111_777);
}
