use std::io::Write;
use std::time::Duration;

use serde_json::json;
use strand::config::{Config, HandlerKind, parse_duration, parse_size};

#[test]
fn test_config_defaults() {
    let cfg = Config::default();

    assert_eq!(cfg.web.listen, vec!["http://:8080".to_string()]);
    assert_eq!(cfg.web.index, "index.html");
    assert_eq!(cfg.web.limits.header, 10 * 1024);
    assert_eq!(cfg.web.timeouts.parse, Some(Duration::from_secs(5)));
    assert_eq!(cfg.web.sessions.cookie, "-web-session-");
    assert!(cfg.web.web_sockets.enable);
}

#[test]
fn test_config_from_json_value() {
    let cfg = Config::from_value(json!({
        "web": {
            "listen": ["http://127.0.0.1:9000"],
            "documents": "site",
            "routes": [
                {"match": "/api/", "handler": "action", "methods": ["get", "post"], "role": "user"},
                {"match": "", "handler": "file"}
            ],
            "limits": {"body": "1MB", "header": "8K", "connections": 5},
            "timeouts": {"inactivity": "2 mins", "request": "infinite", "session": 0},
            "webSockets": {"maxFrame": "64K", "validateUTF": false, "ping": "30secs"}
        }
    }))
    .unwrap();

    assert_eq!(cfg.web.listen, vec!["http://127.0.0.1:9000".to_string()]);
    assert_eq!(cfg.web.documents.to_str(), Some("site"));
    assert_eq!(cfg.web.routes.len(), 2);
    assert_eq!(cfg.web.routes[0].pattern, "/api/");
    assert_eq!(cfg.web.routes[0].handler, HandlerKind::Action);
    assert_eq!(cfg.web.routes[1].handler, HandlerKind::File);
    assert_eq!(cfg.web.limits.body, 1024 * 1024);
    assert_eq!(cfg.web.limits.header, 8 * 1024);
    assert_eq!(cfg.web.limits.connections, 5);
    // Unset limits keep their defaults
    assert_eq!(cfg.web.limits.sessions, 100);
    assert_eq!(cfg.web.timeouts.inactivity, Some(Duration::from_secs(120)));
    assert_eq!(cfg.web.timeouts.request, None);
    assert_eq!(cfg.web.timeouts.session, None);
    assert_eq!(cfg.web.web_sockets.max_frame, 64 * 1024);
    assert!(!cfg.web.web_sockets.validate_utf);
    assert_eq!(cfg.web.web_sockets.ping, Some(Duration::from_secs(30)));
}

#[test]
fn test_config_rejects_bad_size() {
    let result = Config::from_value(json!({"web": {"limits": {"body": "lots"}}}));

    assert!(result.is_err());
}

#[test]
fn test_config_load_json_with_overrides() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(file, r#"{{"web": {{"listen": ["http://:80"], "index": "home.html"}}}}"#).unwrap();

    let overrides = json!({"web": {"listen": ["http://:9090"]}});
    let cfg = Config::load(file.path(), Some(overrides)).unwrap();

    assert_eq!(cfg.web.listen, vec!["http://:9090".to_string()]);
    assert_eq!(cfg.web.index, "home.html");
}

#[test]
fn test_config_load_yaml() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "web:\n  index: main.html\n  limits:\n    uploads: 3").unwrap();

    let cfg = Config::load(file.path(), None).unwrap();

    assert_eq!(cfg.web.index, "main.html");
    assert_eq!(cfg.web.limits.uploads, 3);
}

#[test]
fn test_config_missing_file_is_an_error() {
    let result = Config::load(std::path::Path::new("/nonexistent/strand.json"), None);

    assert!(result.is_err());
}

#[test]
fn test_parse_size_units() {
    assert_eq!(parse_size("512"), Some(512));
    assert_eq!(parse_size("4K"), Some(4096));
    assert_eq!(parse_size("2 MB"), Some(2 * 1024 * 1024));
    assert_eq!(parse_size("1gb"), Some(1024 * 1024 * 1024));
    assert_eq!(parse_size("unlimited"), Some(usize::MAX));
    assert_eq!(parse_size("12parsecs"), None);
}

#[test]
fn test_parse_duration_units() {
    assert_eq!(parse_duration("45"), Some(Some(Duration::from_secs(45))));
    assert_eq!(parse_duration("250 msecs"), Some(Some(Duration::from_millis(250))));
    assert_eq!(parse_duration("5mins"), Some(Some(Duration::from_secs(300))));
    assert_eq!(parse_duration("2 hours"), Some(Some(Duration::from_secs(7200))));
    assert_eq!(parse_duration("1 day"), Some(Some(Duration::from_secs(86400))));
    assert_eq!(parse_duration("infinite"), Some(None));
    assert_eq!(parse_duration("soon"), None);
}

#[test]
fn test_huge_limits_do_not_overflow() {
    assert_eq!(parse_duration("18446744073709551 days"), Some(None));
    assert_eq!(parse_duration("18446744073709551615 hours"), Some(None));
    assert_eq!(parse_size("unlimited"), Some(usize::MAX));

    let config = Config::from_value(json!({
        "web": {
            "limits": {"buffer": "unlimited"},
            "timeouts": {"session": "18446744073709551 days"}
        }
    }))
    .unwrap();
    assert_eq!(config.web.limits.buffer, usize::MAX);
    assert_eq!(config.web.timeouts.session, None);
}
