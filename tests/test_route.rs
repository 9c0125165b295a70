use strand::config::{HandlerKind, RouteConfig};
use strand::http::request::Method;
use strand::http::route::{Roles, Route, find_route};

fn route(pattern: &str, handler: HandlerKind) -> Route {
    Route::from_config(&RouteConfig {
        pattern: pattern.to_string(),
        handler,
        ..RouteConfig::default()
    })
}

fn roles() -> Roles {
    Roles::new(&["user".to_string(), "admin".to_string(), "owner".to_string()])
}

#[test]
fn test_route_first_match_wins() {
    let mut exact = route("/api/v2", HandlerKind::Action);
    exact.exact = true;
    let routes = vec![route("/api/", HandlerKind::Action), exact, route("", HandlerKind::File)];

    // The earlier prefix route shadows the later exact one
    let (index, _) = find_route(&routes, "/api/v2").unwrap();
    assert_eq!(index, 0);

    let (index, matched) = find_route(&routes, "/index.html").unwrap();
    assert_eq!(index, 2);
    assert_eq!(matched.handler, HandlerKind::File);
}

#[test]
fn test_route_prefix_with_slash_matches_bare_directory() {
    let api = route("/api/", HandlerKind::Action);

    assert!(api.matches("/api"));
    assert!(api.matches("/api/users"));
    assert!(!api.matches("/apiary"));
}

#[test]
fn test_route_no_match() {
    let routes = vec![route("/static/", HandlerKind::File)];

    assert!(find_route(&routes, "/other").is_none());
}

#[test]
fn test_route_file_defaults_to_get_and_head() {
    let files = route("", HandlerKind::File);
    assert!(files.allows(&Method::GET));
    assert!(files.allows(&Method::HEAD));
    assert!(!files.allows(&Method::POST));
    assert_eq!(files.allow_header(), "GET, HEAD");

    // Action routes accept anything unless restricted
    let actions = route("/api/", HandlerKind::Action);
    assert!(actions.allows(&Method::DELETE));
}

#[test]
fn test_route_methods_from_config() {
    let api = Route::from_config(&RouteConfig {
        pattern: "/api/".to_string(),
        handler: HandlerKind::Action,
        methods: vec!["get".to_string(), "post".to_string()],
        ..RouteConfig::default()
    });

    assert!(api.allows(&Method::POST));
    assert!(!api.allows(&Method::PUT));
    assert_eq!(api.allow_header(), "GET, POST");

    let any = Route::from_config(&RouteConfig {
        methods: vec!["*".to_string()],
        ..RouteConfig::default()
    });
    assert!(any.allows(&Method::PUT));
}

#[test]
fn test_route_trim_path() {
    let mut api = route("/api/", HandlerKind::Action);
    api.trim = Some("/api".to_string());

    assert_eq!(api.trim_path("/api/users"), "/users");
    assert_eq!(api.trim_path("/api"), "/");
    assert_eq!(api.trim_path("/other"), "/other");
}

#[test]
fn test_route_protection() {
    let mut r = route("/admin/", HandlerKind::Action);
    assert!(!r.is_protected());

    r.role = Some("public".to_string());
    assert!(!r.is_protected());

    r.role = Some("admin".to_string());
    assert!(r.is_protected());
}

#[test]
fn test_roles_satisfies_by_rank() {
    let roles = roles();

    assert!(roles.satisfies(Some("admin"), "user"));
    assert!(roles.satisfies(Some("admin"), "admin"));
    assert!(!roles.satisfies(Some("user"), "admin"));
    assert!(!roles.satisfies(None, "user"));
}

#[test]
fn test_roles_public_and_unknown() {
    let roles = roles();

    assert!(roles.satisfies(None, "public"));
    assert!(roles.satisfies(None, ""));
    assert!(roles.satisfies(Some("auditor"), "auditor"));
    assert!(!roles.satisfies(Some("owner"), "auditor"));
    assert!(!roles.satisfies(Some("auditor"), "user"));
    assert!(roles.is_known("public"));
    assert!(!roles.is_known("auditor"));
}
