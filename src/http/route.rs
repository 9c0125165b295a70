//! Route table and role ordering.
//!
//! Routes are checked in configuration order and the first match wins.
//! There is no longest-prefix search.

use crate::config::{HandlerKind, RouteConfig};
use crate::http::request::Method;

/// Role name that never requires authentication
pub const PUBLIC_ROLE: &str = "public";

#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: String,
    pub exact: bool,
    /// Empty means any method
    pub methods: Vec<Method>,
    pub handler: HandlerKind,
    pub role: Option<String>,
    pub redirect: Option<String>,
    pub trim: Option<String>,
    pub stream: bool,
    pub validate: bool,
}

impl Route {
    pub fn from_config(config: &RouteConfig) -> Self {
        let mut methods: Vec<Method> = config
            .methods
            .iter()
            .filter(|m| m.as_str() != "*")
            .filter_map(|m| Method::from_str(&m.to_ascii_uppercase()))
            .collect();
        let any = config.methods.iter().any(|m| m == "*");
        if any {
            methods.clear();
        } else if methods.is_empty() && config.handler == HandlerKind::File {
            methods = vec![Method::GET, Method::HEAD];
        }
        Self {
            pattern: config.pattern.clone(),
            exact: config.exact,
            methods,
            handler: config.handler,
            role: config.role.clone().filter(|r| !r.is_empty()),
            redirect: config.redirect.clone(),
            trim: config.trim.clone(),
            stream: config.stream,
            validate: config.validate,
        }
    }

    /// A catch-all file route.
    pub fn documents() -> Self {
        Self::from_config(&RouteConfig::default())
    }

    /// Prefix match, or whole-path match for exact routes. A prefix ending
    /// in `/` also matches the same path without the slash, so `/api/`
    /// covers `/api`.
    pub fn matches(&self, path: &str) -> bool {
        if self.exact {
            return path == self.pattern;
        }
        if path.starts_with(&self.pattern) {
            return true;
        }
        match self.pattern.strip_suffix('/') {
            Some(dir) if !dir.is_empty() => path == dir,
            _ => false,
        }
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// Value for an `Allow` header.
    pub fn allow_header(&self) -> String {
        self.methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// True when the route needs an authenticated principal.
    pub fn is_protected(&self) -> bool {
        self.role.as_deref().is_some_and(|r| r != PUBLIC_ROLE)
    }

    /// Applies `trim` to a request path.
    pub fn trim_path(&self, path: &str) -> String {
        match self.trim.as_deref().and_then(|t| path.strip_prefix(t)) {
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            Some(rest) => format!("/{rest}"),
            None => path.to_string(),
        }
    }
}

/// First route matching `path`, in table order.
pub fn find_route<'a>(routes: &'a [Route], path: &str) -> Option<(usize, &'a Route)> {
    routes.iter().enumerate().find(|(_, r)| r.matches(path))
}

/// Roles from least to most privileged. A principal holding a role also
/// satisfies every role listed before it.
#[derive(Debug, Clone, Default)]
pub struct Roles {
    order: Vec<String>,
}

impl Roles {
    pub fn new(order: &[String]) -> Self {
        Self {
            order: order.to_vec(),
        }
    }

    fn rank(&self, role: &str) -> Option<usize> {
        self.order.iter().position(|r| r == role)
    }

    pub fn is_known(&self, role: &str) -> bool {
        role == PUBLIC_ROLE || self.rank(role).is_some()
    }

    /// True if `have` meets `need`. Public needs nothing; unknown roles on
    /// either side only satisfy themselves.
    pub fn satisfies(&self, have: Option<&str>, need: &str) -> bool {
        if need.is_empty() || need == PUBLIC_ROLE {
            return true;
        }
        let Some(have) = have else { return false };
        if have == need {
            return true;
        }
        match (self.rank(have), self.rank(need)) {
            (Some(h), Some(n)) => h >= n,
            _ => false,
        }
    }
}
