//! Route table entries: match criteria plus the policy and handler kind
//! that apply once a route is selected.

use crate::Method;
use std::path::PathBuf;

/// How a route authenticates its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// No authentication; open to anyone.
    None,
    /// `Authorization: Basic`.
    Basic,
    /// `Authorization: Digest` (RFC 7616).
    Digest,
    /// Session cookie established by a prior form login.
    Form,
    /// Application-managed: the action itself decides, the router only
    /// checks for a session.
    App,
}

/// Digest authentication hash algorithm, selectable per route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Parses the `algorithm` directive of a `Digest` Authorization header.
    /// Per RFC 7616, absence of the directive means `MD5`.
    pub(crate) fn from_header_token(token: Option<&str>) -> Option<Self> {
        match token {
            None => Some(Self::Md5),
            Some(t) if t.eq_ignore_ascii_case("MD5") => Some(Self::Md5),
            Some(t) if t.eq_ignore_ascii_case("SHA-256") => Some(Self::Sha256),
            Some(_) => None,
        }
    }
}

/// Cache-Control policy applied to a route's responses, regardless of
/// status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Public { max_age: u32 },
    Private { max_age: u32, must_revalidate: bool },
    NoCache,
    NoStore,
}

impl CachePolicy {
    pub(crate) fn header_value(&self) -> String {
        match self {
            CachePolicy::Public { max_age } => format!("public, max-age={max_age}"),
            CachePolicy::Private {
                max_age,
                must_revalidate: true,
            } => format!("private, max-age={max_age}, must-revalidate"),
            CachePolicy::Private {
                max_age,
                must_revalidate: false,
            } => format!("private, max-age={max_age}"),
            CachePolicy::NoCache => "no-cache".to_owned(),
            CachePolicy::NoStore => "no-cache, no-store".to_owned(),
        }
    }

    /// Whether this policy forbids caching outright, requiring the
    /// HTTP/1.0-compatible `Pragma`/`Expires` pair alongside `Cache-Control`.
    pub(crate) fn is_no_cache(&self) -> bool {
        matches!(self, CachePolicy::NoCache | CachePolicy::NoStore)
    }
}

/// `SameSite` attribute for session cookies. Default per-host is
/// [`SameSite::Strict`]; `Lax` is available per route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    #[default]
    Strict,
    Lax,
}

impl SameSite {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathMatch {
    Exact(String),
    Prefix(String),
}

impl PathMatch {
    pub(crate) fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact(p) => p == path,
            PathMatch::Prefix(p) => {
                path == p || (path.starts_with(p.as_str()) && path.as_bytes()[p.len()] == b'/')
            }
        }
    }
}

/// What a matched route actually does with the request.
pub enum HandlerKind {
    /// Serve static files from `document_root`.
    File {
        document_root: PathBuf,
        index: String,
        allow_dotfiles: bool,
        compress: bool,
    },
    /// Dispatch to a registered action by name.
    Action { name: String },
    /// Accept multipart or raw-PUT uploads into `dir`.
    Upload { dir: PathBuf },
    /// Open a Server-Sent Events stream.
    Sse { action: String },
    /// Perform a WebSocket upgrade and hand frames to a registered action.
    WebSocket { action: String },
    /// Issue a redirect to `target`.
    Redirect { target: String, permanent: bool },
    /// Log in: validates credentials from form fields, creates a session.
    Login,
    /// Log out: destroys the current session.
    Logout,
}

pub(crate) struct Route {
    pub(crate) methods: Vec<Method>, // empty = any method
    pub(crate) path: PathMatch,
    pub(crate) auth: AuthKind,
    pub(crate) digest_algorithm: DigestAlgorithm,
    pub(crate) require_tls_for_basic: bool,
    pub(crate) required_ability: Option<String>,
    pub(crate) cache: Option<CachePolicy>,
    pub(crate) xsrf_protected: bool,
    pub(crate) same_site: SameSite,
    pub(crate) kind: HandlerKind,
}

impl Route {
    pub(crate) fn allows_method(&self, method: Method) -> bool {
        self.methods.is_empty() || self.methods.contains(&method)
    }

    /// `Access-Control-Allow-Methods` value for this route: the full
    /// server-supported method set, reduced to the route's own set when
    /// one is configured.
    pub(crate) fn allowed_methods_header(&self) -> String {
        const ALL: [Method; 7] = [
            Method::Delete,
            Method::Get,
            Method::Head,
            Method::Options,
            Method::Patch,
            Method::Post,
            Method::Put,
        ];

        let set: Vec<&'static str> = if self.methods.is_empty() {
            ALL.iter().map(|m| m.as_str()).collect()
        } else {
            ALL.iter()
                .filter(|m| self.methods.contains(m))
                .map(|m| m.as_str())
                .collect()
        };

        set.join(",")
    }
}

/// Builder for a single route entry. Construct with [`RouteConfig::prefix`]
/// or [`RouteConfig::exact`], configure with the fluent methods, and pass
/// to [`crate::host::HostBuilder::route`].
pub struct RouteConfig {
    methods: Vec<Method>,
    path: PathMatch,
    auth: AuthKind,
    digest_algorithm: DigestAlgorithm,
    require_tls_for_basic: bool,
    required_ability: Option<String>,
    cache: Option<CachePolicy>,
    xsrf_protected: bool,
    same_site: SameSite,
    kind: HandlerKind,
}

impl RouteConfig {
    fn new(path: PathMatch, kind: HandlerKind) -> Self {
        Self {
            methods: Vec::new(),
            path,
            auth: AuthKind::None,
            digest_algorithm: DigestAlgorithm::Sha256,
            require_tls_for_basic: false,
            required_ability: None,
            cache: None,
            xsrf_protected: false,
            same_site: SameSite::Strict,
            kind,
        }
    }

    /// Matches `path` itself and any `path/...` sub-path.
    pub fn prefix(path: impl Into<String>, kind: HandlerKind) -> Self {
        Self::new(PathMatch::Prefix(path.into()), kind)
    }

    /// Matches `path` exactly.
    pub fn exact(path: impl Into<String>, kind: HandlerKind) -> Self {
        Self::new(PathMatch::Exact(path.into()), kind)
    }

    /// Restricts this route to the given methods. Unset (the default)
    /// means any method is accepted; the router still applies `allows_method`
    /// as a no-op filter but the route is responsible for rejecting methods
    /// it can't service.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn auth(mut self, kind: AuthKind) -> Self {
        self.auth = kind;
        self
    }

    pub fn digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }

    pub fn require_tls_for_basic(mut self, required: bool) -> Self {
        self.require_tls_for_basic = required;
        self
    }

    pub fn require_ability(mut self, ability: impl Into<String>) -> Self {
        self.required_ability = Some(ability.into());
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn xsrf_protected(mut self, protected: bool) -> Self {
        self.xsrf_protected = protected;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    pub(crate) fn build(self) -> Route {
        Route {
            methods: self.methods,
            path: self.path,
            auth: self.auth,
            digest_algorithm: self.digest_algorithm,
            require_tls_for_basic: self.require_tls_for_basic,
            required_ability: self.required_ability,
            cache: self.cache,
            xsrf_protected: self.xsrf_protected,
            same_site: self.same_site,
            kind: self.kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let m = PathMatch::Exact("/login".to_owned());
        assert!(m.matches("/login"));
        assert!(!m.matches("/login/"));
        assert!(!m.matches("/login/extra"));
    }

    #[test]
    fn prefix_match() {
        let m = PathMatch::Prefix("/static".to_owned());
        assert!(m.matches("/static"));
        assert!(m.matches("/static/app.js"));
        assert!(!m.matches("/staticer"));
    }

    #[test]
    fn cache_policy_headers() {
        assert_eq!(
            CachePolicy::Public { max_age: 3600 }.header_value(),
            "public, max-age=3600"
        );
        assert_eq!(
            CachePolicy::Private {
                max_age: 0,
                must_revalidate: true
            }
            .header_value(),
            "private, max-age=0, must-revalidate"
        );
        assert_eq!(CachePolicy::NoStore.header_value(), "no-cache, no-store");
    }
}
