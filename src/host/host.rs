//! Ties routing, authentication, session/XSRF and the C8-C12 handlers
//! together into a single [`Handler`](crate::Handler) implementation.

use crate::host::action::{self, Action, ActionSignature, SseProducer, WebSocketHandler};
use crate::host::route::{AuthKind, CachePolicy, HandlerKind, PathMatch, Route, RouteConfig, SameSite};
use crate::host::user::{PasswordHash, RoleConfig, RoleCycleError, RoleTable, User, UserTable};
use crate::host::{auth, file_handler, path, session, sse, upload, websocket};
use crate::query::Query;
use crate::{Handled, Method, Request, Response, StatusCode, Upgrade};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;

/// Configurable limits that don't belong to a single route: upload size,
/// Digest nonce lifetime, session timeouts, and WebSocket framing caps.
#[derive(Debug, Clone)]
pub struct HostLimits {
    pub max_upload_size: usize,
    pub nonce_lifetime: Duration,
    pub session_idle_timeout: Duration,
    pub session_absolute_timeout: Duration,
    pub websocket_max_message_size: usize,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            max_upload_size: 8 * 1024 * 1024,
            nonce_lifetime: Duration::from_secs(300),
            session_idle_timeout: Duration::from_secs(1800),
            session_absolute_timeout: Duration::from_secs(12 * 3600),
            websocket_max_message_size: 1024 * 1024,
        }
    }
}

/// The assembled application: route table, user/role tables, session
/// store, and the registered actions/SSE producers/WebSocket handlers
/// routes dispatch into.
///
/// Implements [`Handler<()>`](crate::Handler), so it plugs directly into
/// [`ServerBuilder::handler`](crate::ServerBuilder::handler).
pub struct Host {
    routes: Vec<Route>,
    users: UserTable,
    roles: RoleTable,
    sessions: session::SessionStore,
    nonces: auth::NonceStore,
    realm: String,
    cookie_name: String,
    actions: HashMap<String, Box<dyn Action>>,
    sse_producers: HashMap<String, Box<dyn SseProducer>>,
    ws_handlers: HashMap<String, Box<dyn WebSocketHandler>>,
    signatures: HashMap<String, ActionSignature>,
    limits: HostLimits,
}

/// Builds a [`Host`]. See [`Host::builder`].
pub struct HostBuilder {
    routes: Vec<Route>,
    users: Vec<User>,
    roles: Vec<RoleConfig>,
    realm: String,
    cookie_name: String,
    actions: HashMap<String, Box<dyn Action>>,
    sse_producers: HashMap<String, Box<dyn SseProducer>>,
    ws_handlers: HashMap<String, Box<dyn WebSocketHandler>>,
    signatures: HashMap<String, ActionSignature>,
    limits: HostLimits,
}

impl Host {
    pub fn builder() -> HostBuilder {
        HostBuilder {
            routes: Vec::new(),
            users: Vec::new(),
            roles: Vec::new(),
            realm: "restricted".to_owned(),
            cookie_name: "session".to_owned(),
            actions: HashMap::new(),
            sse_producers: HashMap::new(),
            ws_handlers: HashMap::new(),
            signatures: HashMap::new(),
            limits: HostLimits::default(),
        }
    }
}

impl HostBuilder {
    pub fn route(mut self, route: RouteConfig) -> Self {
        self.routes.push(route.build());
        self
    }

    pub fn user(mut self, username: impl Into<String>, password: PasswordHash, role: impl Into<String>) -> Self {
        self.users.push(User { username: username.into(), password, role: role.into() });
        self
    }

    pub fn role(mut self, role: RoleConfig) -> Self {
        self.roles.push(role);
        self
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    pub fn limits(mut self, limits: HostLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Registers an action invoked by an [`Action`](crate::host::route::HandlerKind::Action)
    /// route of the same name.
    pub fn action(mut self, name: impl Into<String>, handler: impl Action) -> Self {
        self.actions.insert(name.into(), Box::new(handler));
        self
    }

    /// Registers an SSE producer invoked by an [`Sse`](crate::host::route::HandlerKind::Sse)
    /// route of the same name.
    pub fn sse(mut self, name: impl Into<String>, producer: impl SseProducer) -> Self {
        self.sse_producers.insert(name.into(), Box::new(producer));
        self
    }

    /// Registers a WebSocket handler invoked by a [`WebSocket`](crate::host::route::HandlerKind::WebSocket)
    /// route of the same name.
    pub fn websocket(mut self, name: impl Into<String>, handler: impl WebSocketHandler) -> Self {
        self.ws_handlers.insert(name.into(), Box::new(handler));
        self
    }

    /// Declares the request/response [`ActionSignature`] for the action
    /// registered under `name`. An action with no declared signature
    /// dispatches unvalidated, as before.
    pub fn signature(mut self, name: impl Into<String>, signature: ActionSignature) -> Self {
        self.signatures.insert(name.into(), signature);
        self
    }

    pub fn build(self) -> Result<Host, RoleCycleError> {
        let roles = RoleTable::build(self.roles)?;
        Ok(Host {
            routes: self.routes,
            users: UserTable::new(self.users),
            roles,
            sessions: session::SessionStore::new(self.limits.session_idle_timeout, self.limits.session_absolute_timeout),
            nonces: auth::NonceStore::new(self.limits.nonce_lifetime),
            realm: self.realm,
            cookie_name: self.cookie_name,
            actions: self.actions,
            sse_producers: self.sse_producers,
            ws_handlers: self.ws_handlers,
            signatures: self.signatures,
            limits: self.limits,
        })
    }
}

struct Matched<'r> {
    route: &'r Route,
    rel_path: String,
}

impl Host {
    fn find_route(&self, normalized: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.path.matches(normalized))
    }

    fn match_request(&self, normalized: &str, method: Method) -> Result<Matched<'_>, bool> {
        // Err(true): path matched but method didn't (405); Err(false): no match at all (404).
        let mut path_matched = false;
        for route in &self.routes {
            if !route.path.matches(normalized) {
                continue;
            }
            path_matched = true;
            if route.allows_method(method) {
                let rel_path = match &route.path {
                    PathMatch::Prefix(prefix) => normalized.strip_prefix(prefix.as_str()).unwrap_or("").trim_start_matches('/').to_owned(),
                    PathMatch::Exact(_) => String::new(),
                };
                return Ok(Matched { route, rel_path });
            }
        }
        Err(path_matched)
    }

    fn session_cookie_id(&self, request: &Request) -> Option<String> {
        let header = request.header(b"cookie")?;
        session::read_cookie(header, &self.cookie_name).and_then(|v| std::str::from_utf8(v).ok()).map(str::to_owned)
    }

    /// Looks up the caller's session, if any, returning `(id, xsrf_token)`.
    fn current_session(&self, request: &Request) -> Option<(String, String)> {
        let id = self.session_cookie_id(request)?;
        self.sessions.lookup(&id)
    }

    async fn authenticate(&self, request: &Request, response: &mut Response, route: &Route) -> Result<Option<String>, Handled> {
        match route.auth {
            AuthKind::None => Ok(None),
            AuthKind::Basic => {
                if route.require_tls_for_basic && !request.is_tls() {
                    return Err(response.status(StatusCode::Forbidden).body("Basic auth requires TLS"));
                }
                match auth::verify_basic(&self.users, request.header(b"authorization")).await {
                    auth::AuthOutcome::Ok(user) => Ok(Some(user.role.clone())),
                    _ => {
                        tracing::warn!(path = %String::from_utf8_lossy(request.url().path()), "basic auth failed");
                        Err(response
                            .status(StatusCode::Unauthorized)
                            .header("www-authenticate", auth::basic_challenge(&self.realm))
                            .body("Unauthorized"))
                    }
                }
            }
            AuthKind::Digest => {
                let method = request.method().as_str();
                let target = request.url().target();
                match auth::verify_digest(&self.users, &self.nonces, method, route.digest_algorithm, target, request.header(b"authorization")).await {
                    auth::AuthOutcome::Ok(user) => Ok(Some(user.role.clone())),
                    _ => {
                        tracing::warn!(path = %String::from_utf8_lossy(request.url().path()), "digest auth failed");
                        let nonce = self.nonces.issue();
                        Err(response
                            .status(StatusCode::Unauthorized)
                            .header(
                                "www-authenticate",
                                auth::digest_challenge(&self.realm, &nonce, &nonce, route.digest_algorithm, false),
                            )
                            .body("Unauthorized"))
                    }
                }
            }
            AuthKind::Form | AuthKind::App => match self.current_session(request) {
                Some((id, _)) => Ok(self.sessions_role(&id)),
                None => {
                    tracing::warn!(path = %String::from_utf8_lossy(request.url().path()), "no session cookie presented");
                    Err(response.status(StatusCode::Unauthorized).body("Not logged in"))
                }
            },
        }
    }

    fn sessions_role(&self, id: &str) -> Option<String> {
        self.sessions.get_variable(id, "role")
    }

    fn check_xsrf(&self, request: &Request, response: &mut Response, route: &Route) -> Result<(), Handled> {
        if !route.xsrf_protected || matches!(request.method(), Method::Get | Method::Head | Method::Options) {
            return Ok(());
        }
        let Some((id, expected)) = self.current_session(request) else {
            return Err(response.status(StatusCode::BadRequest).body("Missing session for XSRF check"));
        };
        let provided = request.header(b"x-xsrf-token").and_then(|v| std::str::from_utf8(v).ok()).map(str::to_owned);
        let provided = provided.or_else(|| {
            let body = request.body()?;
            let map: HashMap<&[u8], &[u8]> = Query::parse(body, 64).ok()?;
            map.get(b"-xsrf-".as_slice()).and_then(|v| std::str::from_utf8(v).ok()).map(str::to_owned)
        });

        match provided {
            Some(token) if token == expected => Ok(()),
            _ => {
                tracing::warn!(session = %id, "XSRF token mismatch");
                Err(response.status(StatusCode::BadRequest).body("XSRF token mismatch"))
            }
        }
    }

    async fn dispatch(&self, request: &Request, response: &mut Response, matched: &Matched<'_>) -> Handled {
        match &matched.route.kind {
            HandlerKind::File { document_root, index, allow_dotfiles, compress } => {
                file_handler::serve(
                    request,
                    response,
                    document_root,
                    &matched.rel_path,
                    index,
                    *allow_dotfiles,
                    *compress,
                    matched.route.cache,
                )
                .await
            }
            HandlerKind::Action { name } => match self.actions.get(name) {
                Some(action) => {
                    let signature = self.signatures.get(name);

                    if let Some(request_signature) = signature.and_then(|s| s.request.as_ref()) {
                        if let Err(reason) = action::validate_body(request.body(), request_signature) {
                            tracing::warn!(action = %name, reason, "action request failed signature validation");
                            return response.status(StatusCode::BadRequest).body(reason);
                        }
                    }

                    action.call(request, response).await;
                    // The action is responsible for finalizing `response`.

                    if let Some(response_signature) = signature.and_then(|s| s.response.as_ref()) {
                        if action::validate_body(Some(response.body_bytes()), response_signature).is_err() {
                            tracing::error!(action = %name, "action response failed signature validation");
                            response.discard();
                            return response.status(StatusCode::InternalServerError).body("Response failed validation");
                        }
                    }

                    response.assume_handled()
                }
                None => {
                    tracing::error!(action = %name, "route points at an unregistered action");
                    response.status(StatusCode::InternalServerError).body("Unregistered action")
                }
            },
            HandlerKind::Upload { dir } => upload::handle(request, response, dir, self.limits.max_upload_size).await,
            HandlerKind::Sse { action } => {
                if !self.sse_producers.contains_key(action) {
                    tracing::error!(action = %action, "route points at an unregistered SSE producer");
                    return response.status(StatusCode::InternalServerError).body("Unregistered SSE action");
                }
                response
                    .status(StatusCode::Ok)
                    .header("content-type", "text/event-stream")
                    .header("cache-control", "no-cache");
                response.upgrade_sse()
            }
            HandlerKind::WebSocket { action } => {
                if !self.ws_handlers.contains_key(action) {
                    tracing::error!(action = %action, "route points at an unregistered WebSocket handler");
                    return response.status(StatusCode::InternalServerError).body("Unregistered WebSocket action");
                }
                self.websocket_handshake(request, response)
            }
            HandlerKind::Redirect { target, permanent } => {
                let status = if *permanent { StatusCode::MovedPermanently } else { StatusCode::Found };
                response.status(status).header("location", target.clone()).body("")
            }
            HandlerKind::Login => self.handle_login(request, response, matched.route.same_site).await,
            HandlerKind::Logout => self.handle_logout(request, response),
        }
    }

    fn websocket_handshake(&self, request: &Request, response: &mut Response) -> Handled {
        let upgrade_ok = request.header(b"upgrade").map(|v| v.eq_ignore_ascii_case(b"websocket")).unwrap_or(false);
        let has_key = request.header(b"sec-websocket-key").is_some();
        let Some(key) = request.header(b"sec-websocket-key").and_then(|v| std::str::from_utf8(v).ok()) else {
            return response.status(StatusCode::UpgradeRequired).header("upgrade", "websocket").body("");
        };
        if !upgrade_ok || !has_key {
            return response.status(StatusCode::UpgradeRequired).header("upgrade", "websocket").body("");
        }

        let accept = websocket::accept_key(key);
        response
            .status(StatusCode::SwitchingProtocols)
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .header("sec-websocket-accept", accept);
        response.upgrade_websocket()
    }

    async fn handle_login(&self, request: &Request, response: &mut Response, same_site: SameSite) -> Handled {
        let body = request.body().unwrap_or(&[]);
        let Ok(fields) = Query::parse::<HashMap<&[u8], &[u8]>>(body, 16) else {
            return response.status(StatusCode::BadRequest).body("Malformed login body");
        };
        let Some(username) = fields.get(b"username".as_slice()) else {
            return response.status(StatusCode::BadRequest).body("Missing username");
        };
        let Some(password) = fields.get(b"password".as_slice()).and_then(|v| std::str::from_utf8(v).ok()) else {
            return response.status(StatusCode::BadRequest).body("Missing password");
        };

        match auth::verify_form(&self.users, username, password).await {
            auth::AuthOutcome::Ok(user) => {
                // A caller presenting a pre-login session (e.g. an anonymous
                // cart) is rotated to a fresh id on this privilege change
                // rather than left dangling alongside a brand new one.
                let (id, xsrf) = match self.session_cookie_id(request).and_then(|old| self.sessions.rotate(&old)) {
                    Some(rotated) => rotated,
                    None => self.sessions.create(),
                };
                self.sessions.set_variable(&id, "role", &user.role);
                tracing::debug!(session = %id, user = %user.username, "session created");
                response
                    .status(StatusCode::Ok)
                    .header("set-cookie", session::session_cookie(&self.cookie_name, &id, same_site, request.is_tls(), None))
                    .header("x-xsrf-token", xsrf.clone())
                    .header("content-type", "application/json")
                    .body(format!("{{\"xsrf\":\"{xsrf}\"}}"))
            }
            _ => response.status(StatusCode::Unauthorized).body("Invalid credentials"),
        }
    }

    fn handle_logout(&self, request: &Request, response: &mut Response) -> Handled {
        if let Some(id) = self.session_cookie_id(request) {
            tracing::debug!(session = %id, "session destroyed");
            self.sessions.destroy(&id);
        }
        response
            .status(StatusCode::NoContent)
            .header("set-cookie", format!("{}=; Path=/; Max-Age=0", self.cookie_name))
            .body("")
    }
}

impl crate::Handler<()> for Host {
    async fn handle(&self, _: &mut (), request: &Request, response: &mut Response) -> Handled {
        let normalized = match path::normalize(request.url().path()) {
            Ok(p) => p,
            Err(_) => return response.status(StatusCode::BadRequest).body("Malformed path"),
        };

        if request.method() == Method::Options {
            return match self.find_route(&normalized) {
                Some(route) => response
                    .status(StatusCode::NoContent)
                    .header("access-control-allow-methods", route.allowed_methods_header())
                    .body(""),
                None => response.status(StatusCode::NotFound).body("Not Found"),
            };
        }

        let matched = match self.match_request(&normalized, request.method()) {
            Ok(m) => m,
            Err(true) => {
                return response.status(StatusCode::MethodNotAllowed).body("Method Not Allowed");
            }
            Err(false) => return response.status(StatusCode::NotFound).body("Not Found"),
        };

        let role = match self.authenticate(request, response, matched.route).await {
            Ok(role) => role,
            Err(handled) => return handled,
        };

        if let Some(ability) = &matched.route.required_ability {
            match &role {
                None => return response.status(StatusCode::Unauthorized).body("Not logged in"),
                Some(r) if !self.roles.has_ability(r, ability) => {
                    return response.status(StatusCode::Forbidden).body("Forbidden");
                }
                Some(_) => {}
            }
        }

        if let Err(handled) = self.check_xsrf(request, response, matched.route) {
            return handled;
        }

        self.dispatch(request, response, &matched).await
    }

    async fn handle_upgrade(&self, _: &mut (), request: &Request, stream: &mut TcpStream, kind: Upgrade) {
        let Ok(normalized) = path::normalize(request.url().path()) else { return };
        let Some(route) = self.find_route(&normalized) else { return };

        match (kind, &route.kind) {
            (Upgrade::Sse, HandlerKind::Sse { action }) => {
                if let Some(producer) = self.sse_producers.get(action) {
                    let mut sink = sse::EventSink::new(stream);
                    producer.call(request, &mut sink).await;
                }
            }
            (Upgrade::WebSocket, HandlerKind::WebSocket { action }) => {
                if let Some(handler) = self.ws_handlers.get(action) {
                    let mut socket = websocket::WebSocketStream::new(stream, self.limits.websocket_max_message_size);
                    handler.call(request, &mut socket).await;
                }
            }
            _ => {}
        }
    }
}
