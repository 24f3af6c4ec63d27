//! The assembled web application (C3-C13): routing, authentication,
//! sessions/XSRF, static files, uploads, SSE and WebSocket, layered on top
//! of the protocol engine in [`crate::http`] and [`crate::server`].
//!
//! [`Host`] is the single entry point: build one with [`Host::builder`],
//! register routes/users/roles/actions on the [`HostBuilder`], then hand the
//! built [`Host`] to [`crate::ServerBuilder::handler`].

pub(crate) mod action;
pub(crate) mod auth;
pub(crate) mod file_handler;
mod host;
pub(crate) mod mime;
pub(crate) mod multipart;
pub(crate) mod path;
pub(crate) mod route;
pub(crate) mod session;
pub(crate) mod sse;
pub(crate) mod upload;
pub(crate) mod user;
pub(crate) mod websocket;

pub use action::{Action, ActionSignature, BoxFuture, Signature, SseProducer, WebSocketHandler};
pub use host::{Host, HostBuilder, HostLimits};
pub use route::{AuthKind, CachePolicy, DigestAlgorithm, HandlerKind, RouteConfig, SameSite};
pub use sse::EventSink;
pub use user::{PasswordHash, RoleConfig, RoleCycleError};
pub use websocket::{Message, WsError, WebSocketStream};
