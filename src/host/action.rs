//! Registered action/SSE/WebSocket callbacks (C9, C11, C12).
//!
//! Routes reference handlers by name; the handler bodies themselves are
//! boxed trait objects stored in the [`Host`](super::Host) so that actions
//! of unrelated concrete types can live in the same route table.

use crate::host::websocket::WebSocketStream;
use crate::{Request, Response};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`Action`], [`SseProducer`] and
/// [`WebSocketHandler`] implementations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An ordinary request/response action (C9).
pub trait Action: Send + Sync + 'static {
    fn call<'a>(&'a self, request: &'a Request, response: &'a mut Response) -> BoxFuture<'a, ()>;
}

impl<F, Fut> Action for F
where
    F: Fn(&Request, &mut Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call<'a>(&'a self, request: &'a Request, response: &'a mut Response) -> BoxFuture<'a, ()> {
        Box::pin(self(request, response))
    }
}

/// Produces Server-Sent Events on a freshly upgraded connection (C11).
///
/// Called once per connection after the `text/event-stream` handshake has
/// been flushed. The sink is dropped (closing the stream) when the future
/// returns.
pub trait SseProducer: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        request: &'a Request,
        sink: &'a mut crate::host::sse::EventSink<'a>,
    ) -> BoxFuture<'a, ()>;
}

impl<F, Fut> SseProducer for F
where
    F: for<'a> Fn(&'a Request, &'a mut crate::host::sse::EventSink<'a>) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call<'a>(
        &'a self,
        request: &'a Request,
        sink: &'a mut crate::host::sse::EventSink<'a>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self(request, sink))
    }
}

/// Handles frames on an upgraded WebSocket connection (C12).
///
/// Called once per connection after the handshake response has been
/// flushed; returns when the close handshake completes or the socket
/// errors.
pub trait WebSocketHandler: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        request: &'a Request,
        socket: &'a mut WebSocketStream<'a>,
    ) -> BoxFuture<'a, ()>;
}

impl<F, Fut> WebSocketHandler for F
where
    F: for<'a> Fn(&'a Request, &'a mut WebSocketStream<'a>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call<'a>(
        &'a self,
        request: &'a Request,
        socket: &'a mut WebSocketStream<'a>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self(request, socket))
    }
}

/// A machine-readable description of the JSON object an action's request or
/// response body is expected to be: which fields must be present, which
/// extra ones are tolerated, and whether fields outside that set are
/// rejected outright ("strict mode").
#[derive(Debug, Clone, Default)]
pub struct Signature {
    required: Vec<String>,
    optional: Vec<String>,
    strict: bool,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `field` as required; its absence fails validation.
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    /// Marks `field` as tolerated but not required.
    pub fn optional(mut self, field: impl Into<String>) -> Self {
        self.optional.push(field.into());
        self
    }

    /// Under strict mode, any field not named by [`require`](Self::require)
    /// or [`optional`](Self::optional) fails validation.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Validates a parsed JSON body against this signature, returning a
    /// human-readable reason on failure.
    fn validate(&self, value: &serde_json::Value) -> Result<(), String> {
        let serde_json::Value::Object(map) = value else {
            return Err("body is not a JSON object".to_owned());
        };

        for field in &self.required {
            if !map.contains_key(field) {
                return Err(format!("missing required field \"{field}\""));
            }
        }

        if self.strict {
            for key in map.keys() {
                let known = self.required.iter().any(|f| f == key) || self.optional.iter().any(|f| f == key);
                if !known {
                    return Err(format!("unexpected field \"{key}\""));
                }
            }
        }

        Ok(())
    }
}

/// The request and/or response [`Signature`] declared for a single action,
/// as registered on a signatures document (see
/// [`HostBuilder::signature`](super::HostBuilder::signature)).
#[derive(Debug, Clone, Default)]
pub struct ActionSignature {
    pub request: Option<Signature>,
    pub response: Option<Signature>,
}

impl ActionSignature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(mut self, signature: Signature) -> Self {
        self.request = Some(signature);
        self
    }

    pub fn response(mut self, signature: Signature) -> Self {
        self.response = Some(signature);
        self
    }
}

/// Parses `body` as JSON and validates it against `signature`, returning a
/// sanitized failure reason suitable to put directly in a response body
/// (never the raw parser error, which may echo attacker-controlled bytes).
pub(crate) fn validate_body(body: Option<&[u8]>, signature: &Signature) -> Result<(), &'static str> {
    let Some(body) = body else {
        return Err("missing request body");
    };
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|_| "malformed JSON body")?;
    signature.validate(&value).map_err(|_| "request body does not match the declared signature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_field_rejected() {
        let sig = Signature::new().require("name");
        assert!(validate_body(Some(br#"{"other":1}"#), &sig).is_err());
    }

    #[test]
    fn present_required_field_accepted() {
        let sig = Signature::new().require("name");
        assert!(validate_body(Some(br#"{"name":"a"}"#), &sig).is_ok());
    }

    #[test]
    fn extra_field_rejected_under_strict_mode() {
        let sig = Signature::new().require("name").strict(true);
        assert!(validate_body(Some(br#"{"name":"a","extra":1}"#), &sig).is_err());
    }

    #[test]
    fn extra_field_allowed_without_strict_mode() {
        let sig = Signature::new().require("name");
        assert!(validate_body(Some(br#"{"name":"a","extra":1}"#), &sig).is_ok());
    }

    #[test]
    fn optional_field_not_required_but_tolerated_under_strict_mode() {
        let sig = Signature::new().require("name").optional("nickname").strict(true);
        assert!(validate_body(Some(br#"{"name":"a","nickname":"b"}"#), &sig).is_ok());
    }

    #[test]
    fn non_object_body_rejected() {
        let sig = Signature::new();
        assert!(validate_body(Some(b"[1,2,3]"), &sig).is_err());
    }

    #[test]
    fn missing_body_rejected() {
        let sig = Signature::new().require("name");
        assert!(validate_body(None, &sig).is_err());
    }
}
