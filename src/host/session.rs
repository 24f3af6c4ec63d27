//! Session store and XSRF token issuance/verification (C13).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Server-side session state addressed by an opaque id carried in a cookie.
pub(crate) struct Session {
    pub(crate) id: String,
    pub(crate) xsrf_token: String,
    created: Instant,
    last_access: Instant,
    pub(crate) variables: HashMap<String, String>,
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl Session {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            id: random_token(),
            xsrf_token: random_token(),
            created: now,
            last_access: now,
            variables: HashMap::new(),
        }
    }

    fn expired(&self, idle_timeout: Duration, absolute_timeout: Duration) -> bool {
        self.last_access.elapsed() > idle_timeout || self.created.elapsed() > absolute_timeout
    }
}

/// Owns every live session for a [`Host`](crate::host::Host). Sessions are
/// created lazily, looked up by the id presented in the `Cookie` header,
/// and never accepted unless they match a server-known id (an arbitrary
/// incoming id never creates a session).
pub(crate) struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    idle_timeout: Duration,
    absolute_timeout: Duration,
}

impl SessionStore {
    pub(crate) fn new(idle_timeout: Duration, absolute_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
            absolute_timeout,
        }
    }

    /// Looks up a session by cookie id. Expired sessions are evicted and
    /// treated as absent.
    pub(crate) fn lookup(&self, id: &str) -> Option<(String, String)> {
        let mut guard = self.sessions.lock().unwrap();
        let expired = match guard.get(id) {
            Some(s) => s.expired(self.idle_timeout, self.absolute_timeout),
            None => return None,
        };

        if expired {
            guard.remove(id);
            return None;
        }

        let session = guard.get_mut(id).unwrap();
        session.last_access = Instant::now();
        Some((session.id.clone(), session.xsrf_token.clone()))
    }

    /// Creates a new session and returns its id and XSRF token.
    pub(crate) fn create(&self) -> (String, String) {
        let session = Session::new();
        let id = session.id.clone();
        let xsrf = session.xsrf_token.clone();

        self.sessions.lock().unwrap().insert(id.clone(), session);
        (id, xsrf)
    }

    /// Rotates a session's id on privilege change (e.g. after login),
    /// preserving its variables. Returns the new id and XSRF token.
    pub(crate) fn rotate(&self, old_id: &str) -> Option<(String, String)> {
        let mut guard = self.sessions.lock().unwrap();
        let mut session = guard.remove(old_id)?;

        session.id = random_token();
        session.xsrf_token = random_token();
        session.last_access = Instant::now();

        let new_id = session.id.clone();
        let new_xsrf = session.xsrf_token.clone();
        guard.insert(new_id.clone(), session);

        Some((new_id, new_xsrf))
    }

    pub(crate) fn destroy(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }

    pub(crate) fn set_variable(&self, id: &str, key: &str, value: &str) -> bool {
        let mut guard = self.sessions.lock().unwrap();
        match guard.get_mut(id) {
            Some(session) => {
                session.variables.insert(key.to_owned(), value.to_owned());
                true
            }
            None => false,
        }
    }

    pub(crate) fn get_variable(&self, id: &str, key: &str) -> Option<String> {
        self.sessions.lock().unwrap().get(id)?.variables.get(key).cloned()
    }
}

/// Extracts a cookie value by name from a raw `Cookie` header value.
pub(crate) fn read_cookie<'a>(header: &'a [u8], name: &str) -> Option<&'a [u8]> {
    for pair in header.split(|&b| b == b';') {
        let pair = trim(pair);
        let mut parts = pair.splitn(2, |&b| b == b'=');
        let key = parts.next()?;
        let value = parts.next().unwrap_or(b"");

        if key == name.as_bytes() {
            return Some(value);
        }
    }
    None
}

fn trim(mut s: &[u8]) -> &[u8] {
    while let [b' ', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' '] = s {
        s = rest;
    }
    s
}

/// Builds a `Set-Cookie` header value for a session id.
pub(crate) fn session_cookie(
    cookie_name: &str,
    id: &str,
    same_site: crate::host::route::SameSite,
    secure: bool,
    max_age: Option<u64>,
) -> String {
    let mut cookie = format!("{cookie_name}={id}; Path=/; HttpOnly; SameSite={}", same_site.as_str());
    if secure {
        cookie.push_str("; Secure");
    }
    if let Some(max_age) = max_age {
        cookie.push_str(&format!("; Max-Age={max_age}"));
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::route::SameSite;

    #[test]
    fn create_then_lookup() {
        let store = SessionStore::new(Duration::from_secs(60), Duration::from_secs(3600));
        let (id, xsrf) = store.create();
        let found = store.lookup(&id).unwrap();
        assert_eq!(found.0, id);
        assert_eq!(found.1, xsrf);
    }

    #[test]
    fn unknown_id_creates_nothing() {
        let store = SessionStore::new(Duration::from_secs(60), Duration::from_secs(3600));
        assert!(store.lookup("not-a-real-session-id").is_none());
    }

    #[test]
    fn rotate_changes_id_and_token() {
        let store = SessionStore::new(Duration::from_secs(60), Duration::from_secs(3600));
        let (old_id, old_xsrf) = store.create();
        let (new_id, new_xsrf) = store.rotate(&old_id).unwrap();

        assert_ne!(old_id, new_id);
        assert_ne!(old_xsrf, new_xsrf);
        assert!(store.lookup(&old_id).is_none());
        assert!(store.lookup(&new_id).is_some());
    }

    #[test]
    fn destroy_removes_session() {
        let store = SessionStore::new(Duration::from_secs(60), Duration::from_secs(3600));
        let (id, _) = store.create();
        store.destroy(&id);
        assert!(store.lookup(&id).is_none());
    }

    #[test]
    fn cookie_parsing() {
        assert_eq!(read_cookie(b"sid=abc123; other=xyz", "sid"), Some(&b"abc123"[..]));
        assert_eq!(read_cookie(b"sid=abc123; other=xyz", "other"), Some(&b"xyz"[..]));
        assert_eq!(read_cookie(b"sid=abc123", "missing"), None);
    }

    #[test]
    fn cookie_format() {
        let value = session_cookie("sid", "abc", SameSite::Strict, true, Some(3600));
        assert_eq!(
            value,
            "sid=abc; Path=/; HttpOnly; SameSite=Strict; Secure; Max-Age=3600"
        );
    }
}
