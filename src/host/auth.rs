//! Basic, Digest and form/session authentication (C7).

use crate::host::route::DigestAlgorithm;
use crate::host::user::{PasswordHash, User, UserTable};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use sha2::Digest as _;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};
use subtle::ConstantTimeEq;

/// Delay applied after any failed credential check, so a failed login takes
/// roughly the same wall-clock time as a successful one.
const FAILURE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub(crate) enum AuthOutcome<'a> {
    Ok(&'a User),
    NoCredentials,
    Invalid,
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn md5_hex(input: &str) -> String {
    let digest = md5::Md5::digest(input.as_bytes());
    hex_encode(&digest)
}

fn sha256_hex(input: &str) -> String {
    let digest = sha2::Sha256::digest(input.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").unwrap();
    }
    out
}

fn digest_hash(algorithm: DigestAlgorithm, input: &str) -> String {
    match algorithm {
        DigestAlgorithm::Md5 => md5_hex(input),
        DigestAlgorithm::Sha256 => sha256_hex(input),
    }
}

// ---- Basic auth ----

/// Splits a `Authorization: Basic <base64>` header value into username and
/// password. Returns `None` on malformed base64, missing `:`, or non-UTF8.
fn parse_basic(value: &[u8]) -> Option<(String, String)> {
    let value = std::str::from_utf8(value).ok()?.trim();
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}

/// Verifies HTTP Basic credentials against the user table. Sleeps on
/// failure to mask whether the username existed.
pub(crate) async fn verify_basic<'a>(
    users: &'a UserTable,
    header_value: Option<&[u8]>,
) -> AuthOutcome<'a> {
    let Some(value) = header_value else {
        return AuthOutcome::NoCredentials;
    };
    let Some((username, password)) = parse_basic(value) else {
        tokio::time::sleep(FAILURE_DELAY).await;
        return AuthOutcome::Invalid;
    };

    match users.get(username.as_bytes()) {
        Some(user) => match &user.password {
            PasswordHash::Bcrypt(hash) => {
                let ok = bcrypt::verify(&password, hash).unwrap_or(false);
                if ok {
                    AuthOutcome::Ok(user)
                } else {
                    tokio::time::sleep(FAILURE_DELAY).await;
                    AuthOutcome::Invalid
                }
            }
            PasswordHash::Digest { .. } => {
                // Basic credentials against a digest-only account: compute
                // the digest-style hash isn't possible without realm/nonce
                // context, so Basic is simply rejected for these accounts.
                tokio::time::sleep(FAILURE_DELAY).await;
                AuthOutcome::Invalid
            }
        },
        None => {
            tokio::time::sleep(FAILURE_DELAY).await;
            AuthOutcome::Invalid
        }
    }
}

pub(crate) fn basic_challenge(realm: &str) -> String {
    format!(r#"Basic realm="{realm}", charset="UTF-8""#)
}

// ---- Digest auth (RFC 7616) ----

pub(crate) struct DigestParams {
    pub(crate) username: String,
    pub(crate) realm: String,
    pub(crate) nonce: String,
    pub(crate) uri: String,
    pub(crate) response: String,
    pub(crate) qop: Option<String>,
    pub(crate) nc: Option<u32>,
    pub(crate) cnonce: Option<String>,
    pub(crate) opaque: Option<String>,
    pub(crate) algorithm: Option<String>,
}

/// Parses a `Digest key="value", key2=value2` header into its fields.
/// Unquoted tokens (e.g. `nc`, `qop`) are accepted without quotes.
fn parse_digest(value: &[u8]) -> Option<DigestParams> {
    let value = std::str::from_utf8(value).ok()?.trim();
    let value = value.strip_prefix("Digest ")?;

    let mut fields: HashMap<String, String> = HashMap::new();
    for part in split_digest_fields(value) {
        let (key, val) = part.split_once('=')?;
        let key = key.trim();
        let val = val.trim().trim_matches('"');
        fields.insert(key.to_owned(), val.to_owned());
    }

    Some(DigestParams {
        username: fields.remove("username")?,
        realm: fields.remove("realm")?,
        nonce: fields.remove("nonce")?,
        uri: fields.remove("uri")?,
        response: fields.remove("response")?,
        qop: fields.remove("qop"),
        nc: fields.remove("nc").and_then(|s| u32::from_str_radix(&s, 16).ok()),
        cnonce: fields.remove("cnonce"),
        opaque: fields.remove("opaque"),
        algorithm: fields.remove("algorithm"),
    })
}

/// Splits on commas that are not inside a quoted string.
fn split_digest_fields(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, ch) in value.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = value[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }

    parts
}

/// A server-issued nonce, tracked so replayed or out-of-order `nc` values
/// are rejected.
struct Nonce {
    issued_at: Instant,
    nc_high_water: u32,
}

/// Tracks issued Digest nonces for a [`Host`](crate::host::Host). Entries
/// expire after a fixed lifetime independent of session timeouts.
pub(crate) struct NonceStore {
    nonces: Mutex<HashMap<String, Nonce>>,
    lifetime: Duration,
}

impl NonceStore {
    pub(crate) fn new(lifetime: Duration) -> Self {
        Self {
            nonces: Mutex::new(HashMap::new()),
            lifetime,
        }
    }

    pub(crate) fn issue(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = STANDARD.encode(bytes);

        self.nonces.lock().unwrap().insert(
            nonce.clone(),
            Nonce {
                issued_at: Instant::now(),
                nc_high_water: 0,
            },
        );
        nonce
    }

    /// Validates that `nonce` is known, unexpired, and `nc` is strictly
    /// greater than the last accepted value (rejects replay).
    fn validate_and_advance(&self, nonce: &str, nc: u32) -> bool {
        let mut guard = self.nonces.lock().unwrap();
        let Some(entry) = guard.get_mut(nonce) else {
            return false;
        };

        if entry.issued_at.elapsed() > self.lifetime {
            guard.remove(nonce);
            return false;
        }

        if nc <= entry.nc_high_water && entry.nc_high_water != 0 {
            return false;
        }

        entry.nc_high_water = nc;
        true
    }

    pub(crate) fn evict_expired(&self) {
        let lifetime = self.lifetime;
        self.nonces
            .lock()
            .unwrap()
            .retain(|_, n| n.issued_at.elapsed() <= lifetime);
    }

    /// Validates an unexpired nonce for a legacy (no `nc`) Digest response
    /// and consumes it, so the same nonce can never be presented again.
    /// Used when the client omits `qop`/`nc` and so has no counter for
    /// [`validate_and_advance`] to track.
    fn validate_and_consume(&self, nonce: &str) -> bool {
        let mut guard = self.nonces.lock().unwrap();
        let Some(entry) = guard.remove(nonce) else {
            return false;
        };
        entry.issued_at.elapsed() <= self.lifetime
    }
}

/// Verifies an RFC 7616 Digest response against a user's stored hash.
///
/// `effective_target` is the request-target as received on the request
/// line (path plus query, unmodified); the client's `uri=` directive must
/// match it exactly, or the response could be replayed against a different
/// resource on the same route.
pub(crate) async fn verify_digest<'a>(
    users: &'a UserTable,
    nonces: &NonceStore,
    method: &str,
    route_algorithm: DigestAlgorithm,
    effective_target: &[u8],
    header_value: Option<&[u8]>,
) -> AuthOutcome<'a> {
    let Some(value) = header_value else {
        return AuthOutcome::NoCredentials;
    };
    let Some(params) = parse_digest(value) else {
        tokio::time::sleep(FAILURE_DELAY).await;
        return AuthOutcome::Invalid;
    };

    if params.uri.as_bytes() != effective_target {
        tokio::time::sleep(FAILURE_DELAY).await;
        return AuthOutcome::Invalid;
    }

    // Unsupported `algorithm` token, or one that doesn't match the route's
    // configured algorithm, is rejected before touching the user table.
    match DigestAlgorithm::from_header_token(params.algorithm.as_deref()) {
        Some(claimed) if claimed == route_algorithm => {}
        _ => {
            tokio::time::sleep(FAILURE_DELAY).await;
            return AuthOutcome::Invalid;
        }
    }

    let Some(user) = users.get(params.username.as_bytes()) else {
        tokio::time::sleep(FAILURE_DELAY).await;
        return AuthOutcome::Invalid;
    };

    let PasswordHash::Digest { hash: ha1, algorithm } = &user.password else {
        tokio::time::sleep(FAILURE_DELAY).await;
        return AuthOutcome::Invalid;
    };

    if *algorithm != route_algorithm {
        tokio::time::sleep(FAILURE_DELAY).await;
        return AuthOutcome::Invalid;
    }

    // The nonce must be server-issued and unexpired regardless of whether
    // the client sent a `qop`/`nc` pair; the two forms just differ in how
    // replay is then prevented (monotonic counter vs. single use).
    let nonce_ok = match params.nc {
        Some(nc) => nonces.validate_and_advance(&params.nonce, nc),
        None => nonces.validate_and_consume(&params.nonce),
    };
    if !nonce_ok {
        tokio::time::sleep(FAILURE_DELAY).await;
        return AuthOutcome::Invalid;
    }

    let ha2 = digest_hash(*algorithm, &format!("{method}:{}", params.uri));
    let expected = match (&params.qop, params.nc, &params.cnonce) {
        (Some(qop), Some(nc), Some(cnonce)) => digest_hash(
            *algorithm,
            &format!("{ha1}:{}:{nc:08x}:{cnonce}:{qop}:{ha2}", params.nonce),
        ),
        _ => digest_hash(*algorithm, &format!("{ha1}:{}:{ha2}", params.nonce)),
    };

    if constant_time_eq(expected.as_bytes(), params.response.as_bytes()) {
        AuthOutcome::Ok(user)
    } else {
        tokio::time::sleep(FAILURE_DELAY).await;
        AuthOutcome::Invalid
    }
}

pub(crate) fn digest_challenge(
    realm: &str,
    nonce: &str,
    opaque: &str,
    algorithm: DigestAlgorithm,
    stale: bool,
) -> String {
    let algo = match algorithm {
        DigestAlgorithm::Md5 => "MD5",
        DigestAlgorithm::Sha256 => "SHA-256",
    };
    format!(
        r#"Digest realm="{realm}", qop="auth", algorithm={algo}, nonce="{nonce}", opaque="{opaque}", stale={stale}"#
    )
}

// ---- Form / session login ----

/// Verifies form-submitted credentials the same way as Basic auth, for use
/// by the login handler.
pub(crate) async fn verify_form<'a>(
    users: &'a UserTable,
    username: &[u8],
    password: &str,
) -> AuthOutcome<'a> {
    match users.get(username) {
        Some(user) => match &user.password {
            PasswordHash::Bcrypt(hash) => {
                if bcrypt::verify(password, hash).unwrap_or(false) {
                    AuthOutcome::Ok(user)
                } else {
                    tokio::time::sleep(FAILURE_DELAY).await;
                    AuthOutcome::Invalid
                }
            }
            PasswordHash::Digest { .. } => {
                tokio::time::sleep(FAILURE_DELAY).await;
                AuthOutcome::Invalid
            }
        },
        None => {
            tokio::time::sleep(FAILURE_DELAY).await;
            AuthOutcome::Invalid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_header() {
        let encoded = STANDARD.encode("alice:wonderland");
        let header = format!("Basic {encoded}");
        let (user, pass) = parse_basic(header.as_bytes()).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "wonderland");
    }

    #[test]
    fn rejects_malformed_basic() {
        assert!(parse_basic(b"Basic not-base64!!!").is_none());
        assert!(parse_basic(b"Bearer abc").is_none());
    }

    #[test]
    fn parses_digest_header() {
        let header = br#"Digest username="alice", realm="test", nonce="abc123", uri="/secret", response="deadbeef", qop=auth, nc=00000001, cnonce="xyz""#;
        let params = parse_digest(header).unwrap();
        assert_eq!(params.username, "alice");
        assert_eq!(params.realm, "test");
        assert_eq!(params.nc, Some(1));
        assert_eq!(params.cnonce.as_deref(), Some("xyz"));
    }

    #[test]
    fn nonce_store_rejects_replay() {
        let store = NonceStore::new(Duration::from_secs(60));
        let nonce = store.issue();
        assert!(store.validate_and_advance(&nonce, 1));
        assert!(store.validate_and_advance(&nonce, 2));
        assert!(!store.validate_and_advance(&nonce, 2));
        assert!(!store.validate_and_advance(&nonce, 1));
    }

    #[test]
    fn nonce_store_rejects_unknown() {
        let store = NonceStore::new(Duration::from_secs(60));
        assert!(!store.validate_and_advance("not-issued", 1));
    }

    #[test]
    fn digest_hash_is_deterministic() {
        let a = digest_hash(DigestAlgorithm::Sha256, "alice:test:secret");
        let b = digest_hash(DigestAlgorithm::Sha256, "alice:test:secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let md5 = digest_hash(DigestAlgorithm::Md5, "alice:test:secret");
        assert_eq!(md5.len(), 32);
    }

    #[test]
    fn algorithm_token_parses_and_defaults_to_md5() {
        assert_eq!(DigestAlgorithm::from_header_token(None), Some(DigestAlgorithm::Md5));
        assert_eq!(DigestAlgorithm::from_header_token(Some("MD5")), Some(DigestAlgorithm::Md5));
        assert_eq!(DigestAlgorithm::from_header_token(Some("SHA-256")), Some(DigestAlgorithm::Sha256));
        assert_eq!(DigestAlgorithm::from_header_token(Some("sha-256")), Some(DigestAlgorithm::Sha256));
        assert_eq!(DigestAlgorithm::from_header_token(Some("SHA-512")), None);
    }

    fn digest_user(algorithm: DigestAlgorithm) -> UserTable {
        let ha1 = digest_hash(algorithm, "alice:test:wonderland");
        UserTable::new(vec![User {
            username: "alice".to_owned(),
            password: PasswordHash::Digest { hash: ha1, algorithm },
            role: "user".to_owned(),
        }])
    }

    fn build_response(
        algorithm: DigestAlgorithm,
        nonce: &str,
        nc: u32,
        cnonce: &str,
        uri: &str,
        method: &str,
    ) -> String {
        let ha1 = digest_hash(algorithm, "alice:test:wonderland");
        let ha2 = digest_hash(algorithm, &format!("{method}:{uri}"));
        digest_hash(algorithm, &format!("{ha1}:{nonce}:{nc:08x}:{cnonce}:auth:{ha2}"))
    }

    #[tokio::test]
    async fn verify_digest_accepts_matching_algorithm() {
        let users = digest_user(DigestAlgorithm::Sha256);
        let nonces = NonceStore::new(Duration::from_secs(60));
        let nonce = nonces.issue();
        let response = build_response(DigestAlgorithm::Sha256, &nonce, 1, "cn1", "/secret", "GET");
        let header = format!(
            r#"Digest username="alice", realm="test", nonce="{nonce}", uri="/secret", response="{response}", algorithm=SHA-256, qop=auth, nc=00000001, cnonce="cn1""#
        );

        let outcome =
            verify_digest(&users, &nonces, "GET", DigestAlgorithm::Sha256, b"/secret", Some(header.as_bytes())).await;
        assert!(matches!(outcome, AuthOutcome::Ok(_)));
    }

    #[tokio::test]
    async fn verify_digest_rejects_algorithm_mismatch() {
        let users = digest_user(DigestAlgorithm::Sha256);
        let nonces = NonceStore::new(Duration::from_secs(60));
        let nonce = nonces.issue();
        // Client claims MD5 while the route (and the stored hash) require SHA-256.
        let md5_response = build_response(DigestAlgorithm::Md5, &nonce, 1, "cn1", "/secret", "GET");
        let header = format!(
            r#"Digest username="alice", realm="test", nonce="{nonce}", uri="/secret", response="{md5_response}", algorithm=MD5, qop=auth, nc=00000001, cnonce="cn1""#
        );

        let outcome =
            verify_digest(&users, &nonces, "GET", DigestAlgorithm::Sha256, b"/secret", Some(header.as_bytes())).await;
        assert!(matches!(outcome, AuthOutcome::Invalid));
    }

    #[tokio::test]
    async fn verify_digest_rejects_unsupported_algorithm_token() {
        let users = digest_user(DigestAlgorithm::Md5);
        let nonces = NonceStore::new(Duration::from_secs(60));
        let nonce = nonces.issue();
        let header = format!(
            r#"Digest username="alice", realm="test", nonce="{nonce}", uri="/secret", response="irrelevant", algorithm=SHA-512, qop=auth, nc=00000001, cnonce="cn1""#
        );

        let outcome =
            verify_digest(&users, &nonces, "GET", DigestAlgorithm::Md5, b"/secret", Some(header.as_bytes())).await;
        assert!(matches!(outcome, AuthOutcome::Invalid));
    }

    #[tokio::test]
    async fn verify_digest_rejects_uri_mismatch() {
        let users = digest_user(DigestAlgorithm::Sha256);
        let nonces = NonceStore::new(Duration::from_secs(60));
        let nonce = nonces.issue();
        // Response computed (and valid) for `/secret`, replayed against `/other`.
        let response = build_response(DigestAlgorithm::Sha256, &nonce, 1, "cn1", "/secret", "GET");
        let header = format!(
            r#"Digest username="alice", realm="test", nonce="{nonce}", uri="/secret", response="{response}", algorithm=SHA-256, qop=auth, nc=00000001, cnonce="cn1""#
        );

        let outcome =
            verify_digest(&users, &nonces, "GET", DigestAlgorithm::Sha256, b"/other", Some(header.as_bytes())).await;
        assert!(matches!(outcome, AuthOutcome::Invalid));
    }

    #[tokio::test]
    async fn verify_digest_legacy_no_qop_checks_nonce_freshness_and_single_use() {
        let users = digest_user(DigestAlgorithm::Sha256);
        let nonces = NonceStore::new(Duration::from_secs(60));
        let nonce = nonces.issue();
        let ha1 = digest_hash(DigestAlgorithm::Sha256, "alice:test:wonderland");
        let ha2 = digest_hash(DigestAlgorithm::Sha256, "GET:/secret");
        let response = digest_hash(DigestAlgorithm::Sha256, &format!("{ha1}:{nonce}:{ha2}"));
        let header = format!(
            r#"Digest username="alice", realm="test", nonce="{nonce}", uri="/secret", response="{response}", algorithm=SHA-256"#
        );

        let first =
            verify_digest(&users, &nonces, "GET", DigestAlgorithm::Sha256, b"/secret", Some(header.as_bytes())).await;
        assert!(matches!(first, AuthOutcome::Ok(_)));

        // The same (legacy, counter-less) nonce must not be replayable.
        let second =
            verify_digest(&users, &nonces, "GET", DigestAlgorithm::Sha256, b"/secret", Some(header.as_bytes())).await;
        assert!(matches!(second, AuthOutcome::Invalid));
    }

    #[tokio::test]
    async fn verify_digest_rejects_unknown_nonce_without_qop() {
        let users = digest_user(DigestAlgorithm::Sha256);
        let nonces = NonceStore::new(Duration::from_secs(60));
        let ha1 = digest_hash(DigestAlgorithm::Sha256, "alice:test:wonderland");
        let ha2 = digest_hash(DigestAlgorithm::Sha256, "GET:/secret");
        let response = digest_hash(DigestAlgorithm::Sha256, &format!("{ha1}:never-issued:{ha2}"));
        let header = format!(
            r#"Digest username="alice", realm="test", nonce="never-issued", uri="/secret", response="{response}", algorithm=SHA-256"#
        );

        let outcome =
            verify_digest(&users, &nonces, "GET", DigestAlgorithm::Sha256, b"/secret", Some(header.as_bytes())).await;
        assert!(matches!(outcome, AuthOutcome::Invalid));
    }
}
