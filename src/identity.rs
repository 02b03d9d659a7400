//! Per-client pseudo-identity derived from a long-lived cookie.
//!
//! Every client carries a `token` cookie of 64 random digits. The identity
//! used for ownership checks is the SHA-256 digest of that token folded into
//! a v4-shaped UUID, so the server never stores the token itself and the
//! identity is stable across requests without any account system.

use axum::http::{HeaderMap, HeaderValue, header};
use chrono::{Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const TOKEN_DIGITS: usize = 64;

/// Resolved caller identity plus the token that produced it.
pub struct ClientIdentity {
    pub identity: Uuid,
    pub token: String,
}

/// Resolve the caller's identity from the `token` cookie, minting a fresh
/// token when the cookie is missing or empty.
pub fn client_identity(headers: &HeaderMap) -> ClientIdentity {
    let token = match token_cookie(headers) {
        Some(token) => token,
        None => random_digits(TOKEN_DIGITS),
    };
    let identity = identity_from_token(&token);
    ClientIdentity { identity, token }
}

/// Hash a token into an opaque 128-bit identity shaped like a v4 UUID.
pub fn identity_from_token(token: &str) -> Uuid {
    let digest = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    // Builder stamps the version and variant bits over the raw digest.
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Generate `length` random decimal digits.
pub fn random_digits(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Attach a one-year `Set-Cookie` header carrying the token.
pub fn set_token_cookie(headers: &mut HeaderMap, token: &str) {
    let expires = (Utc::now() + Duration::days(365)).format("%a, %d %b %Y %H:%M:%S GMT");
    let cookie = format!("token={token}; path=/; expires={expires}");
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        headers.insert(header::SET_COOKIE, value);
    }
}

fn token_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            if name == "token" && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
