//! Authenticator contract consumed at upgrade time.
//!
//! The hub never interprets credentials itself: it hands the upgrade
//! request's headers to an [`Authenticator`] and receives a stable
//! `(user_id, display_name)` pair or a rejection. Session issuance lives
//! with the identity provider, outside this process.

use async_trait::async_trait;
use axum::http::header::{COOKIE, ORIGIN};
use axum::http::HeaderMap;
use dashmap::DashMap;

/// Name of the session cookie honored by the shipped authenticator.
pub const SESSION_COOKIE: &str = "parlor_session";

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// Rejection returned when the session credential is missing or invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRejected;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve the upgrade request to an identity, or reject it.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthRejected>;
}

/// Check the `Origin` header against the configured exact-match allow list.
pub fn origin_allowed(headers: &HeaderMap, allow_list: &[String]) -> bool {
    match headers.get(ORIGIN).and_then(|v| v.to_str().ok()) {
        Some(origin) => allow_list.iter().any(|allowed| allowed == origin),
        None => false,
    }
}

/// Extract the session token from the `Cookie` header.
fn session_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Cookie-token authenticator backed by a static session map.
///
/// Stands in for the identity provider behind the same trait: tests insert
/// sessions directly, and `main` can seed it from `PARLOR_DEV_SESSIONS`
/// (`token:user_id:display name` entries, comma-separated).
pub struct StaticSessionAuthenticator {
    sessions: DashMap<String, Identity>,
}

impl StaticSessionAuthenticator {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn from_env() -> Self {
        let auth = Self::new();
        if let Ok(seed) = std::env::var("PARLOR_DEV_SESSIONS") {
            for entry in seed.split(',').filter(|s| !s.trim().is_empty()) {
                let mut parts = entry.trim().splitn(3, ':');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(token), Some(user_id), Some(name)) => {
                        auth.insert_session(token, user_id, name);
                    }
                    _ => tracing::warn!(entry, "malformed PARLOR_DEV_SESSIONS entry, skipping"),
                }
            }
        }
        auth
    }

    pub fn insert_session(&self, token: &str, user_id: &str, display_name: &str) {
        self.sessions.insert(
            token.to_string(),
            Identity {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
            },
        );
    }

    pub fn revoke_session(&self, token: &str) {
        self.sessions.remove(token);
    }
}

impl Default for StaticSessionAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for StaticSessionAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthRejected> {
        let token = session_token(headers).ok_or(AuthRejected)?;
        let identity = self.sessions.get(&token).ok_or(AuthRejected)?.clone();

        // The authenticator contract promises a stable, bounded user id.
        if identity.user_id.is_empty() || identity.user_id.len() > 128 {
            return Err(AuthRejected);
        }

        Ok(identity)
    }
}
