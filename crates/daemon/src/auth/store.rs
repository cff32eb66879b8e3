//! Credential verification and session tokens.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use protocol::ANONYMOUS_USER;

use super::AuthError;
use crate::config::AuthConfig;

/// Number of random bytes in a session token.
const TOKEN_BYTES: usize = 32;

/// Opaque, unguessable session identifier.
pub type SessionToken = String;

/// Configured username and password.
///
/// Only digests are kept; the clear-text password is dropped after
/// construction.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    username_digest: [u8; 32],
    password_digest: [u8; 32],
}

impl Credentials {
    /// Creates credentials from clear-text values.
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        let username = username.into();
        Self {
            username_digest: digest(username.as_bytes()),
            password_digest: digest(password.as_bytes()),
            username,
        }
    }

    /// The configured username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Checks a supplied pair against the configured one.
    ///
    /// Both sides are hashed to fixed-size digests and compared without
    /// early exit, so timing does not depend on where the inputs differ.
    pub fn matches(&self, username: &str, password: &str) -> bool {
        let user_ok = digest(username.as_bytes())[..].ct_eq(&self.username_digest[..]);
        let pass_ok = digest(password.as_bytes())[..].ct_eq(&self.password_digest[..]);
        bool::from(user_ok & pass_ok)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A server-side session record.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Whether the holder logged in.
    pub authenticated: bool,
    /// Username the session belongs to.
    pub username: String,
    /// When the session was issued.
    pub issued_at: Instant,
    /// When the session lapses unless used again.
    pub expires_at: Instant,
}

impl SessionRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory session store.
///
/// Tokens live only in memory; a restart invalidates all of them. Expired
/// tokens are treated as absent everywhere and purged lazily or by
/// [`SessionStore::purge_expired`].
pub struct SessionStore {
    sessions: DashMap<SessionToken, SessionRecord>,
    credentials: Option<Credentials>,
    timeout: Duration,
}

impl SessionStore {
    /// Creates a store.
    ///
    /// `credentials` of `None` disables authentication: every caller is
    /// treated as [`ANONYMOUS_USER`].
    pub fn new(credentials: Option<Credentials>, timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            credentials,
            timeout,
        }
    }

    /// Creates a store from configuration.
    pub fn from_config(config: &AuthConfig) -> Self {
        let credentials = config
            .enabled
            .then(|| Credentials::new(config.username.clone(), &config.password));
        Self::new(credentials, config.session_timeout())
    }

    /// Whether authentication is required.
    pub fn auth_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    /// Session idle timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Verifies a username and password against the configured credentials.
    pub fn verify(&self, username: &str, password: &str) -> Result<(), AuthError> {
        match &self.credentials {
            Some(credentials) if credentials.matches(username, password) => Ok(()),
            Some(_) => Err(AuthError::InvalidCredentials),
            None => Ok(()),
        }
    }

    /// Issues a new session token for `username`.
    pub fn issue(&self, username: &str) -> SessionToken {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let now = Instant::now();
        self.sessions.insert(
            token.clone(),
            SessionRecord {
                authenticated: true,
                username: username.to_string(),
                issued_at: now,
                expires_at: now + self.timeout,
            },
        );

        tracing::debug!(username = %username, "Issued session");
        token
    }

    /// Invalidates a token. Idempotent.
    pub fn invalidate(&self, token: &str) {
        if self.sessions.remove(token).is_some() {
            tracing::debug!("Invalidated session");
        }
    }

    /// Whether `token` refers to a live, authenticated session.
    ///
    /// Does not extend the session.
    pub fn is_valid(&self, token: &str) -> bool {
        let now = Instant::now();
        match self.sessions.get(token) {
            Some(record) => record.authenticated && !record.is_expired(now),
            None => false,
        }
    }

    /// Resolves a token to its username and extends its idle lifetime.
    ///
    /// Returns `None` for unknown, expired or unauthenticated tokens; expired
    /// records are removed.
    pub fn touch(&self, token: &str) -> Option<String> {
        let now = Instant::now();

        let expired = match self.sessions.get_mut(token) {
            Some(mut record) if !record.is_expired(now) => {
                if !record.authenticated {
                    return None;
                }
                record.expires_at = now + self.timeout;
                return Some(record.username.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.sessions.remove(token);
        }
        None
    }

    /// Decides whether a caller presenting `token` may proceed.
    ///
    /// With authentication disabled everyone is admitted as
    /// [`ANONYMOUS_USER`].
    pub fn authorize(&self, token: Option<&str>) -> Result<String, AuthError> {
        if !self.auth_enabled() {
            return Ok(ANONYMOUS_USER.to_string());
        }

        let token = token.ok_or(AuthError::MissingSession)?;
        self.touch(token).ok_or(AuthError::InvalidSession)
    }

    /// Removes expired sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, record| !record.is_expired(now));
        before - self.sessions.len()
    }

    /// Number of stored sessions, expired or not.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are stored.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(
            Some(Credentials::new("admin", "correct horse")),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_verify_correct_credentials() {
        assert!(store().verify("admin", "correct horse").is_ok());
    }

    #[test]
    fn test_verify_wrong_credentials() {
        let store = store();
        assert_eq!(
            store.verify("admin", "wrong"),
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            store.verify("root", "correct horse"),
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(store.verify("", ""), Err(AuthError::InvalidCredentials));
    }

    #[test]
    fn test_verify_rejects_every_single_character_mutation() {
        let store = store();
        let password = "correct horse";

        for i in 0..password.len() {
            let mut bytes = password.as_bytes().to_vec();
            bytes[i] ^= 0x01;
            let mutated = String::from_utf8(bytes).unwrap();
            assert!(store.verify("admin", &mutated).is_err(), "accepted {:?}", mutated);

            let truncated = format!("{}{}", &password[..i], &password[i + 1..]);
            assert!(store.verify("admin", &truncated).is_err());
        }

        assert!(store.verify("admin", "correct horse ").is_err());
        assert!(store.verify("Admin", password).is_err());
    }

    #[test]
    fn test_matches_compares_both_fields() {
        let credentials = Credentials::new("admin", "pw");
        assert!(credentials.matches("admin", "pw"));
        assert!(!credentials.matches("admin", "pW"));
        assert!(!credentials.matches("admim", "pw"));
        assert!(!credentials.matches("", ""));
        assert!(!credentials.matches("pw", "admin"));
    }

    #[test]
    fn test_issue_and_validate() {
        let store = store();
        let token = store.issue("admin");

        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(store.is_valid(&token));
        assert_eq!(store.touch(&token).as_deref(), Some("admin"));
        assert_eq!(store.authorize(Some(&token)).unwrap(), "admin");
    }

    #[test]
    fn test_tokens_are_unique() {
        let store = store();
        let a = store.issue("admin");
        let b = store.issue("admin");
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let store = store();
        let token = store.issue("admin");

        store.invalidate(&token);
        store.invalidate(&token);
        assert!(!store.is_valid(&token));
        assert_eq!(
            store.authorize(Some(&token)),
            Err(AuthError::InvalidSession)
        );
    }

    #[test]
    fn test_unknown_and_missing_tokens() {
        let store = store();
        assert!(!store.is_valid("deadbeef"));
        assert_eq!(store.authorize(None), Err(AuthError::MissingSession));
        assert_eq!(
            store.authorize(Some("deadbeef")),
            Err(AuthError::InvalidSession)
        );
    }

    #[test]
    fn test_expired_token_is_absent() {
        let store = SessionStore::new(
            Some(Credentials::new("admin", "pw")),
            Duration::from_millis(20),
        );
        let token = store.issue("admin");
        std::thread::sleep(Duration::from_millis(40));

        assert!(!store.is_valid(&token));
        assert_eq!(store.touch(&token), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_touch_extends_lifetime() {
        let store = SessionStore::new(
            Some(Credentials::new("admin", "pw")),
            Duration::from_millis(200),
        );
        let token = store.issue("admin");

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(80));
            assert!(store.touch(&token).is_some());
        }
        assert!(store.is_valid(&token));
    }

    #[test]
    fn test_purge_expired() {
        let store = SessionStore::new(
            Some(Credentials::new("admin", "pw")),
            Duration::from_millis(20),
        );
        store.issue("admin");
        store.issue("admin");
        std::thread::sleep(Duration::from_millis(40));
        let live = {
            let s = SessionStore::new(None, Duration::from_secs(60));
            s.issue(ANONYMOUS_USER);
            s
        };

        assert_eq!(store.purge_expired(), 2);
        assert_eq!(live.purge_expired(), 0);
    }

    #[test]
    fn test_auth_disabled_admits_anonymous() {
        let store = SessionStore::new(None, Duration::from_secs(60));
        assert!(!store.auth_enabled());
        assert!(store.verify("anyone", "anything").is_ok());
        assert_eq!(store.authorize(None).unwrap(), ANONYMOUS_USER);

        let token = store.issue(ANONYMOUS_USER);
        assert!(store.is_valid(&token));
        assert_eq!(store.authorize(Some(&token)).unwrap(), ANONYMOUS_USER);
    }

    #[test]
    fn test_from_config() {
        let mut config = AuthConfig::default();
        assert!(!SessionStore::from_config(&config).auth_enabled());

        config.enabled = true;
        config.password = "pw".to_string();
        let store = SessionStore::from_config(&config);
        assert!(store.auth_enabled());
        assert!(store.verify("admin", "pw").is_ok());
        assert_eq!(store.timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_credentials_debug_hides_digests() {
        let debug = format!("{:?}", Credentials::new("admin", "pw"));
        assert!(debug.contains("admin"));
        assert!(!debug.contains("digest"));
    }
}
