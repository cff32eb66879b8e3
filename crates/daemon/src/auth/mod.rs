//! Authentication: credentials, session tokens and login rate limiting.

pub mod rate_limit;
pub mod store;

use std::time::Duration;

use thiserror::Error;

pub use rate_limit::LoginRateLimiter;
pub use store::{Credentials, SessionRecord, SessionStore, SessionToken};

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "termhost_session";

/// Authentication failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Username or password did not match.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The request carried no session token.
    #[error("Authentication required")]
    MissingSession,

    /// The token is unknown or expired.
    #[error("Session expired or invalid")]
    InvalidSession,
}

/// Login attempts refused by the rate limiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Too many login attempts, try again in {} seconds", retry_after.as_secs().max(1))]
    TooManyAttempts { retry_after: Duration },
}

impl RateLimitError {
    /// Seconds until the caller may try again, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let RateLimitError::TooManyAttempts { retry_after } = self;
        let secs = retry_after.as_secs();
        if retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_rounds_up() {
        let err = RateLimitError::TooManyAttempts {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.retry_after_secs(), 2);

        let err = RateLimitError::TooManyAttempts {
            retry_after: Duration::ZERO,
        };
        assert_eq!(err.retry_after_secs(), 1);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(AuthError::InvalidCredentials.to_string(), "Invalid credentials");
        let err = RateLimitError::TooManyAttempts {
            retry_after: Duration::from_secs(60),
        };
        assert!(err.to_string().contains("60 seconds"));
    }
}
