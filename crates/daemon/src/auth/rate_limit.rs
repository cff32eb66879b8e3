//! Per-address login rate limiting.
//!
//! Keeps a sliding window of attempt timestamps per source address. The
//! limiter is consulted before credentials are checked, so a blocked caller
//! learns nothing about whether its password was right.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::RateLimitError;
use crate::config::AuthConfig;

/// Sliding-window limiter keyed by source address.
pub struct LoginRateLimiter {
    attempts: DashMap<IpAddr, VecDeque<Instant>>,
    max_attempts: u32,
    window: Duration,
}

impl LoginRateLimiter {
    /// Allows `max_attempts` per `window` for each address.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            attempts: DashMap::new(),
            max_attempts,
            window,
        }
    }

    /// Creates a limiter from configuration.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.max_login_attempts, config.login_window())
    }

    /// Records an attempt from `addr`, or refuses it if the address has used
    /// up its window.
    pub fn check(&self, addr: IpAddr) -> Result<(), RateLimitError> {
        self.check_at(addr, Instant::now())
    }

    fn check_at(&self, addr: IpAddr, now: Instant) -> Result<(), RateLimitError> {
        let mut entry = self.attempts.entry(addr).or_default();
        let history = entry.value_mut();

        while history
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            history.pop_front();
        }

        if history.len() >= self.max_attempts as usize {
            let retry_after = history
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);

            tracing::warn!(
                addr = %addr,
                retry_after_secs = retry_after.as_secs(),
                "Login attempt rate limited"
            );
            return Err(RateLimitError::TooManyAttempts { retry_after });
        }

        history.push_back(now);
        Ok(())
    }

    /// Drops addresses with no attempts inside the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.attempts.retain(|_, history| {
            history
                .back()
                .is_some_and(|t| now.duration_since(*t) < self.window)
        });
    }

    /// Number of tracked addresses.
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }
}
