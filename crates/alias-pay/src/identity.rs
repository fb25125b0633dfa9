//! Alias resolution with bounded retry.
//!
//! Lookups go through an [`AliasDirectory`]. Each attempt is capped by a
//! sub-timeout; attempt `n` is followed by a `base * 2^(n-1)` sleep unless it
//! was the last one.

use std::sync::Arc;
use std::time::Duration;

use crate::constants::{self, ALIAS_MARKER};
use crate::ports::AliasDirectory;

/// A successfully resolved counterparty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Normalized alias.
    pub alias: String,
    pub address: String,
}

/// Strip surrounding whitespace and the leading alias marker.
pub fn normalize_alias(alias: &str) -> String {
    let trimmed = alias.trim();
    trimmed
        .strip_prefix(ALIAS_MARKER)
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

pub struct IdentityResolver {
    directory: Arc<dyn AliasDirectory>,
    max_attempts: u32,
    base_delay: Duration,
    attempt_timeout: Duration,
}

impl IdentityResolver {
    pub fn new(directory: Arc<dyn AliasDirectory>) -> Self {
        Self {
            directory,
            max_attempts: constants::RESOLVE_MAX_ATTEMPTS,
            base_delay: constants::RESOLVE_BASE_DELAY,
            attempt_timeout: constants::RESOLVE_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay = base_delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after a failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Resolve `alias`, returning `None` only once every attempt has failed.
    pub async fn resolve(&self, alias: &str) -> Option<ResolvedIdentity> {
        let name = normalize_alias(alias);
        if name.is_empty() {
            tracing::warn!(alias = %alias, "empty alias, skipping lookup");
            return None;
        }

        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.attempt_timeout, self.directory.lookup(&name)).await {
                Ok(Ok(Some(address))) => {
                    tracing::debug!(alias = %name, address = %address, attempt, "alias resolved");
                    return Some(ResolvedIdentity {
                        alias: name,
                        address,
                    });
                }
                Ok(Ok(None)) => {
                    tracing::warn!(alias = %name, attempt, "alias not found");
                }
                Ok(Err(e)) => {
                    tracing::warn!(alias = %name, attempt, error = %e, "alias lookup failed");
                }
                Err(_) => {
                    tracing::warn!(
                        alias = %name,
                        attempt,
                        timeout_secs = self.attempt_timeout.as_secs(),
                        "alias lookup exceeded sub-timeout, probable directory timeout"
                    );
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        tracing::warn!(
            alias = %name,
            attempts = self.max_attempts,
            "alias unresolved after all attempts"
        );
        None
    }
}
