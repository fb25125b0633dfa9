use std::time::Duration;

/// Alias resolution attempts before giving up.
pub const RESOLVE_MAX_ATTEMPTS: u32 = 3;

/// Base delay for resolution backoff; attempt `n` sleeps `base * 2^(n-1)`.
pub const RESOLVE_BASE_DELAY: Duration = Duration::from_secs(1);

/// A single directory lookup slower than this is treated as a probable timeout.
pub const RESOLVE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound for caller-supplied confirmation waits.
pub const MAX_CONFIRM_WAIT_SECS: u64 = 120;

/// Terminal orders are pruned this long after their last update.
pub const ORDER_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the pruning task runs.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Leading marker stripped from aliases before lookup.
pub const ALIAS_MARKER: char = '@';

/// Coin used when the caller does not configure one.
pub const DEFAULT_COIN_ID: &str = "UCT";

/// Capacity of the inbound relay event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runtime configuration for [`crate::service::PaymentService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfig {
    pub resolve_attempts: u32,
    pub resolve_base_delay: Duration,
    pub resolve_attempt_timeout: Duration,
    pub max_confirm_wait_secs: u64,
    pub order_retention: Duration,
    pub prune_interval: Duration,
    pub coin_id: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            resolve_attempts: RESOLVE_MAX_ATTEMPTS,
            resolve_base_delay: RESOLVE_BASE_DELAY,
            resolve_attempt_timeout: RESOLVE_ATTEMPT_TIMEOUT,
            max_confirm_wait_secs: MAX_CONFIRM_WAIT_SECS,
            order_retention: ORDER_RETENTION,
            prune_interval: PRUNE_INTERVAL,
            coin_id: DEFAULT_COIN_ID.to_string(),
        }
    }
}
