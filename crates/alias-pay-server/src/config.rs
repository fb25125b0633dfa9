use std::env;
use std::time::Duration;

use alias_pay::PaymentConfig;
use url::Url;

const DEFAULT_PORT: u16 = 4080;
const DEFAULT_RATE_LIMIT_RPM: u64 = 120;

/// Upstream service locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamUrls {
    pub relay: String,
    pub directory: String,
    pub ledger: String,
    pub cart_service: String,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub upstream: UpstreamUrls,
    /// Shared secret for `X-Relay-Signature` (None = insecure dev mode)
    pub relay_secret: Option<Vec<u8>>,
    /// Bearer token for /metrics (None = forbidden unless public metrics are enabled)
    pub metrics_token: Option<String>,
    /// Bearer token for /admin routes (None = admin routes disabled)
    pub admin_token: Option<String>,
    pub public_metrics: bool,
    pub rate_limit_rpm: u64,
    /// SQLite file for confirmed payments (None = in-memory)
    pub confirmation_db_path: Option<String>,
    pub payment: PaymentConfig,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("upstream", &self.upstream)
            .field("relay_secret", &self.relay_secret.as_ref().map(|_| "[REDACTED]"))
            .field("metrics_token", &self.metrics_token.as_ref().map(|_| "[REDACTED]"))
            .field("admin_token", &self.admin_token.as_ref().map(|_| "[REDACTED]"))
            .field("public_metrics", &self.public_metrics)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("confirmation_db_path", &self.confirmation_db_path)
            .field("payment", &self.payment)
            .finish()
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let upstream = UpstreamUrls {
            relay: required_url("RELAY_URL")?,
            directory: required_url("DIRECTORY_URL")?,
            ledger: required_url("LEDGER_URL")?,
            cart_service: required_url("CART_SERVICE_URL")?,
        };

        let port = parsed("PORT")?.unwrap_or(DEFAULT_PORT);
        let rate_limit_rpm = parsed("RATE_LIMIT_RPM")?.unwrap_or(DEFAULT_RATE_LIMIT_RPM);

        let relay_secret = non_empty("RELAY_SHARED_SECRET").map(String::into_bytes);
        let insecure_no_hmac = flag("ALIAS_PAY_INSECURE_NO_HMAC");
        match &relay_secret {
            Some(secret) if secret.len() < 32 => tracing::warn!(
                "RELAY_SHARED_SECRET is only {} bytes (minimum 32 recommended)",
                secret.len()
            ),
            Some(_) => {}
            None if insecure_no_hmac => tracing::warn!(
                "ALIAS_PAY_INSECURE_NO_HMAC=true: relay events are accepted UNAUTHENTICATED"
            ),
            None => return Err(ConfigError::MissingRequired("RELAY_SHARED_SECRET")),
        }

        let metrics_token = non_empty("METRICS_TOKEN");
        let public_metrics = flag("ALIAS_PAY_PUBLIC_METRICS");
        if metrics_token.is_none() && !public_metrics {
            tracing::warn!("METRICS_TOKEN not set, /metrics will refuse every request");
        }
        let admin_token = non_empty("ADMIN_TOKEN");
        if admin_token.is_none() {
            tracing::warn!("ADMIN_TOKEN not set, admin routes are disabled");
        }

        let mut payment = PaymentConfig::default();
        if let Some(coin_id) = non_empty("COIN_ID") {
            payment.coin_id = coin_id;
        }
        if let Some(hours) = parsed::<u64>("ORDER_RETENTION_HOURS")? {
            payment.order_retention = Duration::from_secs(hours.saturating_mul(3600));
        }
        if let Some(attempts) = parsed::<u32>("RESOLVE_ATTEMPTS")? {
            if attempts == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "RESOLVE_ATTEMPTS",
                    value: "0".into(),
                });
            }
            payment.resolve_attempts = attempts;
        }

        Ok(Self {
            port,
            upstream,
            relay_secret,
            metrics_token,
            admin_token,
            public_metrics,
            rate_limit_rpm,
            confirmation_db_path: non_empty("CONFIRMATION_DB_PATH"),
            payment,
        })
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn required_url(name: &'static str) -> Result<String, ConfigError> {
    let value = non_empty(name).ok_or(ConfigError::MissingRequired(name))?;
    let url = Url::parse(&value).map_err(|_| ConfigError::InvalidUrl(value.clone()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl(value));
    }
    Ok(value.trim_end_matches('/').to_string())
}

fn parsed<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match non_empty(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}
