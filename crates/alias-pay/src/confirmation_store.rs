use dashmap::DashMap;

use crate::error::PaymentError;
use crate::payment::ConfirmedPayment;

/// Storage for confirmed payments, keyed by cart id.
///
/// Implementations must be thread-safe (`Send + Sync`). Entries never expire.
pub trait ConfirmationStore: Send + Sync {
    fn get(&self, cart_id: &str) -> Option<ConfirmedPayment>;

    /// Record a confirmation, replacing any earlier one for the same cart.
    fn record(&self, confirmed: &ConfirmedPayment) -> Result<(), PaymentError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store backed by DashMap. Lost on restart.
#[derive(Default)]
pub struct InMemoryConfirmationStore {
    confirmed: DashMap<String, ConfirmedPayment>,
}

impl InMemoryConfirmationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfirmationStore for InMemoryConfirmationStore {
    fn get(&self, cart_id: &str) -> Option<ConfirmedPayment> {
        self.confirmed.get(cart_id).map(|c| c.value().clone())
    }

    fn record(&self, confirmed: &ConfirmedPayment) -> Result<(), PaymentError> {
        self.confirmed
            .insert(confirmed.cart_id.clone(), confirmed.clone());
        Ok(())
    }

    fn len(&self) -> usize {
        self.confirmed.len()
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConfirmationStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use std::sync::{Mutex, MutexGuard};

    use chrono::{DateTime, Utc};
    use rusqlite::{params, Connection, OptionalExtension};

    use super::ConfirmationStore;
    use crate::error::PaymentError;
    use crate::payment::ConfirmedPayment;

    /// Persistent store backed by SQLite. Survives restarts.
    pub struct SqliteConfirmationStore {
        conn: Mutex<Connection>,
    }

    impl SqliteConfirmationStore {
        /// Open (or create) the database at `path`. On Unix the file is
        /// restricted to 0600.
        pub fn open(path: &str) -> Result<Self, PaymentError> {
            let conn = Connection::open(path)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS confirmed_payments (
                    cart_id TEXT PRIMARY KEY,
                    request_id TEXT NOT NULL,
                    settlement_ref TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    confirmed_at TEXT NOT NULL
                );
                PRAGMA journal_mode=WAL;",
            )?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) =
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                {
                    tracing::warn!(
                        path = %path,
                        error = %e,
                        "failed to restrict confirmation database permissions"
                    );
                }
            }

            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn conn(&self) -> MutexGuard<'_, Connection> {
            match self.conn.lock() {
                Ok(c) => c,
                Err(poisoned) => {
                    tracing::error!("confirmation store mutex poisoned, recovering");
                    poisoned.into_inner()
                }
            }
        }
    }

    impl ConfirmationStore for SqliteConfirmationStore {
        fn get(&self, cart_id: &str) -> Option<ConfirmedPayment> {
            let conn = self.conn();
            let row = conn
                .query_row(
                    "SELECT request_id, settlement_ref, amount, confirmed_at
                     FROM confirmed_payments WHERE cart_id = ?1",
                    [cart_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional();

            let (request_id, settlement_ref, amount, confirmed_at) = match row {
                Ok(Some(r)) => r,
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!(cart_id = %cart_id, error = %e, "confirmation lookup failed");
                    return None;
                }
            };

            let confirmed_at = match DateTime::parse_from_rfc3339(&confirmed_at) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    tracing::error!(cart_id = %cart_id, error = %e, "corrupt confirmed_at");
                    return None;
                }
            };

            Some(ConfirmedPayment {
                cart_id: cart_id.to_string(),
                request_id,
                settlement_ref,
                amount: u64::try_from(amount).unwrap_or_default(),
                confirmed_at,
            })
        }

        fn record(&self, confirmed: &ConfirmedPayment) -> Result<(), PaymentError> {
            let amount = i64::try_from(confirmed.amount).map_err(|_| {
                PaymentError::Persistence(format!("amount {} exceeds i64", confirmed.amount))
            })?;
            self.conn().execute(
                "INSERT OR REPLACE INTO confirmed_payments
                 (cart_id, request_id, settlement_ref, amount, confirmed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    confirmed.cart_id,
                    confirmed.request_id,
                    confirmed.settlement_ref,
                    amount,
                    confirmed.confirmed_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        }

        fn len(&self) -> usize {
            self.conn()
                .query_row("SELECT COUNT(*) FROM confirmed_payments", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| usize::try_from(n).unwrap_or_default())
                .unwrap_or(0)
        }
    }
}
