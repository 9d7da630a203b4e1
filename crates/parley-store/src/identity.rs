use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use tracing::instrument;

use parley_core::ids::{AccountId, CustomerId};

use crate::database::Database;
use crate::error::StoreError;

/// Storage for the single cached customer id of a session. Last writer wins.
pub trait IdentityCache: Send + Sync {
    fn customer_id(&self) -> Result<Option<CustomerId>, StoreError>;
    fn set_customer_id(&self, customer_id: &CustomerId) -> Result<(), StoreError>;
    fn remove_customer_id(&self) -> Result<(), StoreError>;
}

/// Identity cache persisted in SQLite, one row per namespace.
pub struct SqliteIdentityCache {
    db: Database,
    namespace: String,
}

impl SqliteIdentityCache {
    pub fn new(db: Database, namespace: impl Into<String>) -> Self {
        Self {
            db,
            namespace: namespace.into(),
        }
    }

    /// Cache scoped to one account, so several widgets can share a file.
    pub fn for_account(db: Database, account_id: &AccountId) -> Self {
        Self::new(db, default_namespace(account_id))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

pub fn default_namespace(account_id: &AccountId) -> String {
    format!("parley:{account_id}")
}

impl IdentityCache for SqliteIdentityCache {
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    fn customer_id(&self) -> Result<Option<CustomerId>, StoreError> {
        self.db.with_conn(|conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT customer_id FROM identity_cache WHERE namespace = ?1",
                    [&self.namespace],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id.map(CustomerId::from_raw))
        })
    }

    #[instrument(skip(self), fields(namespace = %self.namespace, customer_id = %customer_id))]
    fn set_customer_id(&self, customer_id: &CustomerId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO identity_cache (namespace, customer_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(namespace) DO UPDATE SET
                     customer_id = excluded.customer_id,
                     updated_at = excluded.updated_at",
                rusqlite::params![self.namespace, customer_id.as_str(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    fn remove_customer_id(&self) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "DELETE FROM identity_cache WHERE namespace = ?1",
                [&self.namespace],
            )?;
            Ok(())
        })
    }
}

/// Process-local identity cache.
#[derive(Default)]
pub struct MemoryIdentityCache {
    customer_id: Mutex<Option<CustomerId>>,
}

impl MemoryIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_customer_id(customer_id: CustomerId) -> Self {
        Self {
            customer_id: Mutex::new(Some(customer_id)),
        }
    }
}

impl IdentityCache for MemoryIdentityCache {
    fn customer_id(&self) -> Result<Option<CustomerId>, StoreError> {
        Ok(self.customer_id.lock().clone())
    }

    fn set_customer_id(&self, customer_id: &CustomerId) -> Result<(), StoreError> {
        *self.customer_id.lock() = Some(customer_id.clone());
        Ok(())
    }

    fn remove_customer_id(&self) -> Result<(), StoreError> {
        *self.customer_id.lock() = None;
        Ok(())
    }
}
