//! Account domain model and the local store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::sync::{AccountPayload, MergedAccount};

/// Identity key for reconciliation: `(account_name, issuer)`.
///
/// `account_name` alone is not unique; the same label can exist under
/// different issuers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountKey {
    pub account_name: String,
    pub issuer: Option<String>,
}

impl AccountKey {
    pub fn new(account_name: impl Into<String>, issuer: Option<&str>) -> Self {
        Self {
            account_name: account_name.into(),
            issuer: issuer.map(str::to_string),
        }
    }
}

/// A stored two-factor account record, the unit of synchronization.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Local row id; `None` for records materialized from the server that
    /// have not been persisted yet.
    pub id: Option<i32>,
    pub issuer: Option<String>,
    pub account_name: String,
    /// The account name at last successful sync, kept until the rename has
    /// been absorbed by the server.
    pub old_account_name: Option<String>,
    /// Base32 shared secret. Sensitive; `Debug` redacts it.
    pub secret: String,
    /// Cached display token; derived, never authoritative.
    pub token: Option<String>,
    /// Tombstone marker. Set rows are excluded from active listings but kept
    /// for delete propagation.
    pub deleted_at: Option<DateTime<Utc>>,
    pub changed_at: DateTime<Utc>,
    pub sync_at: Option<DateTime<Utc>>,
    /// Opaque tag identifying the client/install that created the record.
    pub origin: Option<String>,
}

impl Account {
    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.account_name.clone(), self.issuer.as_deref())
    }

    /// Identity key before the pending rename, when one exists.
    pub fn old_key(&self) -> Option<AccountKey> {
        self.old_account_name
            .as_ref()
            .map(|old| AccountKey::new(old.clone(), self.issuer.as_deref()))
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Account")
            .field("id", &self.id)
            .field("issuer", &self.issuer)
            .field("account_name", &self.account_name)
            .field("old_account_name", &self.old_account_name)
            .field("secret", &"[REDACTED]")
            .field("deleted_at", &self.deleted_at)
            .field("changed_at", &self.changed_at)
            .field("sync_at", &self.sync_at)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Input for creating an account (manual entry, QR scan, bulk import).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    pub account_name: String,
    pub issuer: Option<String>,
    pub secret: String,
    pub origin: Option<String>,
}

/// Partial update for an existing account. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountUpdate {
    pub issuer: Option<String>,
    pub secret: Option<String>,
}

/// Contract the sync orchestrator needs from the local record store.
///
/// Implemented by the SQLite repository; tests substitute in-memory fakes.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// All records, tombstoned included — the merge input.
    fn load_all(&self) -> Result<Vec<Account>>;

    /// Commit one converged set atomically: either every upsert/delete of the
    /// pass lands or none of them do.
    async fn apply_merge(&self, merged: Vec<MergedAccount>) -> Result<()>;

    /// Post-push bookkeeping; `pushed` is the active projection the server
    /// acknowledged. Rows whose state the push carried get `sync_at = at` and
    /// their rename breadcrumb cleared; tombstones absent from `pushed` are
    /// hard-deleted. Rows mutated while the push was in flight match nothing
    /// in `pushed` and must stay untouched for the next pass.
    async fn mark_synced(&self, at: DateTime<Utc>, pushed: Vec<AccountPayload>) -> Result<()>;
}
