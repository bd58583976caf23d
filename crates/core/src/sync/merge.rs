//! Three-way reconciliation of the local record set against the server list.
//!
//! The backend is a last-write-wins document store with a single list-level
//! timestamp, so precedence is decided per record here on the client: the
//! server snapshot wins only when its clock is strictly newer than the local
//! record's `changed_at`. Rename breadcrumbs (`old_account_name`) let a
//! remote record that still carries the pre-rename identity resolve to the
//! renamed local record instead of forking a duplicate.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::accounts::{Account, AccountKey};
use crate::errors::{Error, Result};
use crate::sync::AccountPayload;

/// One record of the converged set produced by a merge, annotated with
/// whether the pass already observed it on the server.
#[derive(Clone, PartialEq, Eq)]
pub struct MergedAccount {
    pub id: Option<i32>,
    pub issuer: Option<String>,
    pub account_name: String,
    pub old_account_name: Option<String>,
    pub secret: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub changed_at: DateTime<Utc>,
    pub sync_at: Option<DateTime<Utc>>,
    pub origin: Option<String>,
    /// True when the server already reflects this record's state.
    pub synced: bool,
}

impl MergedAccount {
    fn from_local(account: &Account) -> Self {
        Self {
            id: account.id,
            issuer: account.issuer.clone(),
            account_name: account.account_name.clone(),
            old_account_name: account.old_account_name.clone(),
            secret: account.secret.clone(),
            deleted_at: account.deleted_at,
            changed_at: account.changed_at,
            sync_at: account.sync_at,
            origin: account.origin.clone(),
            synced: false,
        }
    }

    fn from_remote(payload: &AccountPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            issuer: payload.issuer.clone(),
            account_name: payload.account_name.clone(),
            old_account_name: None,
            secret: payload.secret_key.clone(),
            deleted_at: None,
            changed_at: now,
            sync_at: None,
            origin: None,
            synced: true,
        }
    }

    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.account_name.clone(), self.issuer.as_deref())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Projection onto the wire record pushed to the server.
    pub fn payload(&self) -> AccountPayload {
        AccountPayload {
            account_name: self.account_name.clone(),
            issuer: self.issuer.clone(),
            secret_key: self.secret.clone(),
        }
    }
}

impl std::fmt::Debug for MergedAccount {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MergedAccount")
            .field("id", &self.id)
            .field("issuer", &self.issuer)
            .field("account_name", &self.account_name)
            .field("old_account_name", &self.old_account_name)
            .field("secret", &"[REDACTED]")
            .field("deleted_at", &self.deleted_at)
            .field("synced", &self.synced)
            .finish()
    }
}

fn key_of(payload: &AccountPayload) -> AccountKey {
    AccountKey::new(payload.account_name.clone(), payload.issuer.as_deref())
}

/// Merge the full local record set (tombstones included) with the server's
/// account list under the server's logical clock.
///
/// Pure and deterministic: output order is local insertion order followed by
/// server-only records in server order. `now` is the timestamp stamped onto
/// tombstones inferred from server-side deletion.
pub fn merge_accounts(
    local: &[Account],
    remote: &[AccountPayload],
    server_timestamp: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<MergedAccount> {
    let mut merged: Vec<MergedAccount> = Vec::with_capacity(local.len() + remote.len());
    // Indexes into `merged`, keyed by current identity and, for records with
    // a pending rename, by the pre-rename identity as well.
    let mut local_index: HashMap<AccountKey, usize> = HashMap::new();

    for account in local {
        let slot = merged.len();
        merged.push(MergedAccount::from_local(account));
        local_index.insert(account.key(), slot);
        if let Some(old_key) = account.old_key() {
            local_index.entry(old_key).or_insert(slot);
        }
    }

    let mut seen_by_server: HashSet<usize> = HashSet::new();
    // Server lists can carry duplicate keys; adopted records collapse to the
    // last occurrence so the converged set stays free of duplicates.
    let mut adopted: HashMap<AccountKey, usize> = HashMap::new();

    for payload in remote {
        let Some(&slot) = local_index.get(&key_of(payload)) else {
            // Brand-new record sourced from the server; adopt it.
            if let Some(&taken) = adopted.get(&key_of(payload)) {
                merged[taken] = MergedAccount::from_remote(payload, now);
            } else {
                adopted.insert(key_of(payload), merged.len());
                merged.push(MergedAccount::from_remote(payload, now));
            }
            continue;
        };
        seen_by_server.insert(slot);
        let current = &mut merged[slot];

        let server_strictly_newer = match server_timestamp {
            Some(ts) => ts > current.changed_at,
            None => false,
        };

        if server_strictly_newer {
            // Server fields win; keep the local id and remember the local
            // name as a breadcrumb when the server renamed the record.
            if current.account_name != payload.account_name {
                current.old_account_name = Some(current.account_name.clone());
            }
            current.account_name = payload.account_name.clone();
            current.issuer = payload.issuer.clone();
            current.secret = payload.secret_key.clone();
            current.deleted_at = None;
            current.synced = true;
        } else if current.account_name != payload.account_name {
            // Local rename is newer or equal: keep local fields, but record
            // the server's name so the push replaces the right entry.
            current.old_account_name = Some(payload.account_name.clone());
            current.synced = false;
        }
        // Otherwise no actionable difference; the local version stands.
    }

    // Any previously-synced local record the server no longer lists was
    // deleted by another device after that record's last sync.
    if let Some(ts) = server_timestamp {
        for (slot, entry) in merged.iter_mut().enumerate() {
            if seen_by_server.contains(&slot) {
                continue;
            }
            if let Some(sync_at) = entry.sync_at {
                if sync_at < ts && !entry.is_deleted() {
                    entry.deleted_at = Some(now);
                    entry.synced = true;
                }
            }
        }
    }

    merged
}

/// Defensive check run before any write: the converged set must not contain
/// two active records with the same `(account_name, issuer)` identity.
pub fn verify_converged(merged: &[MergedAccount]) -> Result<()> {
    let mut seen: HashSet<AccountKey> = HashSet::new();
    for entry in merged {
        if entry.is_deleted() {
            continue;
        }
        if !seen.insert(entry.key()) {
            return Err(Error::MergeInvariant(format!(
                "duplicate active record for '{}' (issuer {:?})",
                entry.account_name, entry.issuer
            )));
        }
    }
    Ok(())
}
