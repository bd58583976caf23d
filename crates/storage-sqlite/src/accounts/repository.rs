//! SQLite-backed account repository.
//!
//! Reads use pooled connections directly; every mutation is a job on the
//! write actor, so it runs inside an immediate transaction on the single
//! writer thread.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

use authkeeper_core::accounts::{Account, AccountKey, AccountStore, AccountUpdate, NewAccount};
use authkeeper_core::sync::{AccountPayload, MergedAccount};
use authkeeper_core::totp::display_token;
use authkeeper_core::{Error, Result};

use crate::accounts::model::{format_ts, parse_ts, AccountDB, InsertAccountDB};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::accounts;
use crate::schema::accounts::dsl::*;

/// Bound on the collision-suffix loop before insertion fails loudly.
const MAX_INSERT_ATTEMPTS: u32 = 10;

const SUFFIX_LEN: usize = 3;

type SuffixGenerator = Arc<dyn Fn() -> String + Send + Sync>;

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

pub struct AccountRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
    suffix: SuffixGenerator,
}

impl AccountRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self::with_suffix_generator(pool, writer, Arc::new(random_suffix))
    }

    /// Same as [`new`](Self::new) but with an injected suffix source, so
    /// collision handling is deterministic under test.
    pub fn with_suffix_generator(
        pool: Arc<DbPool>,
        writer: WriteHandle,
        suffix: SuffixGenerator,
    ) -> Self {
        Self {
            pool,
            writer,
            suffix,
        }
    }

    /// Insert one record. Re-inserting an identical `(name, issuer, secret)`
    /// is a no-op returning the existing record; a collision with a different
    /// secret gets a deterministically suffixed name instead.
    pub async fn insert(&self, new_account: NewAccount) -> Result<Account> {
        validate_new(&new_account)?;
        let suffix = Arc::clone(&self.suffix);
        self.writer
            .exec(move |conn| insert_one(conn, &new_account, &suffix, Utc::now()))
            .await
    }

    /// Bulk import path: one transaction, entries with an empty name or
    /// secret are skipped rather than failing the batch.
    pub async fn insert_many(&self, batch: Vec<NewAccount>) -> Result<Vec<Account>> {
        let suffix = Arc::clone(&self.suffix);
        self.writer
            .exec(move |conn| {
                let now = Utc::now();
                let mut inserted = Vec::with_capacity(batch.len());
                for entry in &batch {
                    if validate_new(entry).is_err() {
                        debug!("skipping import entry with empty name or secret");
                        continue;
                    }
                    inserted.push(insert_one(conn, entry, &suffix, now)?);
                }
                Ok(inserted)
            })
            .await
    }

    /// Rename a record. The pre-rename name is recorded into
    /// `old_account_name` when no breadcrumb is pending, or when the current
    /// name has already been absorbed by the server (a fresh rename then
    /// supersedes the stale breadcrumb).
    pub async fn rename(&self, account_id: i32, new_name: String) -> Result<Account> {
        if new_name.trim().is_empty() {
            return Err(Error::validation("account name must not be empty"));
        }
        self.writer
            .exec(move |conn| {
                let row = load_row(conn, account_id)?;
                let breadcrumb = if row.old_account_name.is_none() || synced_since_change(&row)? {
                    Some(row.account_name.clone())
                } else {
                    row.old_account_name.clone()
                };

                let updated = diesel::update(accounts.find(account_id))
                    .set((
                        account_name.eq(new_name),
                        old_account_name.eq(breadcrumb),
                        changed_at.eq(format_ts(Utc::now())),
                    ))
                    .returning(AccountDB::as_returning())
                    .get_result::<AccountDB>(conn)
                    .map_err(StorageError::from)?;
                Account::try_from(updated)
            })
            .await
    }

    /// Apply a partial edit; the cached token is recomputed when the secret
    /// changes.
    pub async fn update_details(&self, account_id: i32, update: AccountUpdate) -> Result<Account> {
        self.writer
            .exec(move |conn| {
                let row = load_row(conn, account_id)?;
                let new_issuer = update.issuer.clone().or(row.issuer);
                let new_secret = update.secret.clone().unwrap_or(row.secret);
                let now = Utc::now();

                let updated = diesel::update(accounts.find(account_id))
                    .set((
                        issuer.eq(new_issuer),
                        token.eq(Some(display_token(&new_secret, now))),
                        secret.eq(new_secret),
                        changed_at.eq(format_ts(now)),
                    ))
                    .returning(AccountDB::as_returning())
                    .get_result::<AccountDB>(conn)
                    .map_err(StorageError::from)?;
                Account::try_from(updated)
            })
            .await
    }

    /// Tombstone a record: it disappears from active listings but survives
    /// until the deletion has propagated.
    pub async fn soft_delete(&self, account_id: i32) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let _ = load_row(conn, account_id)?;
                let now = format_ts(Utc::now());
                diesel::update(accounts.find(account_id))
                    .set((deleted_at.eq(Some(now.clone())), changed_at.eq(now)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    pub fn get(&self, account_id: i32) -> Result<Account> {
        let mut conn = get_connection(&self.pool)?;
        Account::try_from(load_row(&mut conn, account_id)?)
    }

    /// Active records in insertion order; what the token list renders.
    pub fn list_active(&self) -> Result<Vec<Account>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = accounts
            .filter(deleted_at.is_null())
            .order(id.asc())
            .load::<AccountDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(Account::try_from).collect()
    }

    fn load_all_impl(&self) -> Result<Vec<Account>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = accounts
            .order(id.asc())
            .load::<AccountDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(Account::try_from).collect()
    }

    /// Logout cleanup: hard-delete every record whose origin is missing or
    /// differs from `keep_origin`. Destructive, no tombstones.
    pub async fn purge_by_origin_except(&self, keep_origin: String) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let removed = diesel::delete(
                    accounts.filter(origin.is_null().or(origin.ne(keep_origin.clone()))),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                debug!("purged {removed} records by origin");
                Ok(removed)
            })
            .await
    }

    /// Recompute the cached token column for all active records at `now`.
    pub async fn refresh_tokens(&self, now: DateTime<Utc>) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let rows = accounts
                    .filter(deleted_at.is_null())
                    .load::<AccountDB>(conn)
                    .map_err(StorageError::from)?;
                for row in rows {
                    let fresh = display_token(&row.secret, now);
                    if row.token.as_deref() != Some(fresh.as_str()) {
                        diesel::update(accounts.find(row.id))
                            .set(token.eq(Some(fresh)))
                            .execute(conn)
                            .map_err(StorageError::from)?;
                    }
                }
                Ok(())
            })
            .await
    }

    fn apply_merge_job(conn: &mut SqliteConnection, merged: Vec<MergedAccount>) -> Result<()> {
        let now = Utc::now();
        for entry in merged {
            match entry.id {
                Some(entry_id) => {
                    let Some(row) = accounts
                        .find(entry_id)
                        .first::<AccountDB>(conn)
                        .optional()
                        .map_err(StorageError::from)?
                    else {
                        insert_merged(conn, &entry)?;
                        continue;
                    };

                    if row_matches(&row, &entry) {
                        continue;
                    }

                    diesel::update(accounts.find(entry_id))
                        .set((
                            issuer.eq(entry.issuer.clone()),
                            account_name.eq(entry.account_name.clone()),
                            old_account_name.eq(entry.old_account_name.clone()),
                            token.eq(Some(display_token(&entry.secret, now))),
                            secret.eq(entry.secret.clone()),
                            deleted_at.eq(entry.deleted_at.map(format_ts)),
                            changed_at.eq(format_ts(now)),
                        ))
                        .execute(conn)
                        .map_err(StorageError::from)?;
                }
                None => {
                    insert_merged(conn, &entry)?;
                }
            }
        }
        Ok(())
    }

    fn mark_synced_job(
        conn: &mut SqliteConnection,
        at: DateTime<Utc>,
        pushed: Vec<AccountPayload>,
    ) -> Result<()> {
        let mut pushed_by_key: HashMap<AccountKey, String> = HashMap::with_capacity(pushed.len());
        for payload in pushed {
            pushed_by_key.insert(
                AccountKey::new(payload.account_name.clone(), payload.issuer.as_deref()),
                payload.secret_key,
            );
        }

        let rows = accounts
            .load::<AccountDB>(conn)
            .map_err(StorageError::from)?;
        let mut purged = 0usize;
        for row in rows {
            let key = AccountKey::new(row.account_name.clone(), row.issuer.as_deref());
            match (pushed_by_key.get(&key), row.deleted_at.is_some()) {
                (Some(_), true) => {
                    // Tombstoned while the push was in flight: the server
                    // still lists this account, so the deletion has not
                    // propagated yet. Kept for the next pass.
                }
                (Some(pushed_secret), false) => {
                    // Stamp only rows whose state the push carried; a secret
                    // edited mid-pass stays unstamped.
                    if row.secret == *pushed_secret {
                        diesel::update(accounts.find(row.id))
                            .set((
                                sync_at.eq(Some(format_ts(at))),
                                old_account_name.eq(None::<String>),
                            ))
                            .execute(conn)
                            .map_err(StorageError::from)?;
                    }
                }
                (None, true) => {
                    // Tombstone the acknowledged list does not carry: the
                    // deletion has propagated (or the server never saw the
                    // record); safe to remove physically.
                    diesel::delete(accounts.find(row.id))
                        .execute(conn)
                        .map_err(StorageError::from)?;
                    purged += 1;
                }
                (None, false) => {
                    // Created or renamed mid-pass; the next pass pushes it.
                }
            }
        }
        if purged > 0 {
            debug!("purged {purged} tombstones after push");
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for AccountRepository {
    fn load_all(&self) -> Result<Vec<Account>> {
        self.load_all_impl()
    }

    async fn apply_merge(&self, merged: Vec<MergedAccount>) -> Result<()> {
        self.writer
            .exec(move |conn| Self::apply_merge_job(conn, merged))
            .await
    }

    async fn mark_synced(&self, at: DateTime<Utc>, pushed: Vec<AccountPayload>) -> Result<()> {
        self.writer
            .exec(move |conn| Self::mark_synced_job(conn, at, pushed))
            .await
    }
}

fn validate_new(new_account: &NewAccount) -> Result<()> {
    if new_account.account_name.trim().is_empty() {
        return Err(Error::validation("account name must not be empty"));
    }
    if new_account.secret.trim().is_empty() {
        return Err(Error::validation("secret must not be empty"));
    }
    Ok(())
}

fn load_row(conn: &mut SqliteConnection, account_id: i32) -> Result<AccountDB> {
    accounts
        .find(account_id)
        .first::<AccountDB>(conn)
        .optional()
        .map_err(StorageError::from)?
        .ok_or(Error::NotFound(account_id))
}

/// True when the row's current name has already round-tripped to the server.
fn synced_since_change(row: &AccountDB) -> Result<bool> {
    let Some(sync_raw) = row.sync_at.as_deref() else {
        return Ok(false);
    };
    Ok(parse_ts(sync_raw)? >= parse_ts(&row.changed_at)?)
}

fn find_by_key(
    conn: &mut SqliteConnection,
    name: &str,
    key_issuer: Option<&str>,
) -> Result<Option<AccountDB>> {
    let mut query = accounts.into_boxed();
    query = match key_issuer {
        Some(value) => query.filter(issuer.eq(value.to_string())),
        None => query.filter(issuer.is_null()),
    };
    query
        .filter(account_name.eq(name.to_string()))
        .first::<AccountDB>(conn)
        .optional()
        .map_err(|e| StorageError::from(e).into())
}

/// Shared insert path with the bounded collision-suffix loop.
fn insert_one(
    conn: &mut SqliteConnection,
    new_account: &NewAccount,
    suffix: &SuffixGenerator,
    now: DateTime<Utc>,
) -> Result<Account> {
    let base = new_account.account_name.trim();

    // Re-adding the exact same account is a no-op.
    if let Some(existing) = find_by_key(conn, base, new_account.issuer.as_deref())? {
        if existing.deleted_at.is_none() && existing.secret == new_account.secret {
            return Account::try_from(existing);
        }
    }

    let mut candidate = base.to_string();
    for attempt in 0..MAX_INSERT_ATTEMPTS {
        if find_by_key(conn, &candidate, new_account.issuer.as_deref())?.is_none() {
            let row = InsertAccountDB {
                issuer: new_account.issuer.clone(),
                account_name: candidate,
                old_account_name: None,
                secret: new_account.secret.clone(),
                token: Some(display_token(&new_account.secret, now)),
                deleted_at: None,
                changed_at: format_ts(now),
                sync_at: None,
                origin: new_account.origin.clone(),
            };
            let inserted = diesel::insert_into(accounts::table)
                .values(&row)
                .returning(AccountDB::as_returning())
                .get_result::<AccountDB>(conn)
                .map_err(StorageError::from)?;
            if attempt > 0 {
                debug!("resolved name collision after {attempt} attempts");
            }
            return Account::try_from(inserted);
        }
        candidate = format!("{base}_{}", (suffix)());
    }

    Err(Error::UniquenessExhausted {
        name: base.to_string(),
        attempts: MAX_INSERT_ATTEMPTS,
    })
}

fn insert_merged(conn: &mut SqliteConnection, entry: &MergedAccount) -> Result<()> {
    let row = InsertAccountDB {
        issuer: entry.issuer.clone(),
        account_name: entry.account_name.clone(),
        old_account_name: entry.old_account_name.clone(),
        secret: entry.secret.clone(),
        token: Some(display_token(&entry.secret, entry.changed_at)),
        deleted_at: entry.deleted_at.map(format_ts),
        changed_at: format_ts(entry.changed_at),
        sync_at: entry.sync_at.map(format_ts),
        origin: entry.origin.clone(),
    };
    diesel::insert_into(accounts::table)
        .values(&row)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

/// Field comparison used to skip no-op merge writes, so `changed_at` is only
/// bumped on rows the merge actually rewrote.
fn row_matches(row: &AccountDB, entry: &MergedAccount) -> bool {
    row.issuer == entry.issuer
        && row.account_name == entry.account_name
        && row.old_account_name == entry.old_account_name
        && row.secret == entry.secret
        && row.deleted_at.is_some() == entry.deleted_at.is_some()
}
