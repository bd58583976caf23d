//! Repository tests against a real on-disk database with migrations applied.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

use authkeeper_core::accounts::{AccountStore, AccountUpdate, NewAccount};
use authkeeper_core::sync::{merge_accounts, AccountPayload, MergedAccount};
use authkeeper_core::Error;
use authkeeper_storage_sqlite::{init, AccountRepository};

const SECRET: &str = "JBSWY3DPEHPK3PXP";
const OTHER_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

fn new_account(name: &str, issuer: Option<&str>, secret: &str) -> NewAccount {
    NewAccount {
        account_name: name.to_string(),
        issuer: issuer.map(str::to_string),
        secret: secret.to_string(),
        origin: Some("test-device".to_string()),
    }
}

fn payload_of(account: &authkeeper_core::accounts::Account) -> AccountPayload {
    AccountPayload {
        account_name: account.account_name.clone(),
        issuer: account.issuer.clone(),
        secret_key: account.secret.clone(),
    }
}

/// Stamp a full pass: the pushed list is the current active projection, as
/// the orchestrator would have sent it.
async fn mark_all_synced(repo: &AccountRepository, at: chrono::DateTime<Utc>) {
    let pushed = repo.list_active().unwrap().iter().map(payload_of).collect();
    repo.mark_synced(at, pushed).await.unwrap();
}

/// Repository over a fresh temp database, with a counting suffix generator
/// so collision handling is deterministic.
fn setup() -> (TempDir, AccountRepository) {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("accounts.db");
    let (pool, writer) = init(db_path.to_str().expect("utf8 path")).expect("init database");

    let counter = AtomicU32::new(0);
    let repo = AccountRepository::with_suffix_generator(
        pool,
        writer,
        Arc::new(move || format!("s{}", counter.fetch_add(1, Ordering::SeqCst))),
    );
    (dir, repo)
}

#[tokio::test]
async fn insert_and_get_round_trip() {
    let (_dir, repo) = setup();

    let inserted = repo
        .insert(new_account("alice", Some("github"), SECRET))
        .await
        .unwrap();

    let id = inserted.id.unwrap();
    let fetched = repo.get(id).unwrap();
    assert_eq!(fetched.account_name, "alice");
    assert_eq!(fetched.issuer.as_deref(), Some("github"));
    assert_eq!(fetched.secret, SECRET);
    assert_eq!(fetched.origin.as_deref(), Some("test-device"));
    // Token cache is populated at insert.
    assert!(fetched.token.is_some());
    assert!(fetched.sync_at.is_none());
    assert!(!fetched.is_deleted());
}

#[tokio::test]
async fn insert_rejects_empty_input() {
    let (_dir, repo) = setup();

    let err = repo
        .insert(new_account("   ", None, SECRET))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = repo.insert(new_account("alice", None, "")).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn reinserting_identical_account_is_idempotent() {
    let (_dir, repo) = setup();

    let first = repo
        .insert(new_account("alice", Some("github"), SECRET))
        .await
        .unwrap();
    let second = repo
        .insert(new_account("alice", Some("github"), SECRET))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(repo.list_active().unwrap().len(), 1);
}

#[tokio::test]
async fn colliding_insert_gets_suffixed_name() {
    let (_dir, repo) = setup();

    repo.insert(new_account("alice", Some("github"), SECRET))
        .await
        .unwrap();
    let renamed = repo
        .insert(new_account("alice", Some("github"), OTHER_SECRET))
        .await
        .unwrap();

    assert_eq!(renamed.account_name, "alice_s0");
    assert_eq!(repo.list_active().unwrap().len(), 2);
}

#[tokio::test]
async fn same_name_under_other_issuer_does_not_collide() {
    let (_dir, repo) = setup();

    repo.insert(new_account("alice", Some("github"), SECRET))
        .await
        .unwrap();
    let other = repo
        .insert(new_account("alice", Some("gitlab"), OTHER_SECRET))
        .await
        .unwrap();

    assert_eq!(other.account_name, "alice");
}

#[tokio::test]
async fn suffix_exhaustion_fails_loudly() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("accounts.db");
    let (pool, writer) = init(db_path.to_str().unwrap()).unwrap();
    // A generator that always yields the same suffix can never escape an
    // occupied candidate name.
    let repo =
        AccountRepository::with_suffix_generator(pool, writer, Arc::new(|| "x".to_string()));

    repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    repo.insert(new_account("alice_x", None, SECRET)).await.unwrap();

    let err = repo
        .insert(new_account("alice", None, OTHER_SECRET))
        .await
        .unwrap_err();
    match err {
        Error::UniquenessExhausted { name, attempts } => {
            assert_eq!(name, "alice");
            assert_eq!(attempts, 10);
        }
        other => panic!("expected UniquenessExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn bulk_import_skips_invalid_entries() {
    let (_dir, repo) = setup();

    let imported = repo
        .insert_many(vec![
            new_account("alice", Some("github"), SECRET),
            new_account("", None, SECRET),
            new_account("bob", None, ""),
            new_account("carol", None, OTHER_SECRET),
        ])
        .await
        .unwrap();

    let names: Vec<_> = imported.iter().map(|a| a.account_name.clone()).collect();
    assert_eq!(names, vec!["alice", "carol"]);
    assert_eq!(repo.list_active().unwrap().len(), 2);
}

#[tokio::test]
async fn first_rename_records_breadcrumb_later_renames_keep_it() {
    let (_dir, repo) = setup();

    let account = repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    let id = account.id.unwrap();

    let renamed = repo.rename(id, "alice2".to_string()).await.unwrap();
    assert_eq!(renamed.account_name, "alice2");
    assert_eq!(renamed.old_account_name.as_deref(), Some("alice"));
    assert!(renamed.changed_at > account.changed_at);

    // Second rename before any sync: the original breadcrumb survives so the
    // server-side name is still replaced correctly on the next push.
    let renamed = repo.rename(id, "alice3".to_string()).await.unwrap();
    assert_eq!(renamed.account_name, "alice3");
    assert_eq!(renamed.old_account_name.as_deref(), Some("alice"));
}

#[tokio::test]
async fn rename_after_sync_starts_a_fresh_breadcrumb() {
    let (_dir, repo) = setup();

    let account = repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    let id = account.id.unwrap();
    mark_all_synced(&repo, Utc::now() + Duration::seconds(1)).await;

    let renamed = repo.rename(id, "alice2".to_string()).await.unwrap();
    assert_eq!(renamed.old_account_name.as_deref(), Some("alice"));
}

#[tokio::test]
async fn rename_rejects_empty_name_and_missing_id() {
    let (_dir, repo) = setup();

    let err = repo.rename(1, "  ".to_string()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = repo.rename(42, "alice".to_string()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(42)));
}

#[tokio::test]
async fn update_details_recomputes_token() {
    let (_dir, repo) = setup();

    let account = repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    let id = account.id.unwrap();

    let updated = repo
        .update_details(
            id,
            AccountUpdate {
                issuer: Some("github".to_string()),
                secret: Some(OTHER_SECRET.to_string()),
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.issuer.as_deref(), Some("github"));
    assert_eq!(updated.secret, OTHER_SECRET);
    assert_ne!(updated.token, account.token);
    assert!(updated.changed_at > account.changed_at);
}

#[tokio::test]
async fn soft_delete_hides_from_active_but_keeps_the_row() {
    let (_dir, repo) = setup();

    let account = repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    let id = account.id.unwrap();

    repo.soft_delete(id).await.unwrap();

    assert!(repo.list_active().unwrap().is_empty());
    let all = repo.load_all().unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].is_deleted());
}

#[tokio::test]
async fn purge_by_origin_keeps_only_matching_records() {
    let (_dir, repo) = setup();

    repo.insert(new_account("mine", None, SECRET)).await.unwrap();
    let mut foreign = new_account("theirs", None, OTHER_SECRET);
    foreign.origin = Some("other-device".to_string());
    repo.insert(foreign).await.unwrap();
    let mut untagged = new_account("untagged", Some("github"), SECRET);
    untagged.origin = None;
    repo.insert(untagged).await.unwrap();

    let removed = repo
        .purge_by_origin_except("test-device".to_string())
        .await
        .unwrap();

    assert_eq!(removed, 2);
    let remaining = repo.list_active().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].account_name, "mine");
}

#[tokio::test]
async fn refresh_tokens_updates_the_cache_for_the_window() {
    let (_dir, repo) = setup();

    let account = repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    let id = account.id.unwrap();

    // A time far from insertion falls into a different window.
    let later = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    repo.refresh_tokens(later).await.unwrap();

    let refreshed = repo.get(id).unwrap();
    assert!(refreshed.token.is_some());
    assert_ne!(refreshed.token, account.token);
}

#[tokio::test]
async fn apply_merge_inserts_updates_and_tombstones() {
    let (_dir, repo) = setup();

    let alice = repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    let bob = repo.insert(new_account("bob", None, SECRET)).await.unwrap();
    mark_all_synced(&repo, Utc::now()).await;

    // Server: alice got a new secret (newer clock), bob was deleted, carol is
    // new.
    let local = repo.load_all().unwrap();
    let remote = vec![
        AccountPayload {
            account_name: "alice".to_string(),
            issuer: None,
            secret_key: OTHER_SECRET.to_string(),
        },
        AccountPayload {
            account_name: "carol".to_string(),
            issuer: Some("aws".to_string()),
            secret_key: SECRET.to_string(),
        },
    ];
    let server_ts = Utc::now() + Duration::seconds(5);
    let merged = merge_accounts(&local, &remote, Some(server_ts), Utc::now());

    repo.apply_merge(merged).await.unwrap();

    let all = repo.load_all().unwrap();
    assert_eq!(all.len(), 3);

    let alice_row = all
        .iter()
        .find(|a| a.id == alice.id)
        .expect("alice kept her id");
    assert_eq!(alice_row.secret, OTHER_SECRET);
    assert!(!alice_row.is_deleted());

    let bob_row = all.iter().find(|a| a.id == bob.id).expect("bob row kept");
    assert!(bob_row.is_deleted());

    let carol_row = all
        .iter()
        .find(|a| a.account_name == "carol")
        .expect("carol adopted");
    assert_eq!(carol_row.issuer.as_deref(), Some("aws"));
    assert!(carol_row.token.is_some());
}

#[tokio::test]
async fn apply_merge_skips_untouched_rows() {
    let (_dir, repo) = setup();

    let account = repo.insert(new_account("alice", None, SECRET)).await.unwrap();

    let local = repo.load_all().unwrap();
    // Converged state: the merge output equals the stored row.
    let merged = merge_accounts(&local, &[], None, Utc::now());
    repo.apply_merge(merged).await.unwrap();

    let after = repo.get(account.id.unwrap()).unwrap();
    assert_eq!(after.changed_at, account.changed_at);
}

#[tokio::test]
async fn mark_synced_stamps_clears_breadcrumbs_and_purges_tombstones() {
    let (_dir, repo) = setup();

    let alice = repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    let bob = repo.insert(new_account("bob", None, SECRET)).await.unwrap();
    repo.rename(alice.id.unwrap(), "alice2".to_string()).await.unwrap();
    repo.soft_delete(bob.id.unwrap()).await.unwrap();

    let stamp = Utc::now();
    mark_all_synced(&repo, stamp).await;

    let all = repo.load_all().unwrap();
    assert_eq!(all.len(), 1, "tombstone purged after push");
    assert_eq!(all[0].account_name, "alice2");
    assert!(all[0].old_account_name.is_none(), "breadcrumb absorbed");
    assert_eq!(all[0].sync_at, Some(stamp));
}

#[tokio::test]
async fn delete_landing_mid_push_survives_the_stamp() {
    let (_dir, repo) = setup();

    let alice = repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    let bob = repo.insert(new_account("bob", None, SECRET)).await.unwrap();

    // The push carried both accounts; bob is deleted while the request is
    // still in flight.
    let pushed: Vec<_> = repo.list_active().unwrap().iter().map(payload_of).collect();
    repo.soft_delete(bob.id.unwrap()).await.unwrap();

    let stamp = Utc::now();
    repo.mark_synced(stamp, pushed).await.unwrap();

    let all = repo.load_all().unwrap();
    let bob_row = all.iter().find(|a| a.id == bob.id).expect("tombstone kept");
    assert!(bob_row.is_deleted(), "deletion not yet propagated");
    assert!(bob_row.sync_at.is_none());

    let alice_row = all.iter().find(|a| a.id == alice.id).unwrap();
    assert_eq!(alice_row.sync_at, Some(stamp));
}

#[tokio::test]
async fn rename_landing_mid_push_keeps_its_breadcrumb() {
    let (_dir, repo) = setup();

    let alice = repo.insert(new_account("alice", None, SECRET)).await.unwrap();

    let pushed: Vec<_> = repo.list_active().unwrap().iter().map(payload_of).collect();
    repo.rename(alice.id.unwrap(), "alice2".to_string()).await.unwrap();

    repo.mark_synced(Utc::now(), pushed).await.unwrap();

    let row = repo.get(alice.id.unwrap()).unwrap();
    assert_eq!(row.account_name, "alice2");
    assert_eq!(row.old_account_name.as_deref(), Some("alice"));
    assert!(row.sync_at.is_none(), "renamed state was never pushed");
}

#[tokio::test]
async fn secret_edit_landing_mid_push_stays_unstamped() {
    let (_dir, repo) = setup();

    let alice = repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    let bob = repo.insert(new_account("bob", None, SECRET)).await.unwrap();

    let pushed: Vec<_> = repo.list_active().unwrap().iter().map(payload_of).collect();
    repo.update_details(
        alice.id.unwrap(),
        AccountUpdate {
            issuer: None,
            secret: Some(OTHER_SECRET.to_string()),
        },
    )
    .await
    .unwrap();

    let stamp = Utc::now();
    repo.mark_synced(stamp, pushed).await.unwrap();

    let alice_row = repo.get(alice.id.unwrap()).unwrap();
    assert!(alice_row.sync_at.is_none(), "edited secret was never pushed");
    let bob_row = repo.get(bob.id.unwrap()).unwrap();
    assert_eq!(bob_row.sync_at, Some(stamp));
}

#[tokio::test]
async fn apply_merge_rolls_back_on_mid_batch_failure() {
    let (_dir, repo) = setup();

    let alice = repo.insert(new_account("alice", None, SECRET)).await.unwrap();
    repo.insert(new_account("bob", Some("github"), SECRET)).await.unwrap();

    // Second entry collides with bob's unique key, failing the batch after
    // alice's update already executed.
    let now = Utc::now();
    let batch = vec![
        MergedAccount {
            id: alice.id,
            issuer: None,
            account_name: "alice".to_string(),
            old_account_name: None,
            secret: OTHER_SECRET.to_string(),
            deleted_at: None,
            changed_at: now,
            sync_at: None,
            origin: None,
            synced: true,
        },
        MergedAccount {
            id: None,
            issuer: Some("github".to_string()),
            account_name: "bob".to_string(),
            old_account_name: None,
            secret: SECRET.to_string(),
            deleted_at: None,
            changed_at: now,
            sync_at: None,
            origin: None,
            synced: true,
        },
    ];

    let err = repo.apply_merge(batch).await.unwrap_err();
    assert!(matches!(err, Error::Database(_)));

    // Alice's update must have rolled back with the rest of the batch.
    let alice_row = repo.get(alice.id.unwrap()).unwrap();
    assert_eq!(alice_row.secret, SECRET);
}
