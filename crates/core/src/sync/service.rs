//! Sync orchestrator: drives one full reconciliation pass and the periodic
//! background trigger, with an at-most-one-pass-in-flight guard.

use chrono::Utc;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::accounts::AccountStore;
use crate::errors::Result;
use crate::sync::merge::{merge_accounts, verify_converged};
use crate::sync::{AccountGateway, AccountPayload, Credentials, SessionStore, SyncStatus};

/// Result of requesting a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A pass ran to completion (successfully or not; failures are recorded
    /// in the status, not returned here).
    Completed,
    /// Another pass was already in flight; this request was dropped.
    AlreadyRunning,
}

/// Coordinates the local store, the remote gateway and the merge engine.
///
/// Cheap to clone behind `Arc`; all mutable state is the in-flight flag and
/// the last-error slot.
pub struct SyncService<S, G, P> {
    store: Arc<S>,
    gateway: Arc<G>,
    session: Arc<P>,
    in_flight: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl<S, G, P> SyncService<S, G, P>
where
    S: AccountStore,
    G: AccountGateway,
    P: SessionStore,
{
    pub fn new(store: Arc<S>, gateway: Arc<G>, session: Arc<P>) -> Self {
        Self {
            store,
            gateway,
            session,
            in_flight: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    /// Run one reconciliation pass, unless one is already running.
    ///
    /// Failures do not propagate: the pass logs, records the error in the
    /// status and, for authentication failures, clears the cached session.
    pub async fn sync(&self, credentials: &Credentials) -> SyncOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync already in flight, skipping trigger");
            return SyncOutcome::AlreadyRunning;
        }

        let result = self.run_cycle(credentials).await;
        match &result {
            Ok(()) => {
                if let Ok(mut slot) = self.last_error.lock() {
                    *slot = None;
                }
            }
            Err(err) => {
                error!("sync pass failed: {err}");
                if err.requires_reauth() {
                    info!("access token rejected, clearing cached session");
                    self.session.clear_session();
                }
                if let Ok(mut slot) = self.last_error.lock() {
                    *slot = Some(err.to_string());
                }
            }
        }

        self.in_flight.store(false, Ordering::Release);
        SyncOutcome::Completed
    }

    async fn run_cycle(&self, credentials: &Credentials) -> Result<()> {
        let local = self.store.load_all()?;
        let snapshot = self.gateway.fetch_accounts(credentials).await?;

        let merged = merge_accounts(&local, &snapshot.accounts, snapshot.updated_at, Utc::now());
        verify_converged(&merged)?;

        let to_push: Vec<AccountPayload> = merged
            .iter()
            .filter(|entry| !entry.is_deleted())
            .map(|entry| entry.payload())
            .collect();

        self.store.apply_merge(merged).await?;

        if lists_differ(&to_push, &snapshot.accounts) {
            debug!("pushing {} accounts to server", to_push.len());
            self.gateway.push_accounts(credentials, to_push.clone()).await?;
        } else {
            debug!("server already converged, skipping push");
        }

        // The server now holds exactly `to_push` (pushed or already there);
        // bookkeeping is scoped to it so mutations that landed while the push
        // was in flight carry over to the next pass.
        self.store.mark_synced(Utc::now(), to_push).await?;
        Ok(())
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn clear_last_error(&self) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = None;
        }
    }

    /// Current status snapshot for UI indicators.
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_syncing: self.is_syncing(),
            last_error: self.last_error(),
        }
    }
}

/// Order-insensitive comparison of the local active projection against the
/// server's list.
fn lists_differ(local: &[AccountPayload], remote: &[AccountPayload]) -> bool {
    if local.len() != remote.len() {
        return true;
    }
    let mut local_sorted = local.to_vec();
    let mut remote_sorted = remote.to_vec();
    local_sorted.sort();
    remote_sorted.sort();
    local_sorted != remote_sorted
}

/// Spawn the periodic background sync. Ticks without credentials are skipped;
/// ticks arriving while a pass is running are dropped by the in-flight guard.
pub fn spawn_periodic<S, G, P, F>(
    service: Arc<SyncService<S, G, P>>,
    credentials: F,
    interval: Duration,
) -> JoinHandle<()>
where
    S: AccountStore + 'static,
    G: AccountGateway + 'static,
    P: SessionStore + 'static,
    F: Fn() -> Option<Credentials> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(creds) = credentials() else {
                debug!("no active session, skipping periodic sync");
                continue;
            };
            service.sync(&creds).await;
        }
    })
}
