//! Cloud synchronization: wire types, gateway contract, merge engine and the
//! sync orchestrator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::Result;

pub mod merge;
pub mod service;

pub use merge::{merge_accounts, verify_converged, MergedAccount};
pub use service::{spawn_periodic, SyncOutcome, SyncService};

/// Default cadence for the periodic sync trigger.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// An account record as held by the identity server. The server keeps no
/// per-record timestamps; only the list-level profile `updatedTime`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPayload {
    pub account_name: String,
    pub issuer: Option<String>,
    pub secret_key: String,
}

impl std::fmt::Debug for AccountPayload {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AccountPayload")
            .field("account_name", &self.account_name)
            .field("issuer", &self.issuer)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// The server's current account list plus its logical clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSnapshot {
    /// Last server-side update to the whole list. `None` when the profile has
    /// never been written or carries an unparseable timestamp; the server is
    /// then never considered "strictly newer".
    pub updated_at: Option<DateTime<Utc>>,
    pub accounts: Vec<AccountPayload>,
}

/// Opaque credentials handed over by the login collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub owner: String,
    pub name: String,
    pub access_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Sync status surfaced to status indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_error: Option<String>,
}

/// Contract for the remote account gateway.
#[async_trait]
pub trait AccountGateway: Send + Sync {
    /// Fetch the server-held account list and its logical clock.
    async fn fetch_accounts(&self, credentials: &Credentials) -> Result<RemoteSnapshot>;

    /// Replace the server-held account list. Full replacement: callers always
    /// send the complete converged set.
    async fn push_accounts(
        &self,
        credentials: &Credentials,
        accounts: Vec<AccountPayload>,
    ) -> Result<()>;
}

/// Cached user/session state holder, cleared when the server reports an
/// expired token so the user is forced to re-authenticate.
pub trait SessionStore: Send + Sync {
    fn clear_session(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_with_server_field_names() {
        let payload = AccountPayload {
            account_name: "alice".to_string(),
            issuer: Some("github".to_string()),
            secret_key: "JBSWY3DPEHPK3PXP".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "accountName": "alice",
                "issuer": "github",
                "secretKey": "JBSWY3DPEHPK3PXP",
            })
        );
    }

    #[test]
    fn debug_redacts_secrets_and_tokens() {
        let payload = AccountPayload {
            account_name: "alice".to_string(),
            issuer: None,
            secret_key: "JBSWY3DPEHPK3PXP".to_string(),
        };
        assert!(!format!("{payload:?}").contains("JBSWY3DPEHPK3PXP"));

        let credentials = Credentials {
            owner: "built-in".to_string(),
            name: "admin".to_string(),
            access_token: "very-secret".to_string(),
        };
        assert!(!format!("{credentials:?}").contains("very-secret"));
    }
}
