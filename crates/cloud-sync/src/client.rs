//! HTTP client for the identity server that stores the account list inside
//! the user profile.
//!
//! The server exposes a generic user API rather than a dedicated account
//! endpoint: the list lives in the profile's `mfaAccounts` field and the
//! profile's `updatedTime` doubles as the list-level logical clock. Writes are
//! read-modify-write on the whole profile so unrelated fields survive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;

use authkeeper_core::sync::{AccountGateway, AccountPayload, Credentials, RemoteSnapshot};

use crate::error::{CloudSyncError, Result};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Response envelope used by every server endpoint.
#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Identity claims returned by the userinfo endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "preferred_username")]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Client for the identity server's user API.
#[derive(Debug, Clone)]
pub struct CloudSyncClient {
    client: reqwest::Client,
    base_url: String,
}

impl CloudSyncClient {
    /// Create a client for `server_url` with the default request timeout.
    pub fn new(server_url: &str) -> Self {
        Self::with_timeout(server_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(server_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    fn user_url(&self, endpoint: &str, credentials: &Credentials) -> String {
        format!(
            "{}/api/{}?id={}/{}",
            self.base_url,
            endpoint,
            credentials.owner,
            urlencoding::encode(&credentials.name)
        )
    }

    fn headers(&self, token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| CloudSyncError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    /// Parse the response envelope, surfacing application-level errors carried
    /// in an HTTP 200.
    async fn parse_envelope(response: reqwest::Response) -> Result<serde_json::Value> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            debug!("API response error ({status})");
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(CloudSyncError::auth(format!("Request rejected: {body}")));
            }
            return Err(CloudSyncError::api(status.as_u16(), body));
        }

        let envelope: ApiEnvelope = serde_json::from_str(&body)
            .map_err(|e| CloudSyncError::protocol(format!("unexpected response body: {e}")))?;

        if envelope.status.as_deref() == Some("error") {
            let message = envelope.msg.unwrap_or_else(|| "unknown server error".to_string());
            if is_token_error(&message) {
                return Err(CloudSyncError::auth(message));
            }
            return Err(CloudSyncError::api(status.as_u16(), message));
        }

        envelope
            .data
            .ok_or_else(|| CloudSyncError::protocol("response envelope has no data field"))
    }

    /// Fetch the full user profile; the write path round-trips it.
    async fn fetch_profile(&self, credentials: &Credentials) -> Result<serde_json::Value> {
        let url = self.user_url("get-user", credentials);
        let response = self
            .client
            .get(&url)
            .headers(self.headers(&credentials.access_token)?)
            .send()
            .await?;
        Self::parse_envelope(response).await
    }

    /// Fetch the server-held account list and its logical clock.
    pub async fn get_accounts(&self, credentials: &Credentials) -> Result<RemoteSnapshot> {
        let profile = self.fetch_profile(credentials).await?;
        Ok(snapshot_from_profile(&profile))
    }

    /// Replace the server-held account list, preserving every other profile
    /// field via a read-modify-write of the whole profile.
    pub async fn update_accounts(
        &self,
        credentials: &Credentials,
        accounts: Vec<AccountPayload>,
    ) -> Result<()> {
        let mut profile = self.fetch_profile(credentials).await?;

        let payload = serde_json::to_value(&accounts)
            .map_err(|e| CloudSyncError::protocol(format!("cannot encode accounts: {e}")))?;
        match profile.as_object_mut() {
            Some(object) => {
                object.insert("mfaAccounts".to_string(), payload);
            }
            None => {
                return Err(CloudSyncError::protocol("user profile is not an object"));
            }
        }

        let url = self.user_url("update-user", credentials);
        debug!("pushing account list to {url}");
        let response = self
            .client
            .post(&url)
            .headers(self.headers(&credentials.access_token)?)
            .json(&profile)
            .send()
            .await?;

        Self::parse_envelope(response).await?;
        Ok(())
    }

    /// Fetch the authenticated user's identity claims.
    pub async fn get_user_info(&self, access_token: &str) -> Result<UserInfo> {
        let url = format!("{}/api/userinfo", self.base_url);
        let response = self
            .client
            .get(&url)
            .headers(self.headers(access_token)?)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CloudSyncError::auth("Access token rejected"));
        }
        if !status.is_success() {
            let body = response.text().await?;
            return Err(CloudSyncError::api(status.as_u16(), body));
        }
        response
            .json::<UserInfo>()
            .await
            .map_err(|e| CloudSyncError::protocol(format!("unexpected userinfo body: {e}")))
    }
}

/// Server messages that mean the cached token is no longer usable.
fn is_token_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("token")
        && (lowered.contains("expired") || lowered.contains("invalid") || lowered.contains("exist"))
}

/// Project the profile document onto the snapshot the merge engine consumes.
/// Missing or unparseable fields degrade to "server has nothing newer".
fn snapshot_from_profile(profile: &serde_json::Value) -> RemoteSnapshot {
    let updated_at = profile
        .get("updatedTime")
        .and_then(|v| v.as_str())
        .and_then(parse_server_time);

    let accounts = profile
        .get("mfaAccounts")
        .cloned()
        .and_then(|v| serde_json::from_value::<Vec<AccountPayload>>(v).ok())
        .unwrap_or_default();

    RemoteSnapshot {
        updated_at,
        accounts,
    }
}

fn parse_server_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl AccountGateway for CloudSyncClient {
    async fn fetch_accounts(
        &self,
        credentials: &Credentials,
    ) -> authkeeper_core::Result<RemoteSnapshot> {
        self.get_accounts(credentials).await.map_err(Into::into)
    }

    async fn push_accounts(
        &self,
        credentials: &Credentials,
        accounts: Vec<AccountPayload>,
    ) -> authkeeper_core::Result<()> {
        self.update_accounts(credentials, accounts)
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn creds() -> Credentials {
        Credentials {
            owner: "built-in".to_string(),
            name: "alice smith".to_string(),
            access_token: "token".to_string(),
        }
    }

    #[test]
    fn user_url_encodes_the_name() {
        let client = CloudSyncClient::new("https://door.example.com/");
        assert_eq!(
            client.user_url("get-user", &creds()),
            "https://door.example.com/api/get-user?id=built-in/alice%20smith"
        );
    }

    #[test]
    fn trailing_slashes_are_trimmed_once() {
        let client = CloudSyncClient::new("https://door.example.com///");
        assert_eq!(
            client.user_url("update-user", &creds()),
            "https://door.example.com/api/update-user?id=built-in/alice%20smith"
        );
    }

    #[test]
    fn snapshot_parses_clock_and_accounts() {
        let profile = serde_json::json!({
            "owner": "built-in",
            "name": "alice",
            "updatedTime": "2026-03-01T10:15:00Z",
            "mfaAccounts": [
                {"accountName": "alice", "issuer": "github", "secretKey": "JBSWY3DPEHPK3PXP"},
                {"accountName": "bob", "issuer": null, "secretKey": "GEZDGNBVGY3TQOJQ"},
            ],
        });

        let snapshot = snapshot_from_profile(&profile);
        assert_eq!(
            snapshot.updated_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap())
        );
        assert_eq!(snapshot.accounts.len(), 2);
        assert_eq!(snapshot.accounts[0].account_name, "alice");
        assert_eq!(snapshot.accounts[0].issuer.as_deref(), Some("github"));
        assert_eq!(snapshot.accounts[1].issuer, None);
    }

    #[test]
    fn missing_accounts_field_means_empty_list() {
        let profile = serde_json::json!({"updatedTime": "2026-03-01T10:15:00Z"});
        let snapshot = snapshot_from_profile(&profile);
        assert!(snapshot.accounts.is_empty());
        assert!(snapshot.updated_at.is_some());
    }

    #[test]
    fn unparseable_clock_degrades_to_none() {
        let profile = serde_json::json!({
            "updatedTime": "not a timestamp",
            "mfaAccounts": [],
        });
        assert_eq!(snapshot_from_profile(&profile).updated_at, None);

        let profile = serde_json::json!({"mfaAccounts": []});
        assert_eq!(snapshot_from_profile(&profile).updated_at, None);
    }

    #[test]
    fn token_error_messages_are_recognized() {
        assert!(is_token_error("Access token has expired"));
        assert!(is_token_error("token is invalid"));
        assert!(is_token_error("the token does not exist"));
        assert!(!is_token_error("user not found"));
        assert!(!is_token_error("internal server error"));
    }

    #[tokio::test]
    async fn envelope_error_status_becomes_api_or_auth_error() {
        // Parse the envelope shape directly; network-level behavior is
        // covered by the orchestrator tests with fake gateways.
        let envelope: ApiEnvelope = serde_json::from_str(
            r#"{"status":"error","msg":"Access token has expired","data":null}"#,
        )
        .unwrap();
        assert_eq!(envelope.status.as_deref(), Some("error"));
        assert!(is_token_error(envelope.msg.as_deref().unwrap()));

        let envelope: ApiEnvelope =
            serde_json::from_str(r#"{"status":"ok","msg":"","data":{"name":"alice"}}"#).unwrap();
        assert_eq!(envelope.status.as_deref(), Some("ok"));
        assert!(envelope.data.is_some());
    }
}
