//! Database model for account records. Timestamps are stored as RFC 3339
//! TEXT columns and converted at the boundary.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use authkeeper_core::accounts::Account;
use authkeeper_core::{Error, Result};

#[derive(Queryable, Identifiable, AsChangeset, Selectable, Clone)]
#[diesel(table_name = crate::schema::accounts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AccountDB {
    pub id: i32,
    pub issuer: Option<String>,
    pub account_name: String,
    pub old_account_name: Option<String>,
    pub secret: String,
    pub token: Option<String>,
    pub deleted_at: Option<String>,
    pub changed_at: String,
    pub sync_at: Option<String>,
    pub origin: Option<String>,
}

impl std::fmt::Debug for AccountDB {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AccountDB")
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

/// Insertable row without the autoincrement id.
#[derive(Insertable, Clone)]
#[diesel(table_name = crate::schema::accounts)]
pub struct InsertAccountDB {
    pub issuer: Option<String>,
    pub account_name: String,
    pub old_account_name: Option<String>,
    pub secret: String,
    pub token: Option<String>,
    pub deleted_at: Option<String>,
    pub changed_at: String,
    pub sync_at: Option<String>,
    pub origin: Option<String>,
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("Invalid timestamp '{raw}': {e}")))
}

fn parse_ts_opt(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

impl TryFrom<AccountDB> for Account {
    type Error = Error;

    fn try_from(row: AccountDB) -> Result<Account> {
        Ok(Account {
            id: Some(row.id),
            issuer: row.issuer,
            account_name: row.account_name,
            old_account_name: row.old_account_name,
            secret: row.secret,
            token: row.token,
            deleted_at: parse_ts_opt(row.deleted_at.as_deref())?,
            changed_at: parse_ts(&row.changed_at)?,
            sync_at: parse_ts_opt(row.sync_at.as_deref())?,
            origin: row.origin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row() -> AccountDB {
        AccountDB {
            id: 1,
            issuer: Some("github".to_string()),
            account_name: "alice".to_string(),
            old_account_name: None,
            secret: "JBSWY3DPEHPK3PXP".to_string(),
            token: Some("123456".to_string()),
            deleted_at: None,
            changed_at: "2026-03-01T10:15:00+00:00".to_string(),
            sync_at: Some("2026-03-01T09:00:00+00:00".to_string()),
            origin: None,
        }
    }

    #[test]
    fn row_converts_with_parsed_timestamps() {
        let account = Account::try_from(row()).unwrap();
        assert_eq!(account.id, Some(1));
        assert_eq!(
            account.changed_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap()
        );
        assert!(account.sync_at.is_some());
        assert!(account.deleted_at.is_none());
    }

    #[test]
    fn malformed_timestamp_is_a_database_error() {
        let mut bad = row();
        bad.changed_at = "yesterday".to_string();
        assert!(matches!(
            Account::try_from(bad),
            Err(Error::Database(_))
        ));
    }

    #[test]
    fn timestamps_round_trip_through_text() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();
        assert_eq!(parse_ts(&format_ts(ts)).unwrap(), ts);
    }

    #[test]
    fn db_debug_redacts_secret() {
        let rendered = format!("{:?}", row());
        assert!(!rendered.contains("JBSWY3DPEHPK3PXP"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
