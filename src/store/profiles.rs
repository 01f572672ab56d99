//! The profiles family: author metadata with refresh bookkeeping.

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::database::{Database, DatabaseError};

/// Profiles older than this are refreshed on the next sync; anything
/// fresher is served from cache to avoid refetch storms.
pub const PROFILE_STALE_AFTER_SECS: u64 = 6 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub pubkey: PublicKey,
    pub display_name: Option<String>,
    pub picture_url: Option<String>,
    /// Timestamp of the metadata event this row came from.
    pub metadata_at: u64,
    pub last_checked_at: u64,
}

impl sqlx::FromRow<'_, SqliteRow> for ProfileRecord {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let pubkey: String = row.try_get("pubkey")?;
        Ok(ProfileRecord {
            pubkey: PublicKey::parse(&pubkey).map_err(|e| sqlx::Error::ColumnDecode {
                index: "pubkey".to_string(),
                source: Box::new(e),
            })?,
            display_name: row.try_get("display_name")?,
            picture_url: row.try_get("picture_url")?,
            metadata_at: row.try_get::<i64, _>("metadata_at")? as u64,
            last_checked_at: row.try_get::<i64, _>("last_checked_at")? as u64,
        })
    }
}

pub(crate) async fn find_profile(
    db: &Database,
    pubkey: &PublicKey,
) -> Result<Option<ProfileRecord>, DatabaseError> {
    let record = sqlx::query_as::<_, ProfileRecord>("SELECT * FROM profiles WHERE pubkey = ?")
        .bind(pubkey.to_hex())
        .fetch_optional(&db.pool)
        .await?;
    Ok(record)
}

/// Filters `authors` down to those with no profile row or one last checked
/// more than the staleness window ago.
pub(crate) async fn stale_profiles(
    db: &Database,
    authors: &[PublicKey],
    now: u64,
) -> Result<Vec<PublicKey>, DatabaseError> {
    let threshold = now.saturating_sub(PROFILE_STALE_AFTER_SECS);
    let mut stale = Vec::new();
    for author in authors {
        match find_profile(db, author).await? {
            Some(profile) if profile.last_checked_at >= threshold => {}
            _ => stale.push(*author),
        }
    }
    Ok(stale)
}

/// Applies a freshly fetched profile. A newer `metadata_at` wins wholesale;
/// an equal-or-older one only bumps `last_checked_at`.
pub(crate) async fn apply_profile(
    db: &Database,
    incoming: &ProfileRecord,
) -> Result<bool, DatabaseError> {
    let existing = find_profile(db, &incoming.pubkey).await?;
    match existing {
        Some(current) if incoming.metadata_at <= current.metadata_at => {
            sqlx::query("UPDATE profiles SET last_checked_at = ? WHERE pubkey = ?")
                .bind(incoming.last_checked_at as i64)
                .bind(incoming.pubkey.to_hex())
                .execute(&db.pool)
                .await?;
            Ok(false)
        }
        _ => {
            sqlx::query(
                "INSERT OR REPLACE INTO profiles \
                 (pubkey, display_name, picture_url, metadata_at, last_checked_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(incoming.pubkey.to_hex())
            .bind(&incoming.display_name)
            .bind(&incoming.picture_url)
            .bind(incoming.metadata_at as i64)
            .bind(incoming.last_checked_at as i64)
            .execute(&db.pool)
            .await?;
            Ok(true)
        }
    }
}

/// Records a completed check for authors that yielded no metadata, so the
/// next sync doesn't refetch them immediately.
pub(crate) async fn touch_profiles(
    db: &Database,
    pubkeys: &[PublicKey],
    now: u64,
) -> Result<(), DatabaseError> {
    let mut tx = db.pool.begin().await?;
    for pubkey in pubkeys {
        sqlx::query(
            "INSERT INTO profiles (pubkey, metadata_at, last_checked_at) VALUES (?, 0, ?) \
             ON CONFLICT(pubkey) DO UPDATE SET last_checked_at = excluded.last_checked_at",
        )
        .bind(pubkey.to_hex())
        .bind(now as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}
