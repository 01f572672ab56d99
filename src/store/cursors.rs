//! The sync-cursors family: per (relay, anchor) incremental watermarks.

use nostr_sdk::prelude::*;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::database::{Database, DatabaseError};

/// Latest event timestamp attributed to one relay for one anchor. Only ever
/// advances; used exclusively to bound future queries, never to filter
/// already-cached data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub relay_url: RelayUrl,
    pub anchor: String,
    pub latest_seen: u64,
}

impl sqlx::FromRow<'_, SqliteRow> for SyncCursor {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let relay_url: String = row.try_get("relay_url")?;
        Ok(SyncCursor {
            relay_url: RelayUrl::parse(&relay_url).map_err(|e| sqlx::Error::ColumnDecode {
                index: "relay_url".to_string(),
                source: Box::new(e),
            })?,
            anchor: row.try_get("anchor")?,
            latest_seen: row.try_get::<i64, _>("latest_seen")? as u64,
        })
    }
}

/// Shared lower bound for the next query: one past the *minimum* watermark
/// across the active relay set. One cursor per query trades a bounded
/// re-fetch from the fresher relays for a single shared `since`.
pub fn since_lower_bound(cursors: &[SyncCursor], active: &[RelayUrl]) -> Option<u64> {
    cursors
        .iter()
        .filter(|cursor| active.contains(&cursor.relay_url))
        .map(|cursor| cursor.latest_seen)
        .min()
        .map(|latest| latest + 1)
}

pub(crate) async fn cursors_for_anchor(
    db: &Database,
    anchor: &str,
) -> Result<Vec<SyncCursor>, DatabaseError> {
    let cursors = sqlx::query_as::<_, SyncCursor>("SELECT * FROM sync_cursors WHERE anchor = ?")
        .bind(anchor)
        .fetch_all(&db.pool)
        .await?;
    Ok(cursors)
}

/// Advances a watermark with `max(existing, seen)` semantics; a stale
/// writer can never move it backwards.
pub(crate) async fn advance_cursor(
    db: &Database,
    relay_url: &RelayUrl,
    anchor: &str,
    seen: u64,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO sync_cursors (relay_url, anchor, latest_seen) VALUES (?, ?, ?) \
         ON CONFLICT(relay_url, anchor) DO UPDATE \
         SET latest_seen = MAX(latest_seen, excluded.latest_seen)",
    )
    .bind(relay_url.to_string())
    .bind(anchor)
    .bind(seen as i64)
    .execute(&db.pool)
    .await?;
    Ok(())
}
