//! The messages family: normalized comment/content records.

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::database::{Database, DatabaseError};

/// Message kinds the engine stores. Everything else is dropped at the
/// normalization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoteKind {
    /// Ordinary comment (kind 1).
    Comment,
    /// Highlight excerpt (kind 9802).
    Highlight,
    /// Long-form article (kind 30023), the root of addressable threads.
    Article,
}

impl NoteKind {
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Comment => 1,
            Self::Highlight => 9802,
            Self::Article => 30023,
        }
    }

    pub fn from_u16(kind: u16) -> Option<Self> {
        match kind {
            1 => Some(Self::Comment),
            9802 => Some(Self::Highlight),
            30023 => Some(Self::Article),
            _ => None,
        }
    }
}

/// A normalized message record. Content-addressed by `id`; a duplicate
/// delivery overwrites with identical data, so saves are idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: EventId,
    pub kind: NoteKind,
    pub content: String,
    /// Author-claimed creation time, seconds.
    pub created_at: u64,
    pub author: PublicKey,
    /// Thread root per the reference-tag convention.
    pub root_id: Option<EventId>,
    /// Immediate parent per the reference-tag convention.
    pub reply_id: Option<EventId>,
    /// Referenced but not structurally part of the thread.
    pub mention_ids: Vec<EventId>,
    /// Addressable-document coordinate this message targets.
    pub address: Option<String>,
    /// True when the address tag carried a `mention` marker.
    pub address_is_mention: bool,
    /// External URL this message is anchored to.
    pub url: Option<String>,
    pub topics: Vec<String>,
    /// The d-tag slug, present on addressable documents.
    pub identifier: Option<String>,
    pub title: Option<String>,
}

impl NoteRecord {
    /// Structural parent: the reply reference wins, a root-only message is
    /// a direct child of the root.
    pub fn parent_id(&self) -> Option<EventId> {
        self.reply_id.or(self.root_id)
    }
}

impl sqlx::FromRow<'_, SqliteRow> for NoteRecord {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let kind: i64 = row.try_get("kind")?;
        let author: String = row.try_get("author")?;
        let root_id: Option<String> = row.try_get("root_id")?;
        let reply_id: Option<String> = row.try_get("reply_id")?;
        let mention_ids: String = row.try_get("mention_ids")?;
        let topics: String = row.try_get("topics")?;

        Ok(NoteRecord {
            id: parse_column("id", EventId::parse(&id))?,
            kind: NoteKind::from_u16(kind as u16).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "kind".to_string(),
                source: format!("unsupported message kind {kind}").into(),
            })?,
            content: row.try_get("content")?,
            created_at: row.try_get::<i64, _>("created_at")? as u64,
            author: parse_column("author", PublicKey::parse(&author))?,
            root_id: root_id
                .map(|raw| parse_column("root_id", EventId::parse(&raw)))
                .transpose()?,
            reply_id: reply_id
                .map(|raw| parse_column("reply_id", EventId::parse(&raw)))
                .transpose()?,
            mention_ids: parse_column("mention_ids", serde_json::from_str(&mention_ids))?,
            address: row.try_get("address")?,
            address_is_mention: row.try_get::<i64, _>("address_is_mention")? != 0,
            url: row.try_get("url")?,
            topics: parse_column("topics", serde_json::from_str(&topics))?,
            identifier: row.try_get("identifier")?,
            title: row.try_get("title")?,
        })
    }
}

fn parse_column<T, E>(column: &str, result: std::result::Result<T, E>) -> std::result::Result<T, sqlx::Error>
where
    E: std::error::Error + Send + Sync + 'static,
{
    result.map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// Writes a batch of records in a single transaction. `INSERT OR REPLACE`
/// keeps duplicate deliveries idempotent.
pub(crate) async fn upsert_messages(
    db: &Database,
    records: &[NoteRecord],
) -> Result<(), DatabaseError> {
    let mut tx = db.pool.begin().await?;
    for record in records {
        sqlx::query(
            "INSERT OR REPLACE INTO messages \
             (id, kind, content, created_at, author, root_id, reply_id, mention_ids, \
              address, address_is_mention, url, topics, identifier, title) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_hex())
        .bind(record.kind.as_u16() as i64)
        .bind(&record.content)
        .bind(record.created_at as i64)
        .bind(record.author.to_hex())
        .bind(record.root_id.map(|id| id.to_hex()))
        .bind(record.reply_id.map(|id| id.to_hex()))
        .bind(serde_json::to_string(&record.mention_ids)?)
        .bind(&record.address)
        .bind(record.address_is_mention as i64)
        .bind(&record.url)
        .bind(serde_json::to_string(&record.topics)?)
        .bind(&record.identifier)
        .bind(&record.title)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub(crate) async fn find_message(
    db: &Database,
    id: &EventId,
) -> Result<Option<NoteRecord>, DatabaseError> {
    let record = sqlx::query_as::<_, NoteRecord>("SELECT * FROM messages WHERE id = ?")
        .bind(id.to_hex())
        .fetch_optional(&db.pool)
        .await?;
    Ok(record)
}

pub(crate) async fn messages_by_url(
    db: &Database,
    url: &str,
) -> Result<Vec<NoteRecord>, DatabaseError> {
    let records = sqlx::query_as::<_, NoteRecord>("SELECT * FROM messages WHERE url = ?")
        .bind(url)
        .fetch_all(&db.pool)
        .await?;
    Ok(records)
}

pub(crate) async fn messages_by_address(
    db: &Database,
    address: &str,
) -> Result<Vec<NoteRecord>, DatabaseError> {
    let records = sqlx::query_as::<_, NoteRecord>("SELECT * FROM messages WHERE address = ?")
        .bind(address)
        .fetch_all(&db.pool)
        .await?;
    Ok(records)
}

pub(crate) async fn messages_by_identifier(
    db: &Database,
    identifier: &str,
) -> Result<Vec<NoteRecord>, DatabaseError> {
    let records = sqlx::query_as::<_, NoteRecord>("SELECT * FROM messages WHERE identifier = ?")
        .bind(identifier)
        .fetch_all(&db.pool)
        .await?;
    Ok(records)
}

/// Everything belonging to a thread: the root messages themselves plus all
/// messages whose root reference points at one of them.
pub(crate) async fn thread_messages(
    db: &Database,
    roots: &[EventId],
) -> Result<Vec<NoteRecord>, DatabaseError> {
    if roots.is_empty() {
        return Ok(vec![]);
    }
    let marks = placeholders(roots.len());
    let sql = format!(
        "SELECT * FROM messages WHERE root_id IN ({marks}) OR id IN ({marks})"
    );
    let mut query = sqlx::query_as::<_, NoteRecord>(&sql);
    for _ in 0..2 {
        for id in roots {
            query = query.bind(id.to_hex());
        }
    }
    Ok(query.fetch_all(&db.pool).await?)
}

pub(crate) async fn messages_by_kind(
    db: &Database,
    kind: NoteKind,
) -> Result<Vec<NoteRecord>, DatabaseError> {
    let records = sqlx::query_as::<_, NoteRecord>("SELECT * FROM messages WHERE kind = ?")
        .bind(kind.as_u16() as i64)
        .fetch_all(&db.pool)
        .await?;
    Ok(records)
}
