//! The aggregates family: deduplicated reaction totals per anchor.

use std::collections::{HashMap, HashSet};

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::database::{Database, DatabaseError};
use crate::aggregation::{LikeVote, ZapReceipt};
use crate::types::{AggregateSnapshot, ReactionKind};

/// Latest vote seen for one author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteState {
    pub id: EventId,
    pub created_at: u64,
    pub positive: bool,
}

/// One aggregate row. `source_ids` only grows and `amount_sats` only
/// increases; there is no retraction path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRecord {
    pub anchor: String,
    pub kind: ReactionKind,
    /// Every message id already folded in, for idempotence.
    pub source_ids: HashSet<EventId>,
    /// Like votes by author; re-reacting replaces, never adds.
    pub votes: HashMap<PublicKey, VoteState>,
    pub amount_sats: u64,
}

impl AggregateRecord {
    pub fn new(anchor: impl Into<String>, kind: ReactionKind) -> Self {
        Self {
            anchor: anchor.into(),
            kind,
            source_ids: HashSet::new(),
            votes: HashMap::new(),
            amount_sats: 0,
        }
    }

    /// Distinct authors whose latest vote is positive.
    pub fn like_count(&self) -> usize {
        self.votes.values().filter(|vote| vote.positive).count()
    }

    pub fn receipt_count(&self) -> usize {
        self.source_ids.len()
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        match self.kind {
            ReactionKind::Like => AggregateSnapshot::Likes {
                count: self.like_count(),
            },
            ReactionKind::Zap => AggregateSnapshot::Zaps {
                total_sats: self.amount_sats,
                receipts: self.receipt_count(),
            },
        }
    }

    /// Folds raw votes in. Ids already counted are skipped; for a fresh id
    /// the author's slot is replaced only by a strictly later vote
    /// (timestamp, then id, so replay order never matters).
    pub fn fold_likes(&mut self, votes: &[LikeVote]) -> bool {
        let mut changed = false;
        for vote in votes {
            if !self.source_ids.insert(vote.id) {
                continue;
            }
            changed = true;
            let replace = match self.votes.get(&vote.author) {
                Some(existing) => {
                    (vote.created_at, vote.id) > (existing.created_at, existing.id)
                }
                None => true,
            };
            if replace {
                self.votes.insert(
                    vote.author,
                    VoteState {
                        id: vote.id,
                        created_at: vote.created_at,
                        positive: vote.positive,
                    },
                );
            }
        }
        changed
    }

    /// Folds receipts in, summing amounts across distinct ids only.
    pub fn fold_zaps(&mut self, receipts: &[ZapReceipt]) -> bool {
        let mut changed = false;
        for receipt in receipts {
            if !self.source_ids.insert(receipt.id) {
                continue;
            }
            self.amount_sats += receipt.amount_sats;
            changed = true;
        }
        changed
    }
}

impl sqlx::FromRow<'_, SqliteRow> for AggregateRecord {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let kind: i64 = row.try_get("kind")?;
        let source_ids: String = row.try_get("source_ids")?;
        let votes: String = row.try_get("votes")?;
        Ok(AggregateRecord {
            anchor: row.try_get("anchor")?,
            kind: ReactionKind::from_u16(kind as u16).ok_or_else(|| {
                sqlx::Error::ColumnDecode {
                    index: "kind".to_string(),
                    source: format!("unsupported aggregate kind {kind}").into(),
                }
            })?,
            source_ids: serde_json::from_str(&source_ids).map_err(|e| {
                sqlx::Error::ColumnDecode {
                    index: "source_ids".to_string(),
                    source: Box::new(e),
                }
            })?,
            votes: serde_json::from_str(&votes).map_err(|e| sqlx::Error::ColumnDecode {
                index: "votes".to_string(),
                source: Box::new(e),
            })?,
            amount_sats: row.try_get::<i64, _>("amount_sats")? as u64,
        })
    }
}

pub(crate) async fn find_aggregate(
    db: &Database,
    anchor: &str,
    kind: ReactionKind,
) -> Result<Option<AggregateRecord>, DatabaseError> {
    let record = sqlx::query_as::<_, AggregateRecord>(
        "SELECT * FROM aggregates WHERE anchor = ? AND kind = ?",
    )
    .bind(anchor)
    .bind(kind.as_u16() as i64)
    .fetch_optional(&db.pool)
    .await?;
    Ok(record)
}

/// Load-merge-store inside one transaction, so interleaved subscription
/// callbacks can never clobber each other's folds.
pub(crate) async fn merge_aggregate<F>(
    db: &Database,
    anchor: &str,
    kind: ReactionKind,
    fold: F,
) -> Result<bool, DatabaseError>
where
    F: FnOnce(&mut AggregateRecord) -> bool,
{
    let mut tx = db.pool.begin().await?;
    let existing = sqlx::query_as::<_, AggregateRecord>(
        "SELECT * FROM aggregates WHERE anchor = ? AND kind = ?",
    )
    .bind(anchor)
    .bind(kind.as_u16() as i64)
    .fetch_optional(&mut *tx)
    .await?;

    let mut record = existing.unwrap_or_else(|| AggregateRecord::new(anchor, kind));
    let changed = fold(&mut record);
    if changed {
        sqlx::query(
            "INSERT OR REPLACE INTO aggregates (anchor, kind, source_ids, votes, amount_sats) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.anchor)
        .bind(record.kind.as_u16() as i64)
        .bind(serde_json::to_string(&record.source_ids)?)
        .bind(serde_json::to_string(&record.votes)?)
        .bind(record.amount_sats as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id(byte: u8) -> EventId {
        EventId::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn later_vote_replaces_earlier_polarity() {
        let author = Keys::generate().public_key();
        let mut record = AggregateRecord::new("anchor", ReactionKind::Like);

        record.fold_likes(&[LikeVote {
            id: test_id(1),
            author,
            created_at: 100,
            positive: true,
        }]);
        assert_eq!(record.like_count(), 1);

        record.fold_likes(&[LikeVote {
            id: test_id(2),
            author,
            created_at: 200,
            positive: false,
        }]);
        // one author, latest vote is negative
        assert_eq!(record.like_count(), 0);
        assert_eq!(record.source_ids.len(), 2);
    }

    #[test]
    fn vote_replacement_ignores_stale_arrivals() {
        let author = Keys::generate().public_key();
        let mut record = AggregateRecord::new("anchor", ReactionKind::Like);

        record.fold_likes(&[LikeVote {
            id: test_id(2),
            author,
            created_at: 200,
            positive: false,
        }]);
        // the earlier vote arrives late and must not win
        record.fold_likes(&[LikeVote {
            id: test_id(1),
            author,
            created_at: 100,
            positive: true,
        }]);
        assert_eq!(record.like_count(), 0);
    }

    #[test]
    fn duplicate_receipt_id_is_counted_once() {
        let mut record = AggregateRecord::new("anchor", ReactionKind::Zap);
        let receipt = ZapReceipt {
            id: test_id(1),
            amount_sats: 500,
        };
        assert!(record.fold_zaps(&[receipt]));
        assert!(!record.fold_zaps(&[receipt]));
        assert_eq!(record.amount_sats, 500);
        assert_eq!(record.receipt_count(), 1);
    }

    #[test]
    fn refolding_a_counted_reaction_changes_nothing() {
        let author = Keys::generate().public_key();
        let vote = LikeVote {
            id: test_id(1),
            author,
            created_at: 100,
            positive: true,
        };
        let mut record = AggregateRecord::new("anchor", ReactionKind::Like);
        assert!(record.fold_likes(&[vote]));
        let before = record.clone();
        assert!(!record.fold_likes(&[vote]));
        assert_eq!(record, before);
    }
}
