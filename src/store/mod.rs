//! The local store: four indexed record families behind one SQLite pool,
//! with coalesced writes and per-family change notification.
//!
//! Every component reads and writes through this layer; message arrays are
//! never shared by reference. Message saves are buffered and flushed as one
//! transaction per coalescing window, followed by exactly one notification,
//! which bounds downstream recomputation under event bursts.

pub mod aggregates;
pub mod cursors;
pub mod database;
pub mod messages;
pub mod profiles;

use std::time::Duration;

use nostr_sdk::prelude::*;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, timeout_at};

pub use aggregates::{AggregateRecord, VoteState};
pub use cursors::{SyncCursor, since_lower_bound};
pub use database::{Database, DatabaseError};
pub use messages::{NoteKind, NoteRecord};
pub use profiles::{PROFILE_STALE_AFTER_SECS, ProfileRecord};

use crate::aggregation::{LikeVote, ZapReceipt};
use crate::types::ReactionKind;

/// Store families a watcher can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreFamily {
    Messages,
    Aggregates,
    Profiles,
    Cursors,
}

/// Message saves within this window land in one transaction and fire one
/// notification.
const WRITE_COALESCE_WINDOW: Duration = Duration::from_millis(96);
const BATCH_CHANNEL_CAPACITY: usize = 512;
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

enum BatchCommand {
    Save(NoteRecord),
    Flush(oneshot::Sender<()>),
}

pub struct LocalStore {
    db: Database,
    notify_tx: broadcast::Sender<StoreFamily>,
    batch_tx: mpsc::Sender<BatchCommand>,
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        tokio::spawn(run_batcher(db.clone(), notify_tx.clone(), batch_rx));
        Self {
            db,
            notify_tx,
            batch_tx,
        }
    }

    /// Change feed: one item per family per flushed write, not per save.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreFamily> {
        self.notify_tx.subscribe()
    }

    fn notify(&self, family: StoreFamily) {
        // No receivers is fine; nobody is watching yet.
        let _ = self.notify_tx.send(family);
    }

    // --- messages ---

    /// Queues a record for the next coalesced write.
    pub async fn save_message(&self, record: NoteRecord) {
        if self
            .batch_tx
            .send(BatchCommand::Save(record))
            .await
            .is_err()
        {
            tracing::error!(
                target: "threadstr::store::save_message",
                "write buffer task is gone, dropping record"
            );
        }
    }

    /// Immediate write that skips the coalescing window, for optimistic
    /// local echoes of just-published messages.
    pub async fn save_message_now(&self, record: NoteRecord) -> Result<(), DatabaseError> {
        messages::upsert_messages(&self.db, std::slice::from_ref(&record)).await?;
        self.notify(StoreFamily::Messages);
        Ok(())
    }

    /// Forces any buffered saves to disk before returning.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.batch_tx.send(BatchCommand::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub async fn message(&self, id: &EventId) -> Result<Option<NoteRecord>, DatabaseError> {
        messages::find_message(&self.db, id).await
    }

    pub async fn messages_by_url(&self, url: &str) -> Result<Vec<NoteRecord>, DatabaseError> {
        messages::messages_by_url(&self.db, url).await
    }

    pub async fn messages_by_address(
        &self,
        address: &str,
    ) -> Result<Vec<NoteRecord>, DatabaseError> {
        messages::messages_by_address(&self.db, address).await
    }

    pub async fn messages_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Vec<NoteRecord>, DatabaseError> {
        messages::messages_by_identifier(&self.db, identifier).await
    }

    pub async fn thread_messages(
        &self,
        roots: &[EventId],
    ) -> Result<Vec<NoteRecord>, DatabaseError> {
        messages::thread_messages(&self.db, roots).await
    }

    pub async fn messages_by_kind(&self, kind: NoteKind) -> Result<Vec<NoteRecord>, DatabaseError> {
        messages::messages_by_kind(&self.db, kind).await
    }

    // --- aggregates ---

    pub async fn aggregate(
        &self,
        anchor: &str,
        kind: ReactionKind,
    ) -> Result<Option<AggregateRecord>, DatabaseError> {
        aggregates::find_aggregate(&self.db, anchor, kind).await
    }

    pub async fn fold_likes(
        &self,
        anchor: &str,
        votes: &[LikeVote],
    ) -> Result<(), DatabaseError> {
        let changed =
            aggregates::merge_aggregate(&self.db, anchor, ReactionKind::Like, |record| {
                record.fold_likes(votes)
            })
            .await?;
        if changed {
            self.notify(StoreFamily::Aggregates);
        }
        Ok(())
    }

    pub async fn fold_zaps(
        &self,
        anchor: &str,
        receipts: &[ZapReceipt],
    ) -> Result<(), DatabaseError> {
        let changed = aggregates::merge_aggregate(&self.db, anchor, ReactionKind::Zap, |record| {
            record.fold_zaps(receipts)
        })
        .await?;
        if changed {
            self.notify(StoreFamily::Aggregates);
        }
        Ok(())
    }

    // --- profiles ---

    pub async fn profile(&self, pubkey: &PublicKey) -> Result<Option<ProfileRecord>, DatabaseError> {
        profiles::find_profile(&self.db, pubkey).await
    }

    pub async fn stale_profiles(
        &self,
        authors: &[PublicKey],
        now: u64,
    ) -> Result<Vec<PublicKey>, DatabaseError> {
        profiles::stale_profiles(&self.db, authors, now).await
    }

    pub async fn apply_profile(&self, incoming: &ProfileRecord) -> Result<(), DatabaseError> {
        if profiles::apply_profile(&self.db, incoming).await? {
            self.notify(StoreFamily::Profiles);
        }
        Ok(())
    }

    pub async fn touch_profiles(
        &self,
        pubkeys: &[PublicKey],
        now: u64,
    ) -> Result<(), DatabaseError> {
        profiles::touch_profiles(&self.db, pubkeys, now).await
    }

    // --- sync cursors ---

    pub async fn cursors_for_anchor(&self, anchor: &str) -> Result<Vec<SyncCursor>, DatabaseError> {
        cursors::cursors_for_anchor(&self.db, anchor).await
    }

    pub async fn advance_cursor(
        &self,
        relay_url: &RelayUrl,
        anchor: &str,
        seen: u64,
    ) -> Result<(), DatabaseError> {
        cursors::advance_cursor(&self.db, relay_url, anchor, seen).await?;
        self.notify(StoreFamily::Cursors);
        Ok(())
    }

    /// Wipes all persisted families.
    pub async fn clear(&self) -> Result<(), DatabaseError> {
        self.flush().await;
        self.db.delete_all_data().await?;
        for family in [
            StoreFamily::Messages,
            StoreFamily::Aggregates,
            StoreFamily::Profiles,
            StoreFamily::Cursors,
        ] {
            self.notify(family);
        }
        Ok(())
    }
}

/// Owns the write buffer. The window is fixed from the first queued record,
/// so a steady stream of saves still flushes every `WRITE_COALESCE_WINDOW`.
async fn run_batcher(
    db: Database,
    notify_tx: broadcast::Sender<StoreFamily>,
    mut rx: mpsc::Receiver<BatchCommand>,
) {
    let mut pending: Vec<NoteRecord> = Vec::new();

    async fn flush_pending(
        db: &Database,
        notify_tx: &broadcast::Sender<StoreFamily>,
        pending: &mut Vec<NoteRecord>,
    ) {
        if pending.is_empty() {
            return;
        }
        match messages::upsert_messages(db, pending).await {
            Ok(()) => {
                let _ = notify_tx.send(StoreFamily::Messages);
            }
            Err(e) => {
                tracing::error!(
                    target: "threadstr::store::batcher",
                    "failed to flush {} buffered messages: {}",
                    pending.len(),
                    e
                );
            }
        }
        pending.clear();
    }

    loop {
        let command = if pending.is_empty() {
            rx.recv().await
        } else {
            let deadline = Instant::now() + WRITE_COALESCE_WINDOW;
            match timeout_at(deadline, rx.recv()).await {
                Ok(command) => command,
                Err(_) => {
                    flush_pending(&db, &notify_tx, &mut pending).await;
                    continue;
                }
            }
        };

        match command {
            Some(BatchCommand::Save(record)) => pending.push(record),
            Some(BatchCommand::Flush(ack)) => {
                flush_pending(&db, &notify_tx, &mut pending).await;
                let _ = ack.send(());
            }
            None => {
                flush_pending(&db, &notify_tx, &mut pending).await;
                break;
            }
        }
    }
}
