//! Multi-relay synchronization.
//!
//! One [`ThreadSession`] per attached anchor: it discovers the thread roots,
//! opens a single logical subscription against the relay set bounded by the
//! anchor's watermarks, routes inbound events into the store and the
//! reaction buffers, and performs end-of-backlog bookkeeping. Relay
//! failures are isolated per relay and surfaced as status, never as
//! exceptions crossing into threading or aggregation.

pub mod discovery;
pub mod profiles;
pub mod publisher;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use nostr_sdk::prelude::*;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aggregation::{self, ReactionBuffer};
use crate::anchor::Anchor;
use crate::error::{Result, ThreadstrError};
use crate::normalizer::note_record_from_event;
use crate::store::{LocalStore, StoreFamily, since_lower_bound};
use crate::threading::{self, NestedNote, SiblingOrder};
use crate::types::{AggregateSnapshot, AttachOptions, ReactionKind, SyncStatus};

pub(crate) const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const KIND_COMMENT: u16 = 1;
const KIND_REACTION: u16 = 7;
const KIND_HIGHLIGHT: u16 = 9802;
const KIND_ZAP_RECEIPT: u16 = 9735;
const KIND_ARTICLE: u16 = 30023;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Client error: {0}")]
    Client(#[from] nostr_sdk::client::Error),
    #[error("Database error: {0}")]
    Database(#[from] crate::store::DatabaseError),
}

/// Value the subscription filter is derived from. Re-subscription happens
/// only when this actually changes, not on every upstream recomputation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ThreadTarget {
    /// Comments referencing these root event ids (`#e`).
    EventRefs(Vec<EventId>),
    /// Comments referencing an addressable document (`#a`).
    Address(String),
}

pub(crate) struct SessionCore {
    pub(crate) anchor: Anchor,
    pub(crate) anchor_key: String,
    pub(crate) options: AttachOptions,
    /// Relays that were accepted into the pool for this session.
    pub(crate) relays: Vec<RelayUrl>,
    pub(crate) client: Client,
    pub(crate) store: Arc<LocalStore>,
    pub(crate) subscription_id: SubscriptionId,
    pub(crate) root_ids: RwLock<Vec<EventId>>,
    current_target: Mutex<Option<ThreadTarget>>,
    relay_latest: Mutex<HashMap<RelayUrl, u64>>,
    eose_seen: Mutex<HashSet<RelayUrl>>,
    authors_seen: Mutex<HashSet<PublicKey>>,
    buffer: Mutex<ReactionBuffer>,
    /// Set after the first end-of-backlog flush; later reactions fold
    /// straight into the store instead of buffering.
    initial_flush_done: AtomicBool,
    pub(crate) closed: AtomicBool,
    status_tx: watch::Sender<SyncStatus>,
    thread_tx: watch::Sender<Vec<NestedNote>>,
    likes_tx: watch::Sender<AggregateSnapshot>,
    zaps_tx: watch::Sender<AggregateSnapshot>,
}

impl SessionCore {
    #[allow(clippy::too_many_arguments)]
    fn new(
        anchor: Anchor,
        options: AttachOptions,
        relays: Vec<RelayUrl>,
        failed: Vec<RelayUrl>,
        client: Client,
        store: Arc<LocalStore>,
        salt: &[u8; 16],
    ) -> Self {
        let anchor_key = anchor.key();
        let subscription_id = subscription_id_for(&anchor_key, salt);
        let warning = if relays.is_empty() {
            Some("no relay reachable, retrying on the next sync".to_string())
        } else {
            None
        };
        let (status_tx, _) = watch::channel(SyncStatus {
            connected: relays.clone(),
            failed,
            caught_up: false,
            warning,
        });
        let (thread_tx, _) = watch::channel(Vec::new());
        let (likes_tx, _) = watch::channel(AggregateSnapshot::empty(ReactionKind::Like));
        let (zaps_tx, _) = watch::channel(AggregateSnapshot::empty(ReactionKind::Zap));
        Self {
            anchor,
            anchor_key,
            options,
            relays,
            client,
            store,
            subscription_id,
            root_ids: RwLock::new(Vec::new()),
            current_target: Mutex::new(None),
            relay_latest: Mutex::new(HashMap::new()),
            eose_seen: Mutex::new(HashSet::new()),
            authors_seen: Mutex::new(HashSet::new()),
            buffer: Mutex::new(ReactionBuffer::default()),
            initial_flush_done: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            status_tx,
            thread_tx,
            likes_tx,
            zaps_tx,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn kinds_of_interest(&self) -> Vec<Kind> {
        let mut kinds = vec![Kind::from(KIND_COMMENT), Kind::from(KIND_HIGHLIGHT)];
        if self.options.likes_enabled() {
            kinds.push(Kind::from(KIND_REACTION));
        }
        if self.options.zaps_enabled() {
            kinds.push(Kind::from(KIND_ZAP_RECEIPT));
        }
        kinds
    }

    pub(crate) fn derive_target(&self) -> ThreadTarget {
        match &self.anchor {
            Anchor::Address(coordinate) => ThreadTarget::Address(coordinate.to_string()),
            _ => ThreadTarget::EventRefs(self.root_ids.read().unwrap().clone()),
        }
    }

    /// Records the target if it differs from the current one. The filter
    /// only ever changes when this returns true.
    pub(crate) fn target_changed(&self, target: &ThreadTarget) -> bool {
        let mut current = self.current_target.lock().unwrap();
        if current.as_ref() == Some(target) {
            return false;
        }
        *current = Some(target.clone());
        true
    }

    /// Shared incremental lower bound for this anchor over the active
    /// relay set.
    pub(crate) async fn since(&self) -> std::result::Result<Option<Timestamp>, SyncError> {
        let cursors = self.store.cursors_for_anchor(&self.anchor_key).await?;
        Ok(since_lower_bound(&cursors, &self.relays).map(Timestamp::from))
    }

    fn build_filter(&self, target: &ThreadTarget, since: Option<Timestamp>) -> Filter {
        let mut filter = Filter::new().kinds(self.kinds_of_interest());
        filter = match target {
            ThreadTarget::EventRefs(ids) => filter.events(ids.clone()),
            ThreadTarget::Address(coordinate) => filter.custom_tag(
                SingleLetterTag::lowercase(Alphabet::A),
                coordinate.clone(),
            ),
        };
        if let Some(since) = since {
            filter = filter.since(since);
        }
        filter
    }

    /// (Re)establishes the subscription when the derived filter changed
    /// value. Returns whether a subscription round-trip happened.
    pub(crate) async fn resubscribe_if_changed(&self) -> std::result::Result<bool, SyncError> {
        let target = self.derive_target();
        if matches!(&target, ThreadTarget::EventRefs(ids) if ids.is_empty()) {
            // No roots discovered yet, nothing worth subscribing to.
            return Ok(false);
        }
        if !self.target_changed(&target) {
            return Ok(false);
        }
        if self.relays.is_empty() {
            return Ok(false);
        }
        let since = self.since().await?;
        let filter = self.build_filter(&target, since);
        self.eose_seen.lock().unwrap().clear();
        tracing::debug!(
            target: "threadstr::sync::resubscribe_if_changed",
            "subscribing to {} for {:?}",
            self.anchor_key,
            target
        );
        // Re-using the subscription id replaces the previous subscription.
        self.client
            .subscribe_with_id_to(
                self.relays.clone(),
                self.subscription_id.clone(),
                filter,
                None,
            )
            .await?;
        Ok(true)
    }

    pub(crate) async fn handle_event(
        &self,
        relay_url: RelayUrl,
        event: Event,
    ) -> std::result::Result<(), SyncError> {
        let timestamp = event.created_at.as_u64();
        {
            let mut latest = self.relay_latest.lock().unwrap();
            let entry = latest.entry(relay_url).or_insert(0);
            *entry = (*entry).max(timestamp);
        }
        self.authors_seen.lock().unwrap().insert(event.pubkey);

        match event.kind.as_u16() {
            KIND_COMMENT | KIND_HIGHLIGHT | KIND_ARTICLE => {
                if event.content.trim().is_empty() {
                    return Ok(());
                }
                if let Some(record) = note_record_from_event(&event) {
                    self.store.save_message(record).await;
                }
            }
            KIND_REACTION => {
                let vote = aggregation::like_from_event(&event);
                if self.initial_flush_done.load(Ordering::SeqCst) {
                    self.store
                        .fold_likes(&self.anchor_key, std::slice::from_ref(&vote))
                        .await?;
                } else {
                    self.buffer.lock().unwrap().add_like(vote);
                }
            }
            KIND_ZAP_RECEIPT => {
                let Some(receipt) = aggregation::zap_from_event(&event) else {
                    return Ok(());
                };
                if self.initial_flush_done.load(Ordering::SeqCst) {
                    self.store
                        .fold_zaps(&self.anchor_key, std::slice::from_ref(&receipt))
                        .await?;
                } else {
                    self.buffer.lock().unwrap().add_zap(receipt);
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) async fn handle_eose(&self, relay_url: RelayUrl) {
        let caught_up = {
            let mut seen = self.eose_seen.lock().unwrap();
            seen.insert(relay_url);
            self.relays.iter().all(|relay| seen.contains(relay))
        };

        self.finish_batch().await;

        if caught_up {
            self.status_tx.send_modify(|status| status.caught_up = true);
            if !self.options.live() {
                tracing::debug!(
                    target: "threadstr::sync::handle_eose",
                    "caught up on {}, closing one-shot session",
                    self.anchor_key
                );
                self.close_subscription().await;
                self.client.disconnect().await;
            }
        }
    }

    /// End-of-backlog bookkeeping. Message writes for this subscription are
    /// flushed before anything else runs; every step is idempotent, so it
    /// is safe to run once per relay backlog.
    pub(crate) async fn finish_batch(&self) {
        self.store.flush().await;

        let (likes, zaps) = { self.buffer.lock().unwrap().drain() };
        if !likes.is_empty() {
            if let Err(e) = self.store.fold_likes(&self.anchor_key, &likes).await {
                tracing::error!(
                    target: "threadstr::sync::finish_batch",
                    "failed to fold {} reactions: {}",
                    likes.len(),
                    e
                );
            }
        }
        if !zaps.is_empty() {
            if let Err(e) = self.store.fold_zaps(&self.anchor_key, &zaps).await {
                tracing::error!(
                    target: "threadstr::sync::finish_batch",
                    "failed to fold {} zap receipts: {}",
                    zaps.len(),
                    e
                );
            }
        }
        self.initial_flush_done.store(true, Ordering::SeqCst);

        let authors: Vec<PublicKey> =
            { self.authors_seen.lock().unwrap().iter().copied().collect() };
        if let Err(e) =
            profiles::refresh_stale_profiles(&self.client, &self.store, &authors, &self.relays)
                .await
        {
            tracing::warn!(
                target: "threadstr::sync::finish_batch",
                "profile refresh failed: {}",
                e
            );
        }

        let latest: Vec<(RelayUrl, u64)> = {
            self.relay_latest
                .lock()
                .unwrap()
                .iter()
                .map(|(url, seen)| (url.clone(), *seen))
                .collect()
        };
        for (relay_url, seen) in latest {
            if let Err(e) = self
                .store
                .advance_cursor(&relay_url, &self.anchor_key, seen)
                .await
            {
                tracing::error!(
                    target: "threadstr::sync::finish_batch",
                    "failed to advance watermark for {}: {}",
                    relay_url,
                    e
                );
            }
        }
    }

    pub(crate) async fn close_subscription(&self) {
        self.client.unsubscribe(&self.subscription_id).await;
    }

    /// Rebuilds the nested view from the store and pushes it to watchers.
    pub(crate) async fn recompute_thread(&self) {
        let forest = match self.load_forest().await {
            Ok(forest) => forest,
            Err(e) => {
                tracing::error!(
                    target: "threadstr::sync::recompute_thread",
                    "failed to load thread for {}: {}",
                    self.anchor_key,
                    e
                );
                return;
            }
        };
        self.thread_tx.send_replace(forest);
    }

    async fn load_forest(&self) -> std::result::Result<Vec<NestedNote>, SyncError> {
        let forest = match &self.anchor {
            Anchor::Address(coordinate) => {
                let notes = self
                    .store
                    .messages_by_address(&coordinate.to_string())
                    .await?;
                let roots: HashSet<EventId> =
                    self.root_ids.read().unwrap().iter().copied().collect();
                threading::nest_under(notes, &roots, SiblingOrder::NewestFirst)
            }
            Anchor::Url(_) | Anchor::Note(_) => {
                let roots = self.root_ids.read().unwrap().clone();
                if roots.is_empty() {
                    Vec::new()
                } else {
                    let notes = self.store.thread_messages(&roots).await?;
                    threading::nest(notes, SiblingOrder::NewestFirst)
                }
            }
            Anchor::Malformed(_) => Vec::new(),
        };
        Ok(threading::prune_childless_highlights(forest))
    }

    pub(crate) async fn recompute_aggregates(&self) {
        for kind in [ReactionKind::Like, ReactionKind::Zap] {
            match self.store.aggregate(&self.anchor_key, kind).await {
                Ok(record) => {
                    let snapshot = record
                        .map(|r| r.snapshot())
                        .unwrap_or_else(|| AggregateSnapshot::empty(kind));
                    match kind {
                        ReactionKind::Like => self.likes_tx.send_replace(snapshot),
                        ReactionKind::Zap => self.zaps_tx.send_replace(snapshot),
                    };
                }
                Err(e) => {
                    tracing::error!(
                        target: "threadstr::sync::recompute_aggregates",
                        "failed to load {:?} aggregate for {}: {}",
                        kind,
                        self.anchor_key,
                        e
                    );
                }
            }
        }
    }
}

/// Short anchor hash, salted per engine instance so subscription ids don't
/// leak which anchors a client watches across sessions.
fn subscription_id_for(anchor_key: &str, salt: &[u8; 16]) -> SubscriptionId {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(anchor_key.as_bytes());
    let hash = hex::encode(hasher.finalize());
    SubscriptionId::new(format!("{}_thread", &hash[..12]))
}

/// A live, cancellable view of one anchored discussion.
pub struct ThreadSession {
    core: Arc<SessionCore>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ThreadSession {
    pub fn anchor(&self) -> &Anchor {
        &self.core.anchor
    }

    pub fn anchor_key(&self) -> &str {
        &self.core.anchor_key
    }

    /// Live nested view of the thread, refreshed after each coalesced
    /// store write.
    pub fn watch_thread(&self) -> watch::Receiver<Vec<NestedNote>> {
        self.core.thread_tx.subscribe()
    }

    /// Live deduplicated totals for one reaction family.
    pub fn watch_aggregate(&self, kind: ReactionKind) -> watch::Receiver<AggregateSnapshot> {
        match kind {
            ReactionKind::Like => self.core.likes_tx.subscribe(),
            ReactionKind::Zap => self.core.zaps_tx.subscribe(),
        }
    }

    /// Relay health and catch-up state.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.core.status_tx.subscribe()
    }

    /// Version of the addressable document this session displays: the
    /// explicitly pinned one, otherwise the newest known.
    pub fn version(&self) -> Option<EventId> {
        self.core
            .options
            .requested_version
            .or_else(|| self.core.root_ids.read().unwrap().first().copied())
    }

    /// Cancels the subscription and stops all background work. Called
    /// before attaching a replacement session for a new anchor or relay
    /// set.
    pub async fn close(mut self) {
        self.core.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.core.close_subscription().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for ThreadSession {
    fn drop(&mut self) {
        self.core.closed.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub(crate) async fn start_session(
    client: Client,
    store: Arc<LocalStore>,
    anchor: Anchor,
    options: AttachOptions,
    default_relays: &[RelayUrl],
    salt: &[u8; 16],
) -> Result<ThreadSession> {
    let requested = if options.relays.is_empty() {
        default_relays.to_vec()
    } else {
        options.relays.clone()
    };
    if requested.is_empty() {
        return Err(ThreadstrError::NoRelaysAvailable);
    }

    let (connected, failed) = connect_relays(&client, &requested).await;

    let core = Arc::new(SessionCore::new(
        anchor, options, connected, failed, client, store, salt,
    ));

    // Local-first: roots from cache, thread rendered before any network.
    core.discover_roots_local().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        tokio::spawn(run_store_watch(core.clone(), shutdown_rx.clone())),
        tokio::spawn(run_notification_loop(core.clone(), shutdown_rx.clone())),
    ];

    if !core.relays.is_empty() {
        if let Err(e) = core.resubscribe_if_changed().await {
            tracing::warn!(
                target: "threadstr::sync::start_session",
                "initial subscription failed: {}",
                e
            );
            core.status_tx
                .send_modify(|status| status.warning = Some(format!("subscription failed: {e}")));
        }
        tasks.push(tokio::spawn(run_remote_discovery(
            core.clone(),
            shutdown_rx,
        )));
    }

    Ok(ThreadSession {
        core,
        shutdown_tx,
        tasks,
    })
}

/// Adds relays one by one; a bad relay is recorded and skipped, never
/// fatal for its siblings.
async fn connect_relays(client: &Client, relays: &[RelayUrl]) -> (Vec<RelayUrl>, Vec<RelayUrl>) {
    let mut connected = Vec::new();
    let mut failed = Vec::new();
    for relay in relays {
        match client.add_relay(relay.clone()).await {
            Ok(_) => connected.push(relay.clone()),
            Err(e) => {
                tracing::warn!(
                    target: "threadstr::sync::connect_relays",
                    "failed to add relay {}: {}",
                    relay,
                    e
                );
                failed.push(relay.clone());
            }
        }
    }
    client.connect().await;
    (connected, failed)
}

async fn run_remote_discovery(core: Arc<SessionCore>, mut shutdown: watch::Receiver<bool>) {
    // Captured at dispatch; a result that raced an anchor change is
    // compared against it and dropped.
    let dispatched_for = core.anchor_key.clone();
    let result = tokio::select! {
        _ = shutdown.changed() => return,
        result = discovery::fetch_remote_roots(&core) => result,
    };
    match result {
        Ok(records) => {
            core.apply_remote_roots(&dispatched_for, records).await;
            if let Err(e) = core.resubscribe_if_changed().await {
                tracing::warn!(
                    target: "threadstr::sync::run_remote_discovery",
                    "resubscription after root discovery failed: {}",
                    e
                );
            }
        }
        Err(e) => {
            tracing::warn!(
                target: "threadstr::sync::run_remote_discovery",
                "remote root discovery failed for {}: {}",
                dispatched_for,
                e
            );
        }
    }
}

async fn run_notification_loop(core: Arc<SessionCore>, mut shutdown: watch::Receiver<bool>) {
    let mut notifications = core.client.notifications();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            notification = notifications.recv() => {
                match notification {
                    Ok(RelayPoolNotification::Message { relay_url, message }) => match message {
                        RelayMessage::Event { subscription_id, event } => {
                            if subscription_id.as_ref() == &core.subscription_id {
                                if let Err(e) = core
                                    .handle_event(relay_url, event.as_ref().clone())
                                    .await
                                {
                                    tracing::error!(
                                        target: "threadstr::sync::run_notification_loop",
                                        "error handling event: {}",
                                        e
                                    );
                                }
                            }
                        }
                        RelayMessage::EndOfStoredEvents(subscription_id) => {
                            if subscription_id.as_ref() == &core.subscription_id {
                                core.handle_eose(relay_url).await;
                            }
                        }
                        _ => {}
                    },
                    Ok(RelayPoolNotification::Shutdown) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: "threadstr::sync::run_notification_loop",
                            "notification stream lagged, {} dropped",
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Debounced recomputation: the store already coalesces writes, so one
/// notification per family per window drives one recompute here.
async fn run_store_watch(core: Arc<SessionCore>, mut shutdown: watch::Receiver<bool>) {
    let mut changes = core.store.subscribe();
    core.recompute_thread().await;
    core.recompute_aggregates().await;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            change = changes.recv() => match change {
                Ok(StoreFamily::Messages) => core.recompute_thread().await,
                Ok(StoreFamily::Aggregates) => core.recompute_aggregates().await,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    core.recompute_thread().await;
                    core.recompute_aggregates().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    async fn test_core(anchor: Anchor) -> Arc<SessionCore> {
        let db = Database::new_in_memory().await.unwrap();
        let store = Arc::new(LocalStore::new(db));
        Arc::new(SessionCore::new(
            anchor,
            AttachOptions::default(),
            vec![],
            vec![],
            Client::default(),
            store,
            &[7u8; 16],
        ))
    }

    fn test_id(byte: u8) -> EventId {
        EventId::from_slice(&[byte; 32]).unwrap()
    }

    #[tokio::test]
    async fn stale_discovery_result_never_touches_a_replaced_anchor() {
        let n1 = test_id(1);
        let core = test_core(Anchor::Note(n1)).await;
        core.discover_roots_local().await.unwrap();
        assert_eq!(*core.root_ids.read().unwrap(), vec![n1]);

        // The session moves on before the in-flight fetch resolves.
        core.closed.store(true, Ordering::SeqCst);
        let key = core.anchor_key.clone();
        let applied = core.apply_remote_roots(&key, vec![]).await;
        assert!(!applied);

        // A result dispatched for a different anchor is dropped too.
        let other = test_core(Anchor::Note(test_id(2))).await;
        let applied = other.apply_remote_roots(&Anchor::Note(n1).key(), vec![]).await;
        assert!(!applied);
    }

    #[tokio::test]
    async fn filter_target_changes_only_by_value() {
        let core = test_core(Anchor::Url("https://example.com/a".to_string())).await;
        let target = ThreadTarget::EventRefs(vec![test_id(1)]);

        assert!(core.target_changed(&target));
        // same value again: no re-subscription
        assert!(!core.target_changed(&target));
        assert!(core.target_changed(&ThreadTarget::EventRefs(vec![test_id(2)])));
    }

    #[tokio::test]
    async fn reactions_buffer_until_backlog_flush_then_fold_directly() {
        let core = test_core(Anchor::Note(test_id(1))).await;
        let relay = RelayUrl::parse("wss://relay.example.com").unwrap();
        let keys = Keys::generate();

        let reaction = EventBuilder::new(Kind::Reaction, "+")
            .sign_with_keys(&keys)
            .unwrap();
        core.handle_event(relay.clone(), reaction).await.unwrap();

        // buffered, nothing in the store yet
        assert!(
            core.store
                .aggregate(&core.anchor_key, ReactionKind::Like)
                .await
                .unwrap()
                .is_none()
        );

        core.finish_batch().await;
        let record = core
            .store
            .aggregate(&core.anchor_key, ReactionKind::Like)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.like_count(), 1);

        // after the flush a live session folds immediately
        let second = EventBuilder::new(Kind::Reaction, "+")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        core.handle_event(relay, second).await.unwrap();
        let record = core
            .store
            .aggregate(&core.anchor_key, ReactionKind::Like)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.like_count(), 2);
    }

    #[tokio::test]
    async fn eose_bookkeeping_advances_watermarks_per_relay() {
        let core = test_core(Anchor::Note(test_id(1))).await;
        let relay_a = RelayUrl::parse("wss://a.example.com").unwrap();
        let relay_b = RelayUrl::parse("wss://b.example.com").unwrap();

        let old = EventBuilder::text_note("one")
            .custom_created_at(Timestamp::from(100))
            .sign_with_keys(&Keys::generate())
            .unwrap();
        let new = EventBuilder::text_note("two")
            .custom_created_at(Timestamp::from(200))
            .sign_with_keys(&Keys::generate())
            .unwrap();

        core.handle_event(relay_a.clone(), old).await.unwrap();
        core.handle_event(relay_a.clone(), new).await.unwrap();
        core.finish_batch().await;

        let cursors = core.store.cursors_for_anchor(&core.anchor_key).await.unwrap();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].relay_url, relay_a);
        assert_eq!(cursors[0].latest_seen, 200);
        // relay B never delivered anything, so it has no cursor
        assert!(!cursors.iter().any(|c| c.relay_url == relay_b));
    }

    #[tokio::test]
    async fn empty_comment_bodies_are_not_stored() {
        let core = test_core(Anchor::Note(test_id(1))).await;
        let relay = RelayUrl::parse("wss://relay.example.com").unwrap();
        let blank = EventBuilder::text_note("   ")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        let id = blank.id;

        core.handle_event(relay, blank).await.unwrap();
        core.store.flush().await;
        assert!(core.store.message(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn note_anchor_roots_are_definitive() {
        let note = test_id(5);
        let core = test_core(Anchor::Note(note)).await;
        core.discover_roots_local().await.unwrap();
        assert_eq!(core.derive_target(), ThreadTarget::EventRefs(vec![note]));
    }
}
