//! Root discovery: mapping an anchor onto the event ids its thread hangs
//! off. Cached data answers first; the remote pass only replaces the root
//! set when it actually found something fresher, to avoid downstream
//! filter churn.

use nostr_sdk::prelude::*;

use super::{FETCH_TIMEOUT, SessionCore, SyncError};
use crate::anchor::Anchor;
use crate::normalizer::note_record_from_event;
use crate::store::NoteRecord;

/// Newest first, ids as tie-break, matching the sibling order of the
/// rendered thread.
pub(crate) fn sort_newest_first(records: &mut [NoteRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

impl SessionCore {
    /// Provisional roots from the local cache only.
    pub(crate) async fn discover_roots_local(&self) -> Result<(), SyncError> {
        let roots = match &self.anchor {
            Anchor::Url(url) => {
                let mut candidates = self.store.messages_by_url(url).await?;
                sort_newest_first(&mut candidates);
                candidates.into_iter().map(|record| record.id).collect()
            }
            // A note anchor is definitive; the cache lookup only decides
            // whether the event body still needs fetching.
            Anchor::Note(id) => vec![*id],
            Anchor::Address(coordinate) => {
                let mut candidates = self
                    .store
                    .messages_by_identifier(&coordinate.identifier)
                    .await?
                    .into_iter()
                    .filter(|record| record.author == coordinate.public_key)
                    .collect::<Vec<_>>();
                sort_newest_first(&mut candidates);
                candidates.into_iter().map(|record| record.id).collect()
            }
            Anchor::Malformed(_) => Vec::new(),
        };
        *self.root_ids.write().unwrap() = roots;
        Ok(())
    }

    fn remote_roots_filter(&self) -> Option<Filter> {
        match &self.anchor {
            Anchor::Url(url) => Some(
                Filter::new()
                    .kind(Kind::TextNote)
                    .custom_tag(SingleLetterTag::lowercase(Alphabet::R), url.clone()),
            ),
            Anchor::Note(id) => Some(Filter::new().id(*id)),
            Anchor::Address(coordinate) => Some(
                Filter::new()
                    .author(coordinate.public_key)
                    .kind(coordinate.kind)
                    .identifier(coordinate.identifier.clone()),
            ),
            Anchor::Malformed(_) => None,
        }
    }

    /// Merges remote discovery results in. Returns false, leaving all state
    /// untouched, when the session has been closed or the result was
    /// dispatched for a different anchor.
    pub(crate) async fn apply_remote_roots(
        &self,
        dispatched_for: &str,
        records: Vec<NoteRecord>,
    ) -> bool {
        if self.is_closed() || dispatched_for != self.anchor_key {
            tracing::debug!(
                target: "threadstr::sync::apply_remote_roots",
                "dropping stale discovery result for {}",
                dispatched_for
            );
            return false;
        }
        for record in &records {
            self.store.save_message(record.clone()).await;
        }
        self.store.flush().await;

        match &self.anchor {
            // The id was definitive all along.
            Anchor::Note(_) => false,
            _ => {
                // Re-query so local and remote candidates merge, then only
                // replace the root set if the freshest id moved.
                let merged = match self.discover_roots_merged().await {
                    Ok(ids) => ids,
                    Err(e) => {
                        tracing::error!(
                            target: "threadstr::sync::apply_remote_roots",
                            "failed to merge discovered roots: {}",
                            e
                        );
                        return false;
                    }
                };
                let mut roots = self.root_ids.write().unwrap();
                if merged.first() != roots.first() {
                    *roots = merged;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn discover_roots_merged(&self) -> Result<Vec<EventId>, SyncError> {
        let mut candidates = match &self.anchor {
            Anchor::Url(url) => self.store.messages_by_url(url).await?,
            Anchor::Address(coordinate) => self
                .store
                .messages_by_identifier(&coordinate.identifier)
                .await?
                .into_iter()
                .filter(|record| record.author == coordinate.public_key)
                .collect(),
            Anchor::Note(_) | Anchor::Malformed(_) => Vec::new(),
        };
        sort_newest_first(&mut candidates);
        Ok(candidates.into_iter().map(|record| record.id).collect())
    }
}

/// The remote half of root discovery, bounded by the anchor's watermark. A
/// cached note short-circuits the fetch entirely.
pub(crate) async fn fetch_remote_roots(
    core: &SessionCore,
) -> Result<Vec<NoteRecord>, SyncError> {
    if let Anchor::Note(id) = &core.anchor {
        if core.store.message(id).await?.is_some() {
            return Ok(Vec::new());
        }
    }
    let Some(mut filter) = core.remote_roots_filter() else {
        return Ok(Vec::new());
    };
    if let Some(since) = core.since().await? {
        filter = filter.since(since);
    }
    let events = core
        .client
        .fetch_events_from(core.relays.clone(), filter, FETCH_TIMEOUT)
        .await?;
    Ok(events
        .into_iter()
        .filter_map(|event| note_record_from_event(&event))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Database, LocalStore, NoteKind};
    use crate::types::AttachOptions;
    use std::sync::Arc;

    fn test_id(byte: u8) -> EventId {
        EventId::from_slice(&[byte; 32]).unwrap()
    }

    fn record(id: EventId, created_at: u64, url: Option<&str>) -> NoteRecord {
        NoteRecord {
            id,
            kind: NoteKind::Comment,
            content: "body".to_string(),
            created_at,
            author: Keys::generate().public_key(),
            root_id: None,
            reply_id: None,
            mention_ids: vec![],
            address: None,
            address_is_mention: false,
            url: url.map(str::to_string),
            topics: vec![],
            identifier: None,
            title: None,
        }
    }

    async fn core_with_store(anchor: Anchor) -> Arc<SessionCore> {
        let db = Database::new_in_memory().await.unwrap();
        let store = Arc::new(LocalStore::new(db));
        Arc::new(SessionCore::new(
            anchor,
            AttachOptions::default(),
            vec![],
            vec![],
            Client::default(),
            store,
            &[3u8; 16],
        ))
    }

    #[tokio::test]
    async fn url_roots_come_from_cache_newest_first() {
        let url = "https://example.com/post";
        let core = core_with_store(Anchor::Url(url.to_string())).await;
        core.store.save_message(record(test_id(1), 100, Some(url))).await;
        core.store.save_message(record(test_id(2), 300, Some(url))).await;
        core.store.save_message(record(test_id(3), 200, Some(url))).await;
        core.store
            .save_message(record(test_id(4), 999, Some("https://other.example.com")))
            .await;
        core.store.flush().await;

        core.discover_roots_local().await.unwrap();
        assert_eq!(
            *core.root_ids.read().unwrap(),
            vec![test_id(2), test_id(3), test_id(1)]
        );
    }

    #[tokio::test]
    async fn remote_roots_only_replace_when_the_freshest_id_moves() {
        let url = "https://example.com/post";
        let core = core_with_store(Anchor::Url(url.to_string())).await;
        core.store.save_message(record(test_id(1), 100, Some(url))).await;
        core.store.flush().await;
        core.discover_roots_local().await.unwrap();

        // remote returns only an older event: freshest id unchanged
        let key = core.anchor_key.clone();
        let changed = core
            .apply_remote_roots(&key, vec![record(test_id(5), 50, Some(url))])
            .await;
        assert!(!changed);
        assert_eq!(core.root_ids.read().unwrap().first(), Some(&test_id(1)));

        // a fresher remote root takes over
        let changed = core
            .apply_remote_roots(&key, vec![record(test_id(6), 500, Some(url))])
            .await;
        assert!(changed);
        assert_eq!(core.root_ids.read().unwrap().first(), Some(&test_id(6)));
    }

    #[tokio::test]
    async fn address_roots_filter_by_author() {
        let keys = Keys::generate();
        let coordinate =
            Coordinate::new(Kind::LongFormTextNote, keys.public_key()).identifier("slug");
        let core = core_with_store(Anchor::Address(coordinate)).await;

        let mut ours = record(test_id(1), 100, None);
        ours.kind = NoteKind::Article;
        ours.author = keys.public_key();
        ours.identifier = Some("slug".to_string());
        let mut theirs = record(test_id(2), 200, None);
        theirs.kind = NoteKind::Article;
        theirs.identifier = Some("slug".to_string());

        core.store.save_message(ours).await;
        core.store.save_message(theirs).await;
        core.store.flush().await;

        core.discover_roots_local().await.unwrap();
        assert_eq!(*core.root_ids.read().unwrap(), vec![test_id(1)]);
    }
}
