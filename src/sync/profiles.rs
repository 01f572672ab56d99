//! Author profile refresh, bounded by the staleness window.

use chrono::Utc;
use nostr_sdk::prelude::*;

use super::{FETCH_TIMEOUT, SyncError};
use crate::store::{LocalStore, ProfileRecord};

/// Fetches kind-0 metadata for every author whose cached profile is missing
/// or older than the staleness window. Fresher metadata wins wholesale;
/// authors that yielded nothing only get their check time bumped so the
/// next sync doesn't hammer the relays again.
pub(crate) async fn refresh_stale_profiles(
    client: &Client,
    store: &LocalStore,
    authors: &[PublicKey],
    relays: &[RelayUrl],
) -> Result<(), SyncError> {
    if authors.is_empty() || relays.is_empty() {
        return Ok(());
    }
    let now = Utc::now().timestamp() as u64;
    let stale = store.stale_profiles(authors, now).await?;
    if stale.is_empty() {
        return Ok(());
    }
    tracing::debug!(
        target: "threadstr::sync::refresh_stale_profiles",
        "refreshing {} stale profiles",
        stale.len()
    );

    let filter = Filter::new()
        .kind(Kind::Metadata)
        .authors(stale.iter().copied());
    let events = client
        .fetch_events_from(relays.to_vec(), filter, FETCH_TIMEOUT)
        .await?;

    for event in events.into_iter() {
        let Ok(metadata) = Metadata::from_json(&event.content) else {
            tracing::debug!(
                target: "threadstr::sync::refresh_stale_profiles",
                "skipping undecodable metadata from {}",
                event.pubkey
            );
            continue;
        };
        let record = ProfileRecord {
            pubkey: event.pubkey,
            display_name: metadata.display_name.or(metadata.name),
            picture_url: metadata.picture,
            metadata_at: event.created_at.as_u64(),
            last_checked_at: now,
        };
        store.apply_profile(&record).await?;
    }

    store.touch_profiles(&stale, now).await?;
    Ok(())
}
