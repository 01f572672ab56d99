//! Reaction and zap-receipt extraction.
//!
//! Raw reaction events are deduplicated by author (latest vote wins) and
//! zap receipts by id; the merge itself lives with the aggregates store
//! family so it runs inside one transaction.

use std::collections::HashMap;
use std::str::FromStr;

use lightning_invoice::Bolt11Invoice;
use nostr_sdk::prelude::*;

/// One raw like/dislike event, reduced to what voting needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeVote {
    pub id: EventId,
    pub author: PublicKey,
    pub created_at: u64,
    pub positive: bool,
}

/// One zap receipt with its decoded amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZapReceipt {
    pub id: EventId,
    pub amount_sats: u64,
}

/// A `-` body is a downvote; everything else (including `+`, emoji and an
/// empty body) counts as positive.
pub(crate) fn like_from_event(event: &Event) -> LikeVote {
    LikeVote {
        id: event.id,
        author: event.pubkey,
        created_at: event.created_at.as_u64(),
        positive: event.content.trim() != "-",
    }
}

/// Extracts the receipt amount from the invoice carried in the `bolt11`
/// tag. Receipts without a decodable amount are ignored.
pub(crate) fn zap_from_event(event: &Event) -> Option<ZapReceipt> {
    let invoice = event
        .tags
        .iter()
        .map(|tag| tag.as_slice())
        .find(|parts| parts.first().map(String::as_str) == Some("bolt11"))
        .and_then(|parts| parts.get(1))?;
    let amount_sats = invoice_amount_sats(invoice)?;
    Some(ZapReceipt {
        id: event.id,
        amount_sats,
    })
}

/// Decodes a BOLT11 invoice down to its amount in sats.
pub fn invoice_amount_sats(bolt11: &str) -> Option<u64> {
    let invoice = Bolt11Invoice::from_str(bolt11).ok()?;
    invoice.amount_milli_satoshis().map(|msat| msat / 1000)
}

/// Reactions and receipts buffered per subscription between the first event
/// and the end-of-backlog flush. Keyed by id, so duplicate deliveries
/// collapse before they ever reach the store.
#[derive(Debug, Default)]
pub(crate) struct ReactionBuffer {
    likes: HashMap<EventId, LikeVote>,
    zaps: HashMap<EventId, u64>,
}

impl ReactionBuffer {
    pub(crate) fn add_like(&mut self, vote: LikeVote) {
        self.likes.insert(vote.id, vote);
    }

    pub(crate) fn add_zap(&mut self, receipt: ZapReceipt) {
        self.zaps.insert(receipt.id, receipt.amount_sats);
    }

    pub(crate) fn drain(&mut self) -> (Vec<LikeVote>, Vec<ZapReceipt>) {
        let likes = self.likes.drain().map(|(_, vote)| vote).collect();
        let zaps = self
            .zaps
            .drain()
            .map(|(id, amount_sats)| ZapReceipt { id, amount_sats })
            .collect();
        (likes, zaps)
    }
}
