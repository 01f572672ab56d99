use std::collections::HashSet;

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

/// Relays used when the host supplies none, matching the widget defaults.
pub const DEFAULT_RELAYS: [&str; 2] = ["wss://relay.damus.io", "wss://nos.lol"];

/// Closed vocabulary of engine features a host can switch off per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisabledFeature {
    /// Skip like reactions (kind 7) entirely.
    Likes,
    /// Skip zap receipts (kind 9735) entirely.
    Zaps,
    /// Reject `submit` calls.
    Publish,
    /// Close the subscription once the backlog is caught up instead of
    /// staying live.
    Watch,
    Reply,
    ReplyAnonymously,
    HideContent,
}

impl DisabledFeature {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "likes" => Some(Self::Likes),
            "zaps" | "votes" => Some(Self::Zaps),
            "publish" => Some(Self::Publish),
            "watch" => Some(Self::Watch),
            "reply" => Some(Self::Reply),
            "replyAnonymously" => Some(Self::ReplyAnonymously),
            "hideContent" => Some(Self::HideContent),
            _ => None,
        }
    }
}

/// Parses a comma-separated disable list, ignoring unknown tokens.
pub fn parse_disabled_features(value: &str) -> HashSet<DisabledFeature> {
    value
        .split(',')
        .map(str::trim)
        .filter_map(DisabledFeature::from_token)
        .collect()
}

/// The two reaction families the engine aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReactionKind {
    Like,
    Zap,
}

impl ReactionKind {
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Like => 7,
            Self::Zap => 9735,
        }
    }

    pub fn from_u16(kind: u16) -> Option<Self> {
        match kind {
            7 => Some(Self::Like),
            9735 => Some(Self::Zap),
            _ => None,
        }
    }
}

/// Deduplicated totals exposed to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateSnapshot {
    Likes { count: usize },
    Zaps { total_sats: u64, receipts: usize },
}

impl AggregateSnapshot {
    pub(crate) fn empty(kind: ReactionKind) -> Self {
        match kind {
            ReactionKind::Like => Self::Likes { count: 0 },
            ReactionKind::Zap => Self::Zaps {
                total_sats: 0,
                receipts: 0,
            },
        }
    }
}

/// Per-session relay health, surfaced as state instead of errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub connected: Vec<RelayUrl>,
    pub failed: Vec<RelayUrl>,
    /// True once every reachable relay has delivered its backlog.
    pub caught_up: bool,
    pub warning: Option<String>,
}

/// Outcome of a publish, reported per relay rather than all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: EventId,
    pub succeeded: Vec<RelayUrl>,
    pub failed: Vec<RelayUrl>,
}

/// Per-session knobs supplied by the embedding host.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Relay set for this session; falls back to the engine defaults.
    pub relays: Vec<RelayUrl>,
    pub disabled: HashSet<DisabledFeature>,
    /// Identity the host claims to act as; `submit` rejects signers that
    /// don't match it.
    pub external_author: Option<PublicKey>,
    /// Pin an addressable document to a specific version event.
    pub requested_version: Option<EventId>,
}

impl AttachOptions {
    pub fn live(&self) -> bool {
        !self.disabled.contains(&DisabledFeature::Watch)
    }

    pub fn likes_enabled(&self) -> bool {
        !self.disabled.contains(&DisabledFeature::Likes)
    }

    pub fn zaps_enabled(&self) -> bool {
        !self.disabled.contains(&DisabledFeature::Zaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_disable_list_ignoring_unknown_tokens() {
        let parsed = parse_disabled_features("likes, votes,publish,bogus");
        assert!(parsed.contains(&DisabledFeature::Likes));
        assert!(parsed.contains(&DisabledFeature::Zaps));
        assert!(parsed.contains(&DisabledFeature::Publish));
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn watch_disable_makes_session_one_shot() {
        let mut options = AttachOptions::default();
        assert!(options.live());
        options.disabled.insert(DisabledFeature::Watch);
        assert!(!options.live());
    }
}
