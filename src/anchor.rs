//! Resolution of host-supplied references into canonical anchors.
//!
//! A discussion can be attached to a plain URL, a single note, or an
//! addressable long-form document. Whatever the host passes in is resolved
//! here exactly once; everything downstream keys off [`Anchor::key`].

use nostr_sdk::prelude::*;

/// Canonical identity of the content a thread hangs off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// An external web page, with the URL normalized.
    Url(String),
    /// A single note; the id is definitive.
    Note(EventId),
    /// An addressable document (`kind:pubkey:identifier`).
    Address(Coordinate),
    /// The reference failed to decode. Rendered, never thrown.
    Malformed(String),
}

impl Anchor {
    /// Resolves an opaque reference string.
    ///
    /// Accepts `http(s)` URLs and NIP-19 `note`, `nevent` and `naddr`
    /// entities. Anything else resolves to [`Anchor::Malformed`] so the
    /// caller can render a diagnostic instead of crashing.
    pub fn parse(reference: &str, legacy_urls: bool) -> Self {
        let reference = reference.trim();
        if reference.is_empty() {
            return Self::Malformed("empty anchor reference".to_string());
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Self::Url(normalize_url(reference, legacy_urls));
        }
        if let Ok(id) = EventId::from_bech32(reference) {
            return Self::Note(id);
        }
        if let Ok(nevent) = Nip19Event::from_bech32(reference) {
            return Self::Note(nevent.event_id);
        }
        if let Ok(naddr) = Nip19Coordinate::from_bech32(reference) {
            return Self::Address(naddr.coordinate);
        }
        Self::Malformed(format!(
            "only URLs and NIP-19 note, nevent and naddr entities are supported, got: {reference}"
        ))
    }

    /// Stable store key for this anchor.
    pub fn key(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Note(id) => id.to_hex(),
            Self::Address(coordinate) => coordinate.to_string(),
            Self::Malformed(diagnostic) => diagnostic.clone(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Strips the fragment and, outside legacy mode, trailing slashes, so that
/// `https://x.com/a` and `https://x.com/a/` land on the same anchor key.
pub(crate) fn normalize_url(raw: &str, legacy: bool) -> String {
    let without_fragment = match raw.find('#') {
        Some(position) => &raw[..position],
        None => raw,
    };
    if legacy {
        without_fragment.to_string()
    } else {
        without_fragment.trim_end_matches('/').to_string()
    }
}
