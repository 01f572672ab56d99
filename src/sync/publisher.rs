//! Comment publishing: NIP-10 tag construction, signing through the
//! injected capability, optimistic local write, per-relay result
//! reporting.

use nostr_sdk::prelude::*;

use super::ThreadSession;
use crate::anchor::Anchor;
use crate::error::{Result, ThreadstrError};
use crate::normalizer::note_record_from_event;
use crate::store::NoteRecord;
use crate::types::{DisabledFeature, PublishReport};

fn e_marker_tag(id: &EventId, marker: &str) -> Tag {
    Tag::custom(
        TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::E)),
        vec![id.to_hex(), String::new(), marker.to_string()],
    )
}

/// Builds the reference tags for a new comment: the thread root (an `a` tag
/// for addressable anchors, an `e` tag otherwise), a `reply` marker when
/// answering a nested comment, the parent author's `p` tag, and the `r` tag
/// that keeps URL-anchored threads discoverable.
pub(crate) fn comment_tags(
    anchor: &Anchor,
    roots: &[EventId],
    parent: Option<&NoteRecord>,
    root_author: Option<PublicKey>,
) -> Vec<Tag> {
    let mut tags = Vec::new();

    match anchor {
        Anchor::Address(coordinate) => {
            tags.push(Tag::custom(
                TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::A)),
                vec![coordinate.to_string(), String::new(), "root".to_string()],
            ));
        }
        _ => {
            if let Some(root) = roots.first() {
                tags.push(e_marker_tag(root, "root"));
            }
        }
    }

    if let Anchor::Url(url) = anchor {
        tags.push(Tag::custom(
            TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::R)),
            vec![url.clone()],
        ));
    }

    match parent {
        // Top-level replies carry only the root marker.
        Some(record) if !roots.contains(&record.id) => {
            tags.push(e_marker_tag(&record.id, "reply"));
            tags.push(Tag::public_key(record.author));
        }
        Some(record) => tags.push(Tag::public_key(record.author)),
        None => {
            if let Some(author) = root_author {
                tags.push(Tag::public_key(author));
            }
        }
    }

    tags
}

impl ThreadSession {
    /// Signs and publishes a comment on this session's anchor.
    ///
    /// The signed event is written locally before the network round-trip,
    /// so the thread reflects it immediately. Publishing is reported per
    /// relay; only zero successes is an error, and the error carries the
    /// signed event so the caller can retry without recomposing.
    pub async fn submit<S>(
        &self,
        content: &str,
        reply_to: Option<EventId>,
        signer: S,
    ) -> Result<PublishReport>
    where
        S: NostrSigner + 'static,
    {
        if self
            .core
            .options
            .disabled
            .contains(&DisabledFeature::Publish)
        {
            return Err(ThreadstrError::PublishDisabled);
        }
        if self.core.relays.is_empty() {
            return Err(ThreadstrError::NoRelaysAvailable);
        }

        let provided = signer.get_public_key().await?;
        if let Some(expected) = self.core.options.external_author {
            if expected != provided {
                return Err(ThreadstrError::SignerMismatch { expected, provided });
            }
        }

        let parent = match reply_to {
            Some(id) => self.core.store.message(&id).await?,
            None => None,
        };
        let roots = self.core.root_ids.read().unwrap().clone();
        let root_author = match roots.first() {
            Some(id) => self.core.store.message(id).await?.map(|record| record.author),
            None => None,
        };

        let tags = comment_tags(&self.core.anchor, &roots, parent.as_ref(), root_author);
        let event = EventBuilder::text_note(content.trim())
            .tags(tags)
            .sign(&signer)
            .await?;

        // Optimistic local echo, independent of publish confirmation.
        if let Some(record) = note_record_from_event(&event) {
            self.core.store.save_message_now(record).await?;
        }

        let output = self
            .core
            .client
            .send_event_to(self.core.relays.clone(), &event)
            .await?;
        let succeeded: Vec<RelayUrl> = output.success.iter().cloned().collect();
        let failed: Vec<RelayUrl> = output.failed.keys().cloned().collect();

        if succeeded.is_empty() {
            return Err(ThreadstrError::PublishFailed {
                event: Box::new(event),
                failed,
            });
        }

        tracing::info!(
            target: "threadstr::sync::submit",
            "published {} to {}/{} relays",
            event.id,
            succeeded.len(),
            succeeded.len() + failed.len()
        );

        Ok(PublishReport {
            event_id: *output.id(),
            succeeded,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NoteKind;

    fn test_id(byte: u8) -> EventId {
        EventId::from_slice(&[byte; 32]).unwrap()
    }

    fn record(id: EventId, author: PublicKey) -> NoteRecord {
        NoteRecord {
            id,
            kind: NoteKind::Comment,
            content: "parent".to_string(),
            created_at: 100,
            author,
            root_id: None,
            reply_id: None,
            mention_ids: vec![],
            address: None,
            address_is_mention: false,
            url: None,
            topics: vec![],
            identifier: None,
            title: None,
        }
    }

    fn tag_slices(tags: &[Tag]) -> Vec<Vec<String>> {
        tags.iter().map(|tag| tag.as_slice().to_vec()).collect()
    }

    #[test]
    fn top_level_url_comment_carries_root_and_url_tags() {
        let root = test_id(1);
        let root_author = Keys::generate().public_key();
        let anchor = Anchor::Url("https://example.com/post".to_string());

        let tags = comment_tags(&anchor, &[root], None, Some(root_author));
        let slices = tag_slices(&tags);
        assert!(slices.contains(&vec![
            "e".to_string(),
            root.to_hex(),
            String::new(),
            "root".to_string()
        ]));
        assert!(slices.contains(&vec![
            "r".to_string(),
            "https://example.com/post".to_string()
        ]));
        assert!(slices.contains(&vec!["p".to_string(), root_author.to_hex()]));
    }

    #[test]
    fn nested_reply_gets_reply_marker_and_parent_p_tag() {
        let root = test_id(1);
        let parent_author = Keys::generate().public_key();
        let parent = record(test_id(2), parent_author);
        let anchor = Anchor::Note(root);

        let tags = comment_tags(&anchor, &[root], Some(&parent), None);
        let slices = tag_slices(&tags);
        assert!(slices.contains(&vec![
            "e".to_string(),
            root.to_hex(),
            String::new(),
            "root".to_string()
        ]));
        assert!(slices.contains(&vec![
            "e".to_string(),
            parent.id.to_hex(),
            String::new(),
            "reply".to_string()
        ]));
        assert!(slices.contains(&vec!["p".to_string(), parent_author.to_hex()]));
    }

    #[test]
    fn replying_to_the_root_itself_uses_only_the_root_marker() {
        let root = test_id(1);
        let root_author = Keys::generate().public_key();
        let parent = record(root, root_author);
        let anchor = Anchor::Note(root);

        let tags = comment_tags(&anchor, &[root], Some(&parent), None);
        let slices = tag_slices(&tags);
        assert_eq!(
            slices
                .iter()
                .filter(|slice| slice.first().map(String::as_str) == Some("e"))
                .count(),
            1
        );
        assert!(slices.contains(&vec!["p".to_string(), root_author.to_hex()]));
    }

    #[test]
    fn address_anchor_comment_roots_at_the_coordinate() {
        let keys = Keys::generate();
        let coordinate =
            Coordinate::new(Kind::LongFormTextNote, keys.public_key()).identifier("slug");
        let anchor = Anchor::Address(coordinate.clone());

        let tags = comment_tags(&anchor, &[], None, None);
        let slices = tag_slices(&tags);
        assert!(slices.contains(&vec![
            "a".to_string(),
            coordinate.to_string(),
            String::new(),
            "root".to_string()
        ]));
    }
}
