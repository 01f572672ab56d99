//! Converts raw signed events into compact [`NoteRecord`]s.
//!
//! Reference tags follow the marked convention: `["e", <id>, <relay hint>,
//! <root|reply|mention>]`. Events predating markers use the positional
//! convention, which is still honored: with two or more unmarked references
//! the first is the root and the last the reply.

use nostr_sdk::prelude::*;

use crate::store::messages::{NoteKind, NoteRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nip10Refs {
    pub root: Option<EventId>,
    pub reply: Option<EventId>,
    pub mentions: Vec<EventId>,
}

/// Extracts root/reply/mention references from an event's e-tags.
pub fn parse_refs(event: &Event) -> Nip10Refs {
    let mut marked_root = None;
    let mut marked_reply = None;
    let mut has_markers = false;
    // (id, marker) in tag order
    let mut refs: Vec<(EventId, Option<String>)> = Vec::new();

    for tag in event.tags.iter() {
        let parts = tag.as_slice();
        if parts.first().map(String::as_str) != Some("e") {
            continue;
        }
        let Some(id) = parts.get(1).and_then(|raw| EventId::parse(raw).ok()) else {
            continue;
        };
        let marker = parts.get(3).filter(|m| !m.is_empty()).cloned();
        if marker.is_some() {
            has_markers = true;
        }
        refs.push((id, marker));
    }

    let mut mentions = Vec::new();

    if has_markers {
        for (id, marker) in refs {
            match marker.as_deref() {
                Some("root") if marked_root.is_none() => marked_root = Some(id),
                Some("reply") if marked_reply.is_none() => marked_reply = Some(id),
                _ => mentions.push(id),
            }
        }
        return Nip10Refs {
            root: marked_root,
            reply: marked_reply,
            mentions,
        };
    }

    // Deprecated positional convention.
    let count = refs.len();
    let mut root = None;
    let mut reply = None;
    for (position, (id, _)) in refs.into_iter().enumerate() {
        if position == 0 && count > 1 {
            root = Some(id);
        } else if position + 1 == count {
            reply = Some(id);
        } else {
            mentions.push(id);
        }
    }
    Nip10Refs {
        root,
        reply,
        mentions,
    }
}

/// Normalizes a raw event into a store record. Returns `None` for kinds the
/// engine does not persist.
pub fn note_record_from_event(event: &Event) -> Option<NoteRecord> {
    let kind = NoteKind::from_u16(event.kind.as_u16())?;
    let refs = parse_refs(event);

    let mut address = None;
    let mut address_is_mention = false;
    let mut url = None;
    let mut identifier = None;
    let mut title = None;
    let mut topics: Vec<String> = Vec::new();

    for tag in event.tags.iter() {
        let parts = tag.as_slice();
        let (Some(name), Some(value)) = (parts.first(), parts.get(1)) else {
            continue;
        };
        match name.as_str() {
            "a" if address.is_none() => {
                address = Some(value.clone());
                address_is_mention = parts.get(3).map(String::as_str) == Some("mention");
            }
            "r" if url.is_none() => url = Some(value.clone()),
            "d" if identifier.is_none() => identifier = Some(value.clone()),
            "title" if title.is_none() => title = Some(value.clone()),
            "t" if !topics.contains(value) => topics.push(value.clone()),
            _ => {}
        }
    }

    Some(NoteRecord {
        id: event.id,
        kind,
        content: event.content.clone(),
        created_at: event.created_at.as_u64(),
        author: event.pubkey,
        root_id: refs.root,
        reply_id: refs.reply,
        mention_ids: refs.mentions,
        address,
        address_is_mention,
        url,
        topics,
        identifier,
        title,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e_tag(id: &EventId, marker: &str) -> Tag {
        Tag::custom(
            TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::E)),
            vec![id.to_hex(), String::new(), marker.to_string()],
        )
    }

    fn bare_e_tag(id: &EventId) -> Tag {
        Tag::custom(
            TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::E)),
            vec![id.to_hex()],
        )
    }

    fn test_id(byte: u8) -> EventId {
        EventId::from_slice(&[byte; 32]).unwrap()
    }

    fn signed(builder: EventBuilder) -> Event {
        builder.sign_with_keys(&Keys::generate()).unwrap()
    }

    #[test]
    fn marked_tags_take_precedence() {
        let root = test_id(1);
        let reply = test_id(2);
        let mention = test_id(3);
        let event = signed(
            EventBuilder::text_note("hello")
                .tag(e_tag(&mention, "mention"))
                .tag(e_tag(&reply, "reply"))
                .tag(e_tag(&root, "root")),
        );

        let refs = parse_refs(&event);
        assert_eq!(refs.root, Some(root));
        assert_eq!(refs.reply, Some(reply));
        assert_eq!(refs.mentions, vec![mention]);
    }

    #[test]
    fn positional_convention_uses_first_and_last() {
        let first = test_id(1);
        let middle = test_id(2);
        let last = test_id(3);
        let event = signed(
            EventBuilder::text_note("hi")
                .tag(bare_e_tag(&first))
                .tag(bare_e_tag(&middle))
                .tag(bare_e_tag(&last)),
        );

        let refs = parse_refs(&event);
        assert_eq!(refs.root, Some(first));
        assert_eq!(refs.reply, Some(last));
        assert_eq!(refs.mentions, vec![middle]);
    }

    #[test]
    fn single_unmarked_reference_is_the_reply() {
        let only = test_id(9);
        let event = signed(EventBuilder::text_note("hi").tag(bare_e_tag(&only)));

        let refs = parse_refs(&event);
        assert_eq!(refs.root, None);
        assert_eq!(refs.reply, Some(only));
        assert!(refs.mentions.is_empty());
    }

    #[test]
    fn normalizes_anchoring_tags() {
        let event = signed(
            EventBuilder::text_note("body")
                .tag(Tag::custom(
                    TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::R)),
                    vec!["https://example.com/post".to_string()],
                ))
                .tag(Tag::custom(
                    TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::T)),
                    vec!["rust".to_string()],
                ))
                .tag(Tag::custom(
                    TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::T)),
                    vec!["rust".to_string()],
                )),
        );

        let record = note_record_from_event(&event).unwrap();
        assert_eq!(record.kind, NoteKind::Comment);
        assert_eq!(record.url.as_deref(), Some("https://example.com/post"));
        // duplicate topics collapse
        assert_eq!(record.topics, vec!["rust".to_string()]);
    }

    #[test]
    fn unsupported_kinds_are_dropped() {
        let event = signed(EventBuilder::new(Kind::Metadata, "{}"));
        assert!(note_record_from_event(&event).is_none());
    }
}
