//! Reply-tree reconstruction.
//!
//! A pure function over the full materialized message set for an anchor:
//! arrival order never matters, only the reference tags. Parents are carried
//! as ids and resolved through the working map, so the output contains no
//! object cycles.

use std::collections::{HashMap, HashSet};

use nostr_sdk::prelude::*;

use crate::store::messages::{NoteKind, NoteRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedNote {
    pub note: NoteRecord,
    /// Structural parent id, resolvable through the store.
    pub parent_id: Option<EventId>,
    /// The parent was referenced but is absent from the working set, or the
    /// reference was malformed. Shown at the top level with a warning
    /// instead of being silently misplaced.
    pub unattached: bool,
    pub children: Vec<NestedNote>,
}

impl NestedNote {
    fn new(note: NoteRecord, parent_id: Option<EventId>, unattached: bool) -> Self {
        Self {
            note,
            parent_id,
            unattached,
            children: Vec::new(),
        }
    }

    /// Recursive descendant count, for "N comments" headers.
    pub fn total_children(&self) -> usize {
        self.children
            .iter()
            .fold(self.children.len(), |acc, child| {
                acc + child.total_children()
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiblingOrder {
    /// Newest first, the default threaded view.
    #[default]
    NewestFirst,
    /// Oldest first, for flattened chat-style views.
    Chronological,
}

/// Builds the reply forest for a message set with no externally-known roots.
pub fn nest(notes: Vec<NoteRecord>, order: SiblingOrder) -> Vec<NestedNote> {
    nest_under(notes, &HashSet::new(), order)
}

/// Builds the reply forest treating `roots` as virtual parents: a message
/// whose parent is one of them is top-level, not unattached.
///
/// Single adjacency-map grouping pass, then one tree-build pass.
pub fn nest_under(
    notes: Vec<NoteRecord>,
    roots: &HashSet<EventId>,
    order: SiblingOrder,
) -> Vec<NestedNote> {
    let present: HashSet<EventId> = notes.iter().map(|note| note.id).collect();
    let mut top: Vec<NestedNote> = Vec::new();
    let mut children_of: HashMap<EventId, Vec<NoteRecord>> = HashMap::new();

    for note in notes {
        match note.parent_id() {
            None => top.push(NestedNote::new(note, None, false)),
            // Self-reference is malformed input; surface it, never loop.
            Some(parent) if parent == note.id => {
                top.push(NestedNote::new(note, Some(parent), true))
            }
            Some(parent) if present.contains(&parent) => {
                children_of.entry(parent).or_default().push(note)
            }
            Some(parent) if roots.contains(&parent) => {
                top.push(NestedNote::new(note, Some(parent), false))
            }
            // Parent lives in another, not-yet-fetched thread.
            Some(parent) => top.push(NestedNote::new(note, Some(parent), true)),
        }
    }

    for node in &mut top {
        attach_children(node, &mut children_of);
    }

    // Whatever is left references only other leftovers: a reference cycle.
    // Promote the members instead of dropping them.
    while let Some(&parent) = children_of.keys().next() {
        let orphans = children_of.remove(&parent).unwrap_or_default();
        for note in orphans {
            let parent_id = note.parent_id();
            let mut node = NestedNote::new(note, parent_id, true);
            attach_children(&mut node, &mut children_of);
            top.push(node);
        }
    }

    sort_forest(&mut top, order);
    top
}

fn attach_children(node: &mut NestedNote, children_of: &mut HashMap<EventId, Vec<NoteRecord>>) {
    if let Some(children) = children_of.remove(&node.note.id) {
        node.children = children
            .into_iter()
            .map(|note| {
                let parent_id = note.parent_id();
                NestedNote::new(note, parent_id, false)
            })
            .collect();
        for child in &mut node.children {
            attach_children(child, children_of);
        }
    }
}

fn sort_forest(forest: &mut [NestedNote], order: SiblingOrder) {
    forest.sort_by(|a, b| {
        let ordering = match order {
            SiblingOrder::NewestFirst => b.note.created_at.cmp(&a.note.created_at),
            SiblingOrder::Chronological => a.note.created_at.cmp(&b.note.created_at),
        };
        // Ties broken by id so the shape is deterministic for any
        // permutation of the input.
        ordering.then_with(|| a.note.id.cmp(&b.note.id))
    });
    for node in forest {
        sort_forest(&mut node.children, order);
    }
}

/// Collapses a forest into a flat, childless list in display order, for the
/// chat-style view.
pub fn flatten(forest: &[NestedNote]) -> Vec<NoteRecord> {
    let mut result = Vec::new();
    fn walk(node: &NestedNote, result: &mut Vec<NoteRecord>) {
        result.push(node.note.clone());
        for child in &node.children {
            walk(child, result);
        }
    }
    for node in forest {
        walk(node, &mut result);
    }
    result
}

/// Drops top-level highlights nobody commented on; only highlights that
/// gathered replies are worth rendering as thread roots.
pub fn prune_childless_highlights(forest: Vec<NestedNote>) -> Vec<NestedNote> {
    forest
        .into_iter()
        .filter(|node| !(node.note.kind == NoteKind::Highlight && node.children.is_empty()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id(byte: u8) -> EventId {
        EventId::from_slice(&[byte; 32]).unwrap()
    }

    fn pubkey() -> PublicKey {
        Keys::generate().public_key()
    }

    fn note(
        id: EventId,
        created_at: u64,
        root_id: Option<EventId>,
        reply_id: Option<EventId>,
    ) -> NoteRecord {
        NoteRecord {
            id,
            kind: NoteKind::Comment,
            content: format!("note {created_at}"),
            created_at,
            author: pubkey(),
            root_id,
            reply_id,
            mention_ids: vec![],
            address: None,
            address_is_mention: false,
            url: None,
            topics: vec![],
            identifier: None,
            title: None,
        }
    }

    #[test]
    fn builds_three_level_thread() {
        let r1 = test_id(1);
        let c1 = test_id(2);
        let c2 = test_id(3);
        let notes = vec![
            note(r1, 10, None, None),
            note(c1, 20, Some(r1), Some(r1)),
            note(c2, 30, Some(r1), Some(c1)),
        ];

        let forest = nest(notes, SiblingOrder::NewestFirst);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].note.id, r1);
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].note.id, c1);
        assert_eq!(forest[0].children[0].children[0].note.id, c2);
        assert_eq!(forest[0].total_children(), 2);
    }

    #[test]
    fn shape_is_independent_of_arrival_order() {
        let r1 = test_id(1);
        let c1 = test_id(2);
        let c2 = test_id(3);
        let c3 = test_id(4);
        let base = vec![
            note(r1, 10, None, None),
            note(c1, 20, Some(r1), Some(r1)),
            note(c2, 30, Some(r1), Some(c1)),
            note(c3, 40, Some(r1), None),
        ];

        let reference = nest(base.clone(), SiblingOrder::NewestFirst);
        // a few deterministic permutations
        for rotation in 1..base.len() {
            let mut permuted = base.clone();
            permuted.rotate_left(rotation);
            assert_eq!(nest(permuted, SiblingOrder::NewestFirst), reference);
        }
    }

    #[test]
    fn orphaned_reference_is_flagged_top_level() {
        let elsewhere = test_id(99);
        let orphan = note(test_id(1), 10, Some(elsewhere), None);

        let forest = nest(vec![orphan], SiblingOrder::NewestFirst);
        assert_eq!(forest.len(), 1);
        assert!(forest[0].unattached);
        assert_eq!(forest[0].parent_id, Some(elsewhere));
    }

    #[test]
    fn known_roots_are_not_orphans() {
        let root = test_id(9);
        let child = note(test_id(1), 10, Some(root), None);
        let roots = HashSet::from([root]);

        let forest = nest_under(vec![child], &roots, SiblingOrder::NewestFirst);
        assert_eq!(forest.len(), 1);
        assert!(!forest[0].unattached);
    }

    #[test]
    fn self_reference_does_not_loop() {
        let id = test_id(1);
        let looped = note(id, 10, Some(id), Some(id));

        let forest = nest(vec![looped], SiblingOrder::NewestFirst);
        assert_eq!(forest.len(), 1);
        assert!(forest[0].unattached);
    }

    #[test]
    fn mutual_cycle_members_are_surfaced() {
        let a = test_id(1);
        let b = test_id(2);
        let notes = vec![note(a, 10, None, Some(b)), note(b, 20, None, Some(a))];

        let forest = nest(notes, SiblingOrder::NewestFirst);
        let mut surfaced: Vec<EventId> = flatten(&forest).iter().map(|n| n.id).collect();
        surfaced.sort();
        assert_eq!(surfaced, vec![a, b]);
    }

    #[test]
    fn siblings_sort_newest_first_by_default() {
        let root = test_id(1);
        let old = note(test_id(2), 10, Some(root), Some(root));
        let new = note(test_id(3), 99, Some(root), Some(root));
        let notes = vec![note(root, 5, None, None), old, new];

        let forest = nest(notes, SiblingOrder::NewestFirst);
        let children: Vec<u64> = forest[0].children.iter().map(|c| c.note.created_at).collect();
        assert_eq!(children, vec![99, 10]);

        // chronological order for the flattened view
        let r1 = test_id(1);
        let notes = vec![
            note(r1, 5, None, None),
            note(test_id(2), 10, Some(r1), Some(r1)),
            note(test_id(3), 99, Some(r1), Some(r1)),
        ];
        let forest = nest(notes, SiblingOrder::Chronological);
        let children: Vec<u64> = forest[0].children.iter().map(|c| c.note.created_at).collect();
        assert_eq!(children, vec![10, 99]);
    }

    #[test]
    fn childless_highlights_are_pruned() {
        let mut highlight = note(test_id(1), 10, None, None);
        highlight.kind = NoteKind::Highlight;
        let keeper = note(test_id(2), 20, None, None);

        let forest = nest(vec![highlight, keeper], SiblingOrder::NewestFirst);
        let pruned = prune_childless_highlights(forest);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].note.id, test_id(2));
    }
}
