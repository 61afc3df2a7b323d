//! Reply tree for one discussion.
//!
//! The tree is built once from the flat record set and afterwards only patched
//! in place: inserts append (or prepend at the top level), updates overwrite
//! fields of an existing node. Replies whose parent is unknown are parked as
//! orphans and retried after every successful attach.

use std::collections::{HashMap, HashSet};

use crate::models::{CommentNode, CommentPatch, CommentRecord};

/// Where a new top-level comment goes. Replies are always appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Front,
    Back,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record is in the tree. `resolved` lists orphans that could be
    /// attached as a consequence, in attach order.
    Attached { resolved: Vec<String> },
    Orphaned,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    Deferred,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscussionTree {
    roots: Vec<CommentNode>,
    orphans: Vec<CommentRecord>,
    deferred: HashMap<String, CommentPatch>,
}

impl DiscussionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the tree from a flat, newest-first record set.
    ///
    /// Top-level order and the order inside each parent bucket follow the
    /// input. Duplicate ids keep their first occurrence. Records whose parent
    /// is not reachable from a top-level comment become pending orphans, in
    /// input order.
    pub fn organize(records: Vec<CommentRecord>) -> Self {
        let mut seen = HashSet::new();
        let mut top = Vec::new();
        let mut buckets: HashMap<String, Vec<(usize, CommentRecord)>> = HashMap::new();

        for (idx, record) in records.into_iter().enumerate() {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            match record.parent_id.clone() {
                None => top.push(record),
                Some(parent) => buckets.entry(parent).or_default().push((idx, record)),
            }
        }

        let roots = top
            .into_iter()
            .map(|record| build_node(record, &mut buckets))
            .collect();

        let mut leftovers: Vec<(usize, CommentRecord)> = buckets.into_values().flatten().collect();
        leftovers.sort_by_key(|(idx, _)| *idx);

        Self {
            roots,
            orphans: leftovers.into_iter().map(|(_, record)| record).collect(),
            deferred: HashMap::new(),
        }
    }

    pub fn roots(&self) -> &[CommentNode] {
        &self.roots
    }

    pub fn orphans(&self) -> &[CommentRecord] {
        &self.orphans
    }

    /// Ids with an update waiting for the node to show up.
    pub fn deferred_ids(&self) -> impl Iterator<Item = &str> {
        self.deferred.keys().map(String::as_str)
    }

    /// Number of nodes attached to the tree (orphans excluded).
    pub fn len(&self) -> usize {
        self.roots.iter().map(CommentNode::subtree_len).sum()
    }

    /// No attached nodes. Pending orphans do not count, as in `len`.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<&CommentNode> {
        find_in(&self.roots, id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut CommentNode> {
        find_in_mut(&mut self.roots, id)
    }

    pub fn is_orphan(&self, id: &str) -> bool {
        self.orphans.iter().any(|r| r.id == id)
    }

    /// True if the id is known anywhere, attached or pending.
    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some() || self.is_orphan(id)
    }

    pub fn insert(&mut self, record: CommentRecord, placement: Placement) -> InsertOutcome {
        if self.contains(&record.id) {
            return InsertOutcome::Duplicate;
        }
        match self.attach(record, placement) {
            Ok(()) => InsertOutcome::Attached {
                resolved: self.resolve_orphans(),
            },
            Err(record) => {
                self.orphans.push(record);
                InsertOutcome::Orphaned
            }
        }
    }

    /// Patches the node in place, wherever it sits. Unknown ids are buffered
    /// and replayed when the node is attached.
    pub fn apply_patch(&mut self, patch: CommentPatch) -> PatchOutcome {
        if let Some(node) = find_in_mut(&mut self.roots, &patch.id) {
            node.record.apply(&patch);
            return PatchOutcome::Applied;
        }
        match self.deferred.get_mut(&patch.id) {
            Some(existing) => existing.merge(patch),
            None => {
                self.deferred.insert(patch.id.clone(), patch);
            }
        }
        PatchOutcome::Deferred
    }

    /// Retries every pending orphan until no more can be attached.
    pub fn resolve_orphans(&mut self) -> Vec<String> {
        let mut resolved = Vec::new();
        loop {
            let mut progressed = false;
            for record in std::mem::take(&mut self.orphans) {
                let id = record.id.clone();
                match self.attach(record, Placement::Back) {
                    Ok(()) => {
                        resolved.push(id);
                        progressed = true;
                    }
                    Err(record) => self.orphans.push(record),
                }
            }
            if !progressed {
                return resolved;
            }
        }
    }

    /// Detaches a node together with its replies.
    pub fn remove(&mut self, id: &str) -> Option<CommentNode> {
        if let Some(pos) = self.orphans.iter().position(|r| r.id == id) {
            return Some(CommentNode::new(self.orphans.remove(pos)));
        }
        remove_from(&mut self.roots, id)
    }

    /// Swaps the record of a locally created node for the stored one, keeping
    /// its position and replies. When the stored copy is already in the tree
    /// the local node is dropped instead. Returns false if `local_id` is gone.
    pub fn confirm(&mut self, local_id: &str, mut confirmed: CommentRecord) -> bool {
        if confirmed.id != local_id && self.contains(&confirmed.id) {
            self.remove(local_id);
            return false;
        }
        if let Some(patch) = self.deferred.remove(&confirmed.id) {
            confirmed.apply(&patch);
        }
        match find_in_mut(&mut self.roots, local_id) {
            Some(node) => {
                node.record = confirmed;
                self.resolve_orphans();
                true
            }
            None => false,
        }
    }

    /// Folds an authoritative newest-first record set into the existing tree.
    ///
    /// Known ids take the stored text and like count; unknown ids are
    /// inserted as if they had arrived through the change stream. Returns the
    /// number of records that changed the tree.
    pub fn reconcile(&mut self, records: Vec<CommentRecord>) -> usize {
        let mut changed = 0;
        for record in records.into_iter().rev() {
            if let Some(node) = find_in_mut(&mut self.roots, &record.id) {
                if node.record != record {
                    node.record.text = record.text;
                    node.record.like_count = record.like_count;
                    changed += 1;
                }
                continue;
            }
            if let Some(orphan) = self.orphans.iter_mut().find(|r| r.id == record.id) {
                *orphan = record;
                continue;
            }
            if let InsertOutcome::Attached { resolved } = self.insert(record, Placement::Front) {
                changed += 1 + resolved.len();
            }
        }
        changed
    }

    fn attach(&mut self, record: CommentRecord, placement: Placement) -> Result<(), CommentRecord> {
        let mut node = CommentNode::new(record);
        let parent_id = match node.record.parent_id.clone() {
            Some(parent_id) => parent_id,
            None => {
                self.replay_deferred(&mut node);
                match placement {
                    Placement::Front => self.roots.insert(0, node),
                    Placement::Back => self.roots.push(node),
                }
                return Ok(());
            }
        };
        if find_in(&self.roots, &parent_id).is_none() {
            return Err(node.record);
        }
        self.replay_deferred(&mut node);
        if let Some(parent) = find_in_mut(&mut self.roots, &parent_id) {
            parent.replies.push(node);
        }
        Ok(())
    }

    fn replay_deferred(&mut self, node: &mut CommentNode) {
        if let Some(patch) = self.deferred.remove(&node.record.id) {
            node.record.apply(&patch);
        }
    }
}

fn build_node(
    record: CommentRecord,
    buckets: &mut HashMap<String, Vec<(usize, CommentRecord)>>,
) -> CommentNode {
    let children = buckets.remove(&record.id).unwrap_or_default();
    let replies = children
        .into_iter()
        .map(|(_, child)| build_node(child, buckets))
        .collect();
    CommentNode { record, replies }
}

fn find_in<'a>(nodes: &'a [CommentNode], id: &str) -> Option<&'a CommentNode> {
    for node in nodes {
        if node.record.id == id {
            return Some(node);
        }
        if let Some(found) = find_in(&node.replies, id) {
            return Some(found);
        }
    }
    None
}

fn find_in_mut<'a>(nodes: &'a mut [CommentNode], id: &str) -> Option<&'a mut CommentNode> {
    for node in nodes.iter_mut() {
        if node.record.id == id {
            return Some(node);
        }
        if let Some(found) = find_in_mut(&mut node.replies, id) {
            return Some(found);
        }
    }
    None
}

fn remove_from(nodes: &mut Vec<CommentNode>, id: &str) -> Option<CommentNode> {
    if let Some(pos) = nodes.iter().position(|n| n.record.id == id) {
        return Some(nodes.remove(pos));
    }
    nodes
        .iter_mut()
        .find_map(|node| remove_from(&mut node.replies, id))
}
