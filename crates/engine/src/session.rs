use std::collections::{HashMap, HashSet};

use domain::projection::{self, ProjectedComment, ViewContext};
use domain::{
    ChangeEvent, CommentNode, CommentRecord, DiscussionId, DiscussionTree, SessionPhase, SyncError,
};

use crate::cache::{AuthorCache, LikedCache};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Stage {
    Loading,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone)]
pub(crate) struct PendingLike {
    /// Liked flag before the toggle, restored on rollback.
    pub previous: bool,
    pub delta: i64,
    pub new_count: u32,
    /// Set once a stored like count arrived after the toggle; the delta is
    /// then no longer shown and confirmation keeps the stored count.
    pub superseded: bool,
}

/// Everything one open discussion knows, mutated only by its own driver.
///
/// No I/O happens here: the driver performs fetches and writes and feeds their
/// results back in. `revision` moves whenever something visible changes.
pub struct SessionState {
    pub(crate) discussion_id: DiscussionId,
    pub(crate) viewer_id: String,
    pub(crate) stage: Stage,
    pub(crate) tree: DiscussionTree,
    pub(crate) queued: Vec<ChangeEvent>,
    pub(crate) reply_target: Option<String>,
    /// Local ids of posts waiting for the store.
    pub(crate) pending_posts: HashSet<String>,
    pub(crate) pending_likes: HashMap<String, PendingLike>,
    pub(crate) liked: LikedCache,
    /// The viewer's own flags, loaded from the local store when the session
    /// opens. Never evicted, so a toggle always sees the persisted flag.
    pub(crate) own_likes: HashMap<String, bool>,
    revision: u64,
}

impl SessionState {
    pub fn new(discussion_id: DiscussionId, viewer_id: impl Into<String>, liked: LikedCache) -> Self {
        Self {
            discussion_id,
            viewer_id: viewer_id.into(),
            stage: Stage::Loading,
            tree: DiscussionTree::new(),
            queued: Vec::new(),
            reply_target: None,
            pending_posts: HashSet::new(),
            pending_likes: HashMap::new(),
            liked,
            own_likes: HashMap::new(),
            revision: 0,
        }
    }

    pub fn discussion_id(&self) -> &DiscussionId {
        &self.discussion_id
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn tree(&self) -> &DiscussionTree {
        &self.tree
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_ready(&self) -> bool {
        self.stage == Stage::Ready
    }

    pub fn phase(&self) -> SessionPhase {
        match &self.stage {
            Stage::Loading => SessionPhase::Loading,
            Stage::Ready => SessionPhase::Ready {
                pending_mutations: self.pending_posts.len() + self.pending_likes.len(),
            },
            Stage::Failed(reason) => SessionPhase::Error {
                reason: reason.clone(),
            },
        }
    }

    /// Seeds the viewer's persisted liked flags.
    pub fn restore_liked(&mut self, entries: HashMap<String, bool>) {
        self.own_likes.extend(entries);
        self.touch();
    }

    /// Session map first, then the shared cache.
    pub(crate) fn is_liked(&self, comment_id: &str) -> bool {
        match self.own_likes.get(comment_id) {
            Some(liked) => *liked,
            None => self.liked.get(&self.viewer_id, comment_id),
        }
    }

    pub(crate) fn set_liked(&mut self, comment_id: &str, liked: bool) {
        self.own_likes.insert(comment_id.to_string(), liked);
        self.liked.set(&self.viewer_id, comment_id, liked);
    }

    pub(crate) fn touch(&mut self) {
        self.revision += 1;
    }

    /// Installs a fetched record set.
    ///
    /// The first successful load organizes the tree and replays events that
    /// arrived meanwhile. Later loads are folded into the existing tree.
    /// Returns the number of records that changed the tree.
    pub fn load(&mut self, records: Vec<CommentRecord>) -> usize {
        if self.stage != Stage::Ready {
            let count = records.len();
            self.tree = DiscussionTree::organize(records);
            self.stage = Stage::Ready;
            for event in std::mem::take(&mut self.queued) {
                self.apply_change(event);
            }
            self.touch();
            return count;
        }

        let before: HashMap<String, u32> = self
            .pending_likes
            .keys()
            .filter_map(|id| self.tree.find(id).map(|n| (id.clone(), n.record.like_count)))
            .collect();
        let changed = self.tree.reconcile(records);
        for (id, count) in before {
            let current = self.tree.find(&id).map(|n| n.record.like_count);
            if current != Some(count) {
                if let Some(pending) = self.pending_likes.get_mut(&id) {
                    pending.superseded = true;
                }
            }
        }
        if changed > 0 {
            self.touch();
        }
        changed
    }

    /// Records a failed load. A tree that is already loaded stays as it is;
    /// otherwise the queued events are dropped, since a retry re-reads everything.
    pub fn fetch_failed(&mut self, reason: String) {
        if self.stage != Stage::Ready {
            self.stage = Stage::Failed(reason);
            self.queued.clear();
        }
    }

    /// Moves a failed session back to loading. False if there was nothing to
    /// retry.
    pub fn retry(&mut self) -> bool {
        if matches!(self.stage, Stage::Failed(_)) {
            self.stage = Stage::Loading;
            return true;
        }
        false
    }

    pub fn reply_target(&self) -> Option<&str> {
        self.reply_target.as_deref()
    }

    pub fn set_reply_target(&mut self, comment_id: Option<String>) -> Result<(), SyncError> {
        if let Some(ref id) = comment_id {
            self.ensure_confirmed(id)?;
        }
        self.reply_target = comment_id;
        Ok(())
    }

    /// The comment must be attached and not one of our unconfirmed posts.
    pub(crate) fn ensure_confirmed(&self, comment_id: &str) -> Result<(), SyncError> {
        if self.pending_posts.contains(comment_id) {
            return Err(SyncError::Unconfirmed(comment_id.to_string()));
        }
        if self.tree.find(comment_id).is_none() {
            return Err(SyncError::UnknownComment(comment_id.to_string()));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<CommentNode> {
        self.tree.roots().to_vec()
    }

    pub fn like_deltas(&self) -> HashMap<String, i64> {
        self.pending_likes
            .iter()
            .filter(|(_, p)| !p.superseded)
            .map(|(id, p)| (id.clone(), p.delta))
            .collect()
    }

    pub fn projection(&self, max_depth: usize, authors: &AuthorCache) -> Vec<ProjectedComment> {
        let mut comment_ids = Vec::new();
        let mut author_ids = HashSet::new();
        collect_ids(self.tree.roots(), &mut comment_ids, &mut author_ids);

        let ctx = ViewContext {
            authors: authors.lookup(author_ids.iter()),
            liked: comment_ids
                .iter()
                .filter(|id| self.is_liked(id))
                .map(|id| (id.clone(), true))
                .collect(),
            like_deltas: self.like_deltas(),
        };
        projection::project(self.tree.roots(), max_depth, &ctx)
    }
}

fn collect_ids(nodes: &[CommentNode], comment_ids: &mut Vec<String>, author_ids: &mut HashSet<String>) {
    for node in nodes {
        comment_ids.push(node.record.id.clone());
        author_ids.insert(node.record.author_id.clone());
        collect_ids(&node.replies, comment_ids, author_ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeOutcome;
    use crate::testing::{record_by, session};
    use domain::CommentPatch;

    #[test]
    fn test_phase_transitions() {
        let mut state = session("me");
        assert_eq!(state.phase(), SessionPhase::Loading);

        state.fetch_failed("boom".to_string());
        assert!(matches!(state.phase(), SessionPhase::Error { .. }));
        assert!(state.retry());
        assert_eq!(state.phase(), SessionPhase::Loading);

        state.load(vec![record_by("a", None, "bob")]);
        assert_eq!(state.phase(), SessionPhase::Ready { pending_mutations: 0 });

        state.fetch_failed("again".to_string());
        assert!(state.is_ready());
        assert_eq!(state.tree().len(), 1);
        assert!(!state.retry());
    }

    #[test]
    fn test_events_during_loading_are_replayed() {
        let mut state = session("me");
        state.apply_change(ChangeEvent::Inserted(record_by("late", Some("a"), "bob")));
        state.apply_change(ChangeEvent::Updated(CommentPatch::like_count("a", 9)));
        assert!(state.tree().is_empty());

        state.load(vec![record_by("a", None, "bob")]);
        let a = state.tree().find("a").unwrap();
        assert_eq!(a.record.like_count, 9);
        assert_eq!(a.replies.len(), 1);
    }

    #[test]
    fn test_failed_load_drops_queued_events() {
        let mut state = session("me");
        state.apply_change(ChangeEvent::Inserted(record_by("early", None, "bob")));
        assert_eq!(state.queued.len(), 1);

        state.fetch_failed("boom".to_string());
        assert!(state.queued.is_empty());
        assert_eq!(
            state.apply_change(ChangeEvent::Updated(CommentPatch::like_count("early", 3))),
            MergeOutcome::Discarded
        );
        assert!(state.queued.is_empty());

        assert!(state.retry());
        assert_eq!(
            state.apply_change(ChangeEvent::Inserted(record_by("late", None, "bob"))),
            MergeOutcome::Queued
        );
        state.load(vec![record_by("early", None, "bob")]);
        assert_eq!(state.tree().len(), 2);
        assert_eq!(state.tree().find("early").unwrap().record.like_count, 0);
    }

    #[test]
    fn test_reply_target_must_be_known() {
        let mut state = session("me");
        state.load(vec![record_by("a", None, "bob")]);
        assert!(state.set_reply_target(Some("a".to_string())).is_ok());
        assert_eq!(state.reply_target(), Some("a"));
        assert_eq!(
            state.set_reply_target(Some("nope".to_string())),
            Err(SyncError::UnknownComment("nope".to_string()))
        );
        assert_eq!(state.reply_target(), Some("a"));
        state.set_reply_target(None).unwrap();
        assert_eq!(state.reply_target(), None);
    }

    #[test]
    fn test_refetch_folds_into_existing_tree() {
        let mut state = session("me");
        state.load(vec![record_by("a", None, "bob")]);
        let rev = state.revision();

        let changed = state.load(vec![
            record_by("b", Some("a"), "ann"),
            record_by("a", None, "bob"),
        ]);
        assert_eq!(changed, 1);
        assert!(state.revision() > rev);
        assert_eq!(state.tree().find("a").unwrap().replies.len(), 1);

        let rev = state.revision();
        assert_eq!(state.load(vec![record_by("a", None, "bob")]), 0);
        assert_eq!(state.revision(), rev);
    }
}
