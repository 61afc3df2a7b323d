//! Optimistic local mutations: apply now, confirm or roll back later.

use chrono::{DateTime, Utc};
use domain::{CommentPatch, CommentRecord, Placement, SyncError};
use tracing::{info, warn};

use crate::session::{PendingLike, SessionState};

const LOCAL_ID_PREFIX: &str = "local-";

/// What the driver needs to issue the remote insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDraft {
    pub local_id: String,
    pub text: String,
    pub parent_id: Option<String>,
}

/// What the driver needs to issue the remote like write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeDraft {
    pub liked: bool,
    pub new_count: u32,
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

impl SessionState {
    /// Inserts a locally built comment right away.
    ///
    /// An explicit `parent_id` wins over the reply target. The reply target is
    /// cleared once the comment is in the tree.
    pub fn begin_post(
        &mut self,
        text: String,
        parent_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<PostDraft, SyncError> {
        if !self.is_ready() {
            return Err(SyncError::NotReady);
        }
        let parent_id = parent_id.or_else(|| self.reply_target.clone());
        if let Some(ref parent) = parent_id {
            self.ensure_confirmed(parent)?;
        }

        let local_id = format!("{}{:x}", LOCAL_ID_PREFIX, rand::random::<u64>());
        let record = CommentRecord {
            id: local_id.clone(),
            text: text.clone(),
            author_id: self.viewer_id.clone(),
            created_at: now,
            parent_id: parent_id.clone(),
            like_count: 0,
            discussion_id: self.discussion_id.clone(),
        };
        self.tree.insert(record, Placement::Front);
        self.pending_posts.insert(local_id.clone());
        self.reply_target = None;
        self.touch();

        Ok(PostDraft {
            local_id,
            text,
            parent_id,
        })
    }

    /// Adopts the stored record for a local post. False if the session no
    /// longer tracks that post.
    pub fn confirm_post(&mut self, local_id: &str, stored: CommentRecord) -> bool {
        if !self.pending_posts.remove(local_id) {
            return false;
        }
        let stored_id = stored.id.clone();
        if !self.tree.confirm(local_id, stored) {
            info!("Post {} already present as {}, dropped local copy", local_id, stored_id);
        }
        self.touch();
        true
    }

    /// Removes a rejected local post.
    pub fn fail_post(&mut self, local_id: &str) -> bool {
        if !self.pending_posts.remove(local_id) {
            return false;
        }
        if self.tree.remove(local_id).is_none() {
            warn!("Rejected post {} was no longer in the tree", local_id);
        }
        self.touch();
        true
    }

    /// Flips the viewer's liked flag and records the cosmetic delta. The
    /// stored like count is left alone until the write is confirmed.
    pub fn begin_like(&mut self, comment_id: &str) -> Result<LikeDraft, SyncError> {
        if !self.is_ready() {
            return Err(SyncError::NotReady);
        }
        self.ensure_confirmed(comment_id)?;
        if self.pending_likes.contains_key(comment_id) {
            return Err(SyncError::LikeInFlight(comment_id.to_string()));
        }
        let current = self
            .tree
            .find(comment_id)
            .map(|n| n.record.like_count)
            .ok_or_else(|| SyncError::UnknownComment(comment_id.to_string()))?;

        let previous = self.is_liked(comment_id);
        let liked = !previous;
        let new_count = if liked {
            current.saturating_add(1)
        } else {
            current.saturating_sub(1)
        };

        self.set_liked(comment_id, liked);
        self.pending_likes.insert(
            comment_id.to_string(),
            PendingLike {
                previous,
                delta: i64::from(new_count) - i64::from(current),
                new_count,
                superseded: false,
            },
        );
        self.touch();

        Ok(LikeDraft { liked, new_count })
    }

    /// Makes the written count authoritative, unless a newer stored count
    /// arrived in the meantime. Returns the count now on the node.
    pub fn confirm_like(&mut self, comment_id: &str) -> Option<u32> {
        let pending = self.pending_likes.remove(comment_id)?;
        if !pending.superseded {
            self.tree
                .apply_patch(CommentPatch::like_count(comment_id, pending.new_count));
        }
        self.touch();
        self.tree.find(comment_id).map(|n| n.record.like_count)
    }

    /// Restores the liked flag from before the toggle and drops the delta.
    /// Returns the restored flag.
    pub fn rollback_like(&mut self, comment_id: &str) -> Option<bool> {
        let pending = self.pending_likes.remove(comment_id)?;
        self.set_liked(comment_id, pending.previous);
        self.touch();
        Some(pending.previous)
    }
}
