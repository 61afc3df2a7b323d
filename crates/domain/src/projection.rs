//! Render-time view of a discussion tree.
//!
//! Nodes nest normally down to `max_depth`. A node sitting at `max_depth`
//! keeps no nested replies: its whole subtree follows it in pre-order, in the
//! same list and at the same visual depth. Every projected comment keeps its
//! real `parent_id`, so replying to it still targets the logical tree.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AuthorProfile, CommentNode};

pub const DEFAULT_MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedComment {
    pub id: String,
    pub text: String,
    pub author_id: String,
    pub author: Option<AuthorProfile>,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<String>,
    /// Comment this one is drawn under. Differs from `parent_id` only for
    /// flattened comments.
    pub anchor_id: Option<String>,
    pub depth: usize,
    pub flattened: bool,
    pub like_count: u32,
    pub liked: bool,
    pub replies: Vec<ProjectedComment>,
}

impl ProjectedComment {
    /// Id a reply to this comment must be stored under.
    pub fn reply_target(&self) -> &str {
        &self.id
    }

    pub fn find(&self, id: &str) -> Option<&ProjectedComment> {
        if self.id == id {
            return Some(self);
        }
        self.replies.iter().find_map(|r| r.find(id))
    }
}

/// Per-viewer decorations layered over the authoritative tree.
#[derive(Debug, Clone, Default)]
pub struct ViewContext {
    pub authors: HashMap<String, AuthorProfile>,
    pub liked: HashMap<String, bool>,
    /// Cosmetic like deltas of toggles not yet confirmed.
    pub like_deltas: HashMap<String, i64>,
}

impl ViewContext {
    fn decorate(&self, node: &CommentNode, depth: usize, anchor: Option<&str>) -> ProjectedComment {
        let record = &node.record;
        let delta = self.like_deltas.get(&record.id).copied().unwrap_or(0);
        let like_count = (i64::from(record.like_count) + delta).max(0);
        ProjectedComment {
            id: record.id.clone(),
            text: record.text.clone(),
            author_id: record.author_id.clone(),
            author: self.authors.get(&record.author_id).cloned(),
            created_at: record.created_at,
            parent_id: record.parent_id.clone(),
            anchor_id: anchor.map(str::to_string),
            depth,
            flattened: anchor != record.parent_id.as_deref(),
            like_count: u32::try_from(like_count).unwrap_or(u32::MAX),
            liked: self.liked.get(&record.id).copied().unwrap_or(false),
            replies: Vec::new(),
        }
    }
}

pub fn project(roots: &[CommentNode], max_depth: usize, ctx: &ViewContext) -> Vec<ProjectedComment> {
    let mut out = Vec::with_capacity(roots.len());
    for node in roots {
        project_into(node, 0, None, max_depth, ctx, &mut out);
    }
    out
}

fn project_into(
    node: &CommentNode,
    depth: usize,
    anchor: Option<&str>,
    max_depth: usize,
    ctx: &ViewContext,
    out: &mut Vec<ProjectedComment>,
) {
    let mut projected = ctx.decorate(node, depth, anchor);
    if depth < max_depth {
        for reply in &node.replies {
            project_into(reply, depth + 1, Some(node.id()), max_depth, ctx, &mut projected.replies);
        }
        out.push(projected);
    } else {
        out.push(projected);
        flatten_descendants(node, depth, anchor, ctx, out);
    }
}

fn flatten_descendants(
    node: &CommentNode,
    depth: usize,
    anchor: Option<&str>,
    ctx: &ViewContext,
    out: &mut Vec<ProjectedComment>,
) {
    for reply in &node.replies {
        out.push(ctx.decorate(reply, depth, anchor));
        flatten_descendants(reply, depth, anchor, ctx, out);
    }
}
