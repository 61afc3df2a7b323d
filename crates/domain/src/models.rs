use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscussionId(String);

impl DiscussionId {
    pub fn new(s: impl Into<String>) -> Result<Self, String> {
        let s = s.into();
        if s.is_empty() {
            return Err("Discussion ID cannot be empty.".to_string());
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err("Discussion ID contains invalid characters.".to_string());
        }
        if s.len() > 128 {
            return Err("Discussion ID is too long (max 128 chars).".to_string());
        }
        Ok(Self(s))
    }

    pub fn new_unchecked(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiscussionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A comment exactly as the backing store hands it out: flat, parent by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: String,
    pub text: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<String>,
    pub like_count: u32,
    pub discussion_id: DiscussionId,
}

impl CommentRecord {
    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Overwrites the fields a patch carries, leaving the rest alone.
    pub fn apply(&mut self, patch: &CommentPatch) {
        if let Some(ref text) = patch.text {
            self.text = text.clone();
        }
        if let Some(count) = patch.like_count {
            self.like_count = count;
        }
    }
}

/// Tree form of a comment. `replies` keep discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentNode {
    #[serde(flatten)]
    pub record: CommentRecord,
    pub replies: Vec<CommentNode>,
}

impl CommentNode {
    pub fn new(record: CommentRecord) -> Self {
        Self {
            record,
            replies: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn subtree_len(&self) -> usize {
        1 + self.replies.iter().map(CommentNode::subtree_len).sum::<usize>()
    }
}

/// Partial record carried by an update notification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommentPatch {
    pub id: String,
    pub text: Option<String>,
    pub like_count: Option<u32>,
}

impl CommentPatch {
    pub fn like_count(id: impl Into<String>, count: u32) -> Self {
        Self {
            id: id.into(),
            text: None,
            like_count: Some(count),
        }
    }

    /// Folds a later patch for the same id into this one.
    pub fn merge(&mut self, later: CommentPatch) {
        if later.text.is_some() {
            self.text = later.text;
        }
        if later.like_count.is_some() {
            self.like_count = later.like_count;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl AuthorProfile {
    /// Placeholder used when the directory has no entry for a user.
    pub fn anonymous(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            display_name: user_id.clone(),
            user_id,
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionPhase {
    Loading,
    Ready { pending_mutations: usize },
    Error { reason: String },
}

impl SessionPhase {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionPhase::Ready { .. })
    }
}
