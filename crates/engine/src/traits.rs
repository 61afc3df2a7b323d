use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use domain::{AuthorProfile, CommentRecord, DiscussionId};

use crate::subscription::Subscription;

/// Remote store holding the discussions. Failures are plain `anyhow` errors;
/// the engine decides whether they count as fetch or write failures.
#[async_trait]
pub trait CommentBackend: Send + Sync {
    /// Every comment of the discussion, newest first.
    async fn fetch_comments(&self, discussion_id: &DiscussionId) -> Result<Vec<CommentRecord>>;

    /// Stores a new comment; the store assigns id and timestamp.
    async fn insert_comment(
        &self,
        discussion_id: &DiscussionId,
        author_id: &str,
        text: &str,
        parent_id: Option<&str>,
    ) -> Result<CommentRecord>;

    async fn update_like_count(&self, comment_id: &str, new_count: u32) -> Result<()>;

    async fn subscribe(&self, discussion_id: &DiscussionId) -> Result<Subscription>;

    async fn fetch_author_profiles(&self, user_ids: &[String]) -> Result<Vec<AuthorProfile>>;
}

/// Device-local persistence for liked state and resolved profiles.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn load_liked(&self, viewer_id: &str) -> Result<HashMap<String, bool>>;

    async fn save_liked(&self, viewer_id: &str, comment_id: &str, liked: bool) -> Result<()>;

    /// Fresh cached profiles among `user_ids`; unknown or stale ids are skipped.
    async fn load_profiles(&self, user_ids: &[String]) -> Result<Vec<AuthorProfile>>;

    async fn save_profiles(&self, profiles: &[AuthorProfile]) -> Result<()>;
}
