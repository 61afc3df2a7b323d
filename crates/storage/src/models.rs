use chrono::{DateTime, Utc};
use domain::{AuthorProfile, CommentRecord, DiscussionId};
use sqlx::FromRow;

#[derive(FromRow)]
pub struct SqlComment {
    pub id: String,
    pub discussion_id: String,
    pub author_id: String,
    pub text: String,
    pub parent_id: Option<String>,
    pub like_count: i64,
    pub created_at: DateTime<Utc>,
}

impl From<SqlComment> for CommentRecord {
    fn from(sql: SqlComment) -> Self {
        CommentRecord {
            id: sql.id,
            text: sql.text,
            author_id: sql.author_id,
            created_at: sql.created_at,
            parent_id: sql.parent_id,
            like_count: u32::try_from(sql.like_count.max(0)).unwrap_or(u32::MAX),
            discussion_id: DiscussionId::new_unchecked(sql.discussion_id),
        }
    }
}

#[derive(FromRow)]
pub struct SqlProfile {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl From<SqlProfile> for AuthorProfile {
    fn from(sql: SqlProfile) -> Self {
        AuthorProfile {
            user_id: sql.user_id,
            display_name: sql.display_name,
            avatar_url: sql.avatar_url,
        }
    }
}

#[derive(FromRow)]
pub struct SqlLiked {
    pub comment_id: String,
    pub liked: bool,
}
