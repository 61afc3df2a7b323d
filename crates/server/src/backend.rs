use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use domain::{AuthorProfile, ChangeEvent, CommentPatch, CommentRecord, DiscussionId};
use engine::{ChangeHub, CommentBackend, Subscription};
use storage::Db;
use tracing::debug;

/// Backing store served by this process: SQLite for the records and an
/// in-process hub for the change feed.
#[derive(Clone)]
pub struct StoreBackend {
    db: Db,
    hub: ChangeHub,
}

impl StoreBackend {
    pub fn new(db: Db, hub: ChangeHub) -> Self {
        Self { db, hub }
    }
}

#[async_trait]
impl CommentBackend for StoreBackend {
    async fn fetch_comments(&self, discussion_id: &DiscussionId) -> Result<Vec<CommentRecord>> {
        self.db.list_comments(discussion_id.as_str()).await
    }

    async fn insert_comment(
        &self,
        discussion_id: &DiscussionId,
        author_id: &str,
        text: &str,
        parent_id: Option<&str>,
    ) -> Result<CommentRecord> {
        if let Some(parent) = parent_id {
            match self.db.get_comment(parent).await? {
                Some(p) if &p.discussion_id == discussion_id => {}
                _ => return Err(anyhow!("Parent comment {} not found in {}", parent, discussion_id)),
            }
        }

        let record = CommentRecord {
            id: format!("c{:016x}", rand::random::<u64>()),
            text: text.to_string(),
            author_id: author_id.to_string(),
            created_at: Utc::now(),
            parent_id: parent_id.map(str::to_string),
            like_count: 0,
            discussion_id: discussion_id.clone(),
        };
        self.db.insert_comment(&record).await?;
        debug!("Stored comment {} in {}", record.id, discussion_id);

        self.hub.publish(discussion_id, ChangeEvent::Inserted(record.clone()));
        Ok(record)
    }

    async fn update_like_count(&self, comment_id: &str, new_count: u32) -> Result<()> {
        let record = self
            .db
            .get_comment(comment_id)
            .await?
            .ok_or_else(|| anyhow!("Comment {} not found", comment_id))?;
        if !self.db.update_like_count(comment_id, new_count).await? {
            return Err(anyhow!("Comment {} disappeared during update", comment_id));
        }
        self.hub.publish(
            &record.discussion_id,
            ChangeEvent::Updated(CommentPatch::like_count(comment_id, new_count)),
        );
        Ok(())
    }

    async fn subscribe(&self, discussion_id: &DiscussionId) -> Result<Subscription> {
        Ok(self.hub.subscribe(discussion_id))
    }

    /// Unregistered users still get a placeholder profile.
    async fn fetch_author_profiles(&self, user_ids: &[String]) -> Result<Vec<AuthorProfile>> {
        let known = self.db.get_authors(user_ids).await?;
        Ok(user_ids
            .iter()
            .map(|id| {
                known
                    .iter()
                    .find(|p| &p.user_id == id)
                    .cloned()
                    .unwrap_or_else(|| AuthorProfile::anonymous(id.clone()))
            })
            .collect())
    }
}
