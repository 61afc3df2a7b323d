use crate::{models::SqlLiked, Db};
use chrono::Utc;
use std::collections::HashMap;

impl Db {
    pub async fn load_liked_state(&self, viewer_id: &str) -> anyhow::Result<HashMap<String, bool>> {
        let rows = sqlx::query_as::<_, SqlLiked>(
            "SELECT comment_id, liked FROM liked_state WHERE viewer_id = ?",
        )
        .bind(viewer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.comment_id, r.liked)).collect())
    }

    pub async fn save_liked_state(
        &self,
        viewer_id: &str,
        comment_id: &str,
        liked: bool,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO liked_state (viewer_id, comment_id, liked, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(viewer_id, comment_id) DO UPDATE SET
                liked = excluded.liked,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(viewer_id)
        .bind(comment_id)
        .bind(liked)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
