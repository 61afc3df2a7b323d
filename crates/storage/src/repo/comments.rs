use crate::{models::SqlComment, Db};
use domain::CommentRecord;

impl Db {
    pub async fn insert_comment(&self, c: &CommentRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO comments (
                id, discussion_id, author_id, text, parent_id, like_count, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&c.id)
        .bind(c.discussion_id.as_str())
        .bind(&c.author_id)
        .bind(&c.text)
        .bind(&c.parent_id)
        .bind(i64::from(c.like_count))
        .bind(c.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns false when no comment has that id.
    pub async fn update_like_count(&self, comment_id: &str, count: u32) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE comments SET like_count = ? WHERE id = ?")
            .bind(i64::from(count))
            .bind(comment_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_comment(&self, comment_id: &str) -> anyhow::Result<Option<CommentRecord>> {
        let row = sqlx::query_as::<_, SqlComment>(
            r#"
            SELECT id, discussion_id, author_id, text, parent_id, like_count, created_at
            FROM comments
            WHERE id = ?
            "#,
        )
        .bind(comment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Whole discussion, newest first.
    pub async fn list_comments(&self, discussion_id: &str) -> anyhow::Result<Vec<CommentRecord>> {
        let rows = sqlx::query_as::<_, SqlComment>(
            r#"
            SELECT id, discussion_id, author_id, text, parent_id, like_count, created_at
            FROM comments
            WHERE discussion_id = ?
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(discussion_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
