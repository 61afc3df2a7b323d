use crate::{models::SqlProfile, Db};
use chrono::Utc;
use domain::AuthorProfile;

/// Cached profiles older than this are treated as missing.
pub const PROFILE_TTL_HOURS: i64 = 24;

impl Db {
    // Local profile cache
    pub async fn get_cached_profile(&self, user_id: &str) -> anyhow::Result<Option<AuthorProfile>> {
        let threshold = Utc::now() - chrono::Duration::hours(PROFILE_TTL_HOURS);

        let profile = sqlx::query_as::<_, SqlProfile>(
            r#"
            SELECT user_id, display_name, avatar_url
            FROM profile_cache
            WHERE user_id = ? AND last_updated_at > ?
            "#,
        )
        .bind(user_id)
        .bind(threshold)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile.map(Into::into))
    }

    pub async fn get_cached_profiles(&self, user_ids: &[String]) -> anyhow::Result<Vec<AuthorProfile>> {
        let mut found = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            if let Some(profile) = self.get_cached_profile(user_id).await? {
                found.push(profile);
            }
        }
        Ok(found)
    }

    pub async fn upsert_cached_profile(&self, profile: &AuthorProfile) -> anyhow::Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO profile_cache (user_id, display_name, avatar_url, last_updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                avatar_url = excluded.avatar_url,
                last_updated_at = excluded.last_updated_at
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.display_name)
        .bind(&profile.avatar_url)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Author directory of the bundled backing store
    pub async fn upsert_author(&self, profile: &AuthorProfile) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO authors (user_id, display_name, avatar_url)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                avatar_url = excluded.avatar_url
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.display_name)
        .bind(&profile.avatar_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_authors(&self, user_ids: &[String]) -> anyhow::Result<Vec<AuthorProfile>> {
        let mut found = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let row = sqlx::query_as::<_, SqlProfile>(
                "SELECT user_id, display_name, avatar_url FROM authors WHERE user_id = ?",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                found.push(row.into());
            }
        }
        Ok(found)
    }
}
