use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use domain::AuthorProfile;
use storage::Db;

use crate::traits::LocalStore;

#[async_trait]
impl LocalStore for Db {
    async fn load_liked(&self, viewer_id: &str) -> Result<HashMap<String, bool>> {
        self.load_liked_state(viewer_id).await
    }

    async fn save_liked(&self, viewer_id: &str, comment_id: &str, liked: bool) -> Result<()> {
        self.save_liked_state(viewer_id, comment_id, liked).await
    }

    async fn load_profiles(&self, user_ids: &[String]) -> Result<Vec<AuthorProfile>> {
        self.get_cached_profiles(user_ids).await
    }

    async fn save_profiles(&self, profiles: &[AuthorProfile]) -> Result<()> {
        for profile in profiles {
            self.upsert_cached_profile(profile).await?;
        }
        Ok(())
    }
}
